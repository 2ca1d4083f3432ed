//! In-memory content store of scraped course material and forum posts.
//!
//! The scraper jobs write two JSON collections into the data directory:
//!
//! | File | Producer | Shape |
//! |------|----------|-------|
//! | `course_content.json` | GitHub course scraper | `{ "<file>": { title, raw_content, url, last_updated } }` |
//! | `discourse_posts.json` | Discourse scraper | `{ "topic-<id>": { title, url, created_at, posts: [...] } }` |
//!
//! [`ContentStore::load`] reads both once, flattens them into
//! [`ScrapedDocument`]s (one per course file, one per forum post) and builds
//! the term index used by the context assembler. The store is immutable
//! afterwards and is shared across requests behind an `Arc`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::context::tokenize;
use crate::error::StoreError;
use crate::models::{ScrapedDocument, Source};

pub const COURSE_CONTENT_FILE: &str = "course_content.json";
pub const DISCOURSE_POSTS_FILE: &str = "discourse_posts.json";

/// Line width used when rendering forum HTML to text.
const HTML_TEXT_WIDTH: usize = 200;

// ============ On-disk shapes ============

#[derive(Debug, Deserialize)]
struct CourseEntry {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    raw_content: Option<String>,
    url: String,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscourseTopic {
    title: String,
    url: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    posts: Vec<DiscoursePost>,
}

#[derive(Debug, Deserialize)]
struct DiscoursePost {
    post_number: u64,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    content: String,
}

// ============ Store ============

/// How complete the loaded content is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    /// Both collections loaded.
    Loaded,
    /// One collection missing; the message names it.
    Partial(String),
    /// Nothing loaded; answers are produced without context.
    Degraded(String),
}

impl StoreStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StoreStatus::Loaded => "loaded",
            StoreStatus::Partial(_) => "partial",
            StoreStatus::Degraded(_) => "degraded",
        }
    }
}

/// Term frequencies of one document, split by field.
#[derive(Debug, Clone, Default)]
pub struct DocumentTerms {
    pub title: HashMap<String, u32>,
    pub body: HashMap<String, u32>,
    pub title_len: usize,
    pub body_len: usize,
}

impl DocumentTerms {
    fn from_document(doc: &ScrapedDocument) -> Self {
        let mut terms = DocumentTerms::default();
        for token in tokenize(&doc.title) {
            *terms.title.entry(token).or_insert(0) += 1;
            terms.title_len += 1;
        }
        for token in tokenize(&doc.body) {
            *terms.body.entry(token).or_insert(0) += 1;
            terms.body_len += 1;
        }
        terms
    }
}

/// Read-only collection of scraped documents plus their term index.
#[derive(Debug)]
pub struct ContentStore {
    documents: Vec<ScrapedDocument>,
    terms: Vec<DocumentTerms>,
    doc_freq: HashMap<String, usize>,
    status: StoreStatus,
}

impl ContentStore {
    /// Build a store from an in-memory document set.
    pub fn from_documents(documents: Vec<ScrapedDocument>) -> Self {
        Self::with_status(documents, StoreStatus::Loaded)
    }

    /// An empty store, used when the scraped data cannot be loaded.
    pub fn empty(reason: impl Into<String>) -> Self {
        Self::with_status(Vec::new(), StoreStatus::Degraded(reason.into()))
    }

    fn with_status(mut documents: Vec<ScrapedDocument>, status: StoreStatus) -> Self {
        // Sort for deterministic ordering
        documents.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });

        let terms: Vec<DocumentTerms> = documents.iter().map(DocumentTerms::from_document).collect();

        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for t in &terms {
            let mut seen: Vec<&String> = t.title.keys().chain(t.body.keys()).collect();
            seen.sort();
            seen.dedup();
            for term in seen {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }

        Self {
            documents,
            terms,
            doc_freq,
            status,
        }
    }

    /// Load both collections from `data_dir`.
    ///
    /// A collection that is missing or malformed is skipped and the store is
    /// [`StoreStatus::Partial`]. When neither loads, the error of the first
    /// malformed file is returned, or [`StoreError::Unavailable`] if both
    /// are simply missing.
    pub fn load(data_dir: &Path) -> Result<Self, StoreError> {
        let course_path = data_dir.join(COURSE_CONTENT_FILE);
        let discourse_path = data_dir.join(DISCOURSE_POSTS_FILE);

        let course = load_collection(&course_path, load_course_content);
        let discourse = load_collection(&discourse_path, load_discourse_posts);

        let (course, discourse) = match (course, discourse) {
            (Err(Some(e)), Err(_)) | (Err(None), Err(Some(e))) => return Err(e),
            (Err(None), Err(None)) => {
                return Err(StoreError::Unavailable(data_dir.to_path_buf()))
            }
            (course, discourse) => (course.ok(), discourse.ok()),
        };

        let status = match (&course, &discourse) {
            (Some(_), Some(_)) => StoreStatus::Loaded,
            (None, _) => StoreStatus::Partial(format!("{} not loaded", COURSE_CONTENT_FILE)),
            (_, None) => StoreStatus::Partial(format!("{} not loaded", DISCOURSE_POSTS_FILE)),
        };

        let mut documents = course.unwrap_or_default();
        documents.extend(discourse.unwrap_or_default());

        let store = Self::with_status(documents, status);
        let (github, discourse) = store.counts();
        tracing::info!(
            github,
            discourse,
            status = store.status.label(),
            "content store loaded"
        );
        Ok(store)
    }

    /// Like [`load`](Self::load), but degrades to an empty store instead of
    /// failing so the server can still start.
    pub fn load_or_empty(data_dir: &Path) -> Self {
        match Self::load(data_dir) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "serving without scraped content");
                Self::empty(e.to_string())
            }
        }
    }

    pub fn documents(&self) -> &[ScrapedDocument] {
        &self.documents
    }

    /// Term index, parallel to [`documents`](Self::documents).
    pub fn terms(&self) -> &[DocumentTerms] {
        &self.terms
    }

    /// Number of documents containing `term` in any field.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }

    /// Mean weighted document length, used for BM25 normalisation.
    pub fn avg_len(&self, title_weight: f64) -> f64 {
        if self.terms.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .terms
            .iter()
            .map(|t| t.body_len as f64 + title_weight * t.title_len as f64)
            .sum();
        total / self.terms.len() as f64
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// `(github, discourse)` document counts.
    pub fn counts(&self) -> (usize, usize) {
        let github = self
            .documents
            .iter()
            .filter(|d| d.source == Source::Github)
            .count();
        (github, self.documents.len() - github)
    }

    pub fn status(&self) -> &StoreStatus {
        &self.status
    }
}

// ============ Loaders ============

/// Load one collection. `Err(None)` means the file does not exist;
/// `Err(Some(_))` means it exists but could not be read.
fn load_collection(
    path: &Path,
    loader: fn(&Path) -> Result<Vec<ScrapedDocument>, StoreError>,
) -> Result<Vec<ScrapedDocument>, Option<StoreError>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "collection file not found");
        return Err(None);
    }
    loader(path).map_err(|e| {
        tracing::error!(error = %e, "skipping collection");
        Some(e)
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let malformed = |reason: String| StoreError::Malformed {
        path: PathBuf::from(path),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))
}

fn load_course_content(path: &Path) -> Result<Vec<ScrapedDocument>, StoreError> {
    let entries: BTreeMap<String, CourseEntry> = read_json(path)?;

    Ok(entries
        .into_iter()
        .map(|(file, entry)| {
            let title = entry
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| file_stem(&file));
            ScrapedDocument {
                source: Source::Github,
                timestamp: entry
                    .last_updated
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                identifier: file,
                title,
                body: entry.raw_content.unwrap_or_default(),
                url: entry.url,
            }
        })
        .collect())
}

fn load_discourse_posts(path: &Path) -> Result<Vec<ScrapedDocument>, StoreError> {
    let topics: BTreeMap<String, DiscourseTopic> = read_json(path)?;

    let mut documents = Vec::new();
    for (topic_key, topic) in topics {
        let topic_ts = topic.created_at.as_deref().and_then(parse_timestamp);
        let topic_url = topic.url.trim_end_matches('/');

        for post in topic.posts {
            let timestamp = post
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .or(topic_ts)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

            documents.push(ScrapedDocument {
                source: Source::Discourse,
                identifier: format!("{}/{}", topic_key, post.post_number),
                title: topic.title.clone(),
                body: html_to_text(&post.content),
                url: format!("{}/{}", topic_url, post.post_number),
                timestamp,
            });
        }
    }
    Ok(documents)
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH)
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| html.to_string())
}

fn file_stem(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string())
}

/// Parse RFC 3339 timestamps, or naive ISO-8601 ones (assumed UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
