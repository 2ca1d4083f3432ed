//! Context assembly: rank scraped documents against a question and build a
//! prompt that fits a fixed character budget.
//!
//! Ranking is BM25 over lowercase alphanumeric tokens, with title matches
//! weighted [`TITLE_WEIGHT`] times a body match. The result is fully
//! deterministic: query terms are visited in sorted order and ties are
//! broken by timestamp (newest first) and then identifier.
//!
//! # Prompt layout
//!
//! ```text
//! Question: <question>
//!
//! Image text:
//! <ocr text>
//!
//! Context:
//!
//! ## <title>
//! URL: <url>
//! <body>
//! ...
//! ```
//!
//! The question and image text are placed first. When they alone exceed the
//! budget the image text is cut before the question. Documents are then
//! appended in rank order until the budget runs out, so the lowest-ranked
//! documents are the ones dropped.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::config::ContextConfig;
use crate::models::{truncate_chars, Link, ScrapedDocument};
use crate::store::ContentStore;

/// How many body occurrences a single title occurrence is worth.
pub const TITLE_WEIGHT: f64 = 3.0;

/// BM25 term-frequency saturation.
const BM25_K1: f64 = 1.2;
/// BM25 length normalisation.
const BM25_B: f64 = 0.75;

/// A document that only fits partially is kept if at least this many body
/// characters remain; otherwise it is dropped.
pub const MIN_SNIPPET_CHARS: usize = 200;

const QUESTION_LABEL: &str = "Question: ";
const IMAGE_LABEL: &str = "\n\nImage text:\n";
const CONTEXT_LABEL: &str = "\n\nContext:";

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "should", "that", "the", "this",
    "to", "use", "was", "we", "what", "when", "where", "which", "who", "why", "will", "with",
    "you", "your",
];

/// Split text into lowercase alphanumeric tokens, dropping stop words and
/// single characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// A document with its relevance score.
#[derive(Debug, Clone)]
pub struct RankedDocument<'a> {
    pub document: &'a ScrapedDocument,
    pub score: f64,
}

/// The output of [`build_context`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub prompt: String,
    /// Links of the documents included in the prompt, most relevant first.
    pub links: Vec<Link>,
}

/// Score every document against `query` and return the best `limit`.
///
/// Documents that share no term with the query are never returned.
pub fn rank_documents<'a>(query: &str, store: &'a ContentStore, limit: usize) -> Vec<RankedDocument<'a>> {
    let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    if query_terms.is_empty() || store.is_empty() {
        return Vec::new();
    }

    let n = store.len() as f64;
    let avg_len = store.avg_len(TITLE_WEIGHT).max(1.0);

    // idf per query term, in sorted term order
    let idfs: Vec<(&str, f64)> = query_terms
        .iter()
        .filter_map(|term| {
            let df = store.doc_freq(term);
            if df == 0 {
                return None;
            }
            let df = df as f64;
            Some((term.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln()))
        })
        .collect();

    if idfs.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<RankedDocument<'a>> = store
        .documents()
        .iter()
        .zip(store.terms())
        .filter_map(|(document, terms)| {
            let len = terms.body_len as f64 + TITLE_WEIGHT * terms.title_len as f64;
            let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len);

            let score: f64 = idfs
                .iter()
                .map(|(term, idf)| {
                    let title_tf = terms.title.get(*term).copied().unwrap_or(0) as f64;
                    let body_tf = terms.body.get(*term).copied().unwrap_or(0) as f64;
                    let tf = body_tf + TITLE_WEIGHT * title_tf;
                    if tf == 0.0 {
                        0.0
                    } else {
                        idf * tf * (BM25_K1 + 1.0) / (tf + norm)
                    }
                })
                .sum();

            (score > 0.0).then_some(RankedDocument { document, score })
        })
        .collect();

    // Sort: score desc, timestamp desc, identifier asc (deterministic)
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.document.timestamp.cmp(&a.document.timestamp))
            .then(a.document.identifier.cmp(&b.document.identifier))
    });
    ranked.truncate(limit);
    ranked
}

/// Build the prompt for `question` (plus optional OCR text) from the most
/// relevant documents in `store`.
///
/// The returned prompt never exceeds `settings.max_prompt_chars`
/// characters.
pub fn build_context(
    question: &str,
    ocr_text: Option<&str>,
    store: &ContentStore,
    settings: &ContextConfig,
) -> AssembledContext {
    let budget = settings.max_prompt_chars;
    let question = question.trim();
    let ocr = ocr_text.map(str::trim).filter(|t| !t.is_empty());

    let query = match ocr {
        Some(o) => format!("{} {}", question, o),
        None => question.to_string(),
    };
    let ranked = rank_documents(&query, store, settings.max_documents);

    let mut prompt = render_header(question, ocr, budget);
    let mut used = prompt.chars().count();
    let mut links = Vec::new();

    for (i, ranked_doc) in ranked.iter().enumerate() {
        let doc = ranked_doc.document;
        let label = if i == 0 { CONTEXT_LABEL } else { "" };
        let prefix = format!("{}\n\n## {}\nURL: {}\n", label, doc.title.trim(), doc.url);
        let body = truncate_chars(doc.body.trim(), settings.max_document_chars);

        let prefix_len = prefix.chars().count();
        let body_len = body.chars().count();
        let remaining = budget.saturating_sub(used);

        if prefix_len + body_len <= remaining {
            prompt.push_str(&prefix);
            prompt.push_str(body);
            used += prefix_len + body_len;
            links.push(doc.link());
            continue;
        }

        // Out of room: keep a shortened version of this document if enough
        // space is left, and drop everything ranked below it.
        let room = remaining.saturating_sub(prefix_len);
        if room >= MIN_SNIPPET_CHARS {
            prompt.push_str(&prefix);
            prompt.push_str(truncate_chars(body, room));
            links.push(doc.link());
        }
        tracing::debug!(
            kept = links.len(),
            dropped = ranked.len() - links.len(),
            "prompt budget reached"
        );
        break;
    }

    AssembledContext { prompt, links }
}

/// Render the question and image sections, cutting image text first and
/// then the question if they exceed `budget`.
fn render_header(question: &str, ocr: Option<&str>, budget: usize) -> String {
    let question_room = budget.saturating_sub(QUESTION_LABEL.len());
    let question = truncate_chars(question, question_room);
    let mut header = format!("{}{}", QUESTION_LABEL, question);

    if let Some(ocr) = ocr {
        let used = header.chars().count() + IMAGE_LABEL.len();
        let ocr_room = budget.saturating_sub(used);
        if ocr_room > 0 {
            header.push_str(IMAGE_LABEL);
            header.push_str(truncate_chars(ocr, ocr_room));
        }
    }

    // Only reachable when the budget is smaller than the label itself
    truncate_chars(&header, budget).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use chrono::{TimeZone, Utc};

    fn doc(source: Source, id: &str, title: &str, body: &str, day: u32) -> ScrapedDocument {
        ScrapedDocument {
            source,
            identifier: id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            url: format!("https://example.com/{}", id),
            timestamp: Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap(),
        }
    }

    fn course_store() -> ContentStore {
        ContentStore::from_documents(vec![
            doc(
                Source::Github,
                "web-scraping.md",
                "Web Scraping Tools",
                "Scrape pages with httpx, BeautifulSoup and Playwright.",
                1,
            ),
            doc(
                Source::Github,
                "docker.md",
                "Docker",
                "Containers package applications with their dependencies.",
                2,
            ),
            doc(
                Source::Discourse,
                "topic-7/1",
                "GA5 model question",
                "Should we use gpt-4o-mini or gpt-3.5-turbo for GA5?",
                3,
            ),
        ])
    }

    fn settings() -> ContextConfig {
        ContextConfig::default()
    }

    #[test]
    fn test_tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("What tool should I use for Web-Scraping in 2025?");
        assert_eq!(tokens, vec!["tool", "web", "scraping", "2025"]);
    }

    #[test]
    fn test_web_scraping_question_ranks_course_page_first() {
        let store = course_store();
        let ctx = build_context(
            "What tool should I use for web scraping in this course?",
            None,
            &store,
            &settings(),
        );
        assert_eq!(ctx.links[0].url, "https://example.com/web-scraping.md");
        assert_eq!(ctx.links[0].text, "Web Scraping Tools");
        assert!(ctx.prompt.contains("## Web Scraping Tools"));
        assert!(!ctx.prompt.contains("## Docker"));
    }

    #[test]
    fn test_build_context_is_deterministic() {
        let store = course_store();
        let q = "gpt model for GA5 scraping";
        let a = build_context(q, Some("docker containers"), &store, &settings());
        let b = build_context(q, Some("docker containers"), &store, &settings());
        assert_eq!(a, b);
    }

    #[test]
    fn test_ocr_text_contributes_to_ranking() {
        let store = course_store();
        let ctx = build_context("see screenshot", Some("docker containers"), &store, &settings());
        assert_eq!(ctx.links.len(), 1);
        assert_eq!(ctx.links[0].url, "https://example.com/docker.md");
        assert!(ctx.prompt.contains("Image text:\ndocker containers"));
    }

    #[test]
    fn test_equal_scores_prefer_newer_then_identifier() {
        let store = ContentStore::from_documents(vec![
            doc(Source::Github, "b.md", "Pandas", "pandas", 1),
            doc(Source::Github, "a.md", "Pandas", "pandas", 1),
            doc(Source::Github, "c.md", "Pandas", "pandas", 5),
        ]);
        let ranked = rank_documents("pandas", &store, 10);
        let ids: Vec<&str> = ranked.iter().map(|r| r.document.identifier.as_str()).collect();
        assert_eq!(ids, vec!["c.md", "a.md", "b.md"]);
    }

    #[test]
    fn test_unrelated_documents_are_not_selected() {
        let store = course_store();
        assert!(rank_documents("kubernetes helm", &store, 10).is_empty());
    }

    #[test]
    fn test_empty_store_yields_no_links() {
        let store = ContentStore::empty("no data");
        let ctx = build_context("How do I scrape?", None, &store, &settings());
        assert!(ctx.links.is_empty());
        assert_eq!(ctx.prompt, "Question: How do I scrape?");
    }

    #[test]
    fn test_max_documents_limit() {
        let docs = (1..=9)
            .map(|i| doc(Source::Github, &format!("{}.md", i), "Regex", "regex patterns", i))
            .collect();
        let store = ContentStore::from_documents(docs);
        let mut s = settings();
        s.max_documents = 4;
        let ctx = build_context("regex", None, &store, &s);
        assert_eq!(ctx.links.len(), 4);
    }

    #[test]
    fn test_budget_drops_lowest_relevance_first() {
        let long = "scraping ".repeat(200);
        let store = ContentStore::from_documents(vec![
            doc(Source::Github, "best.md", "Scraping scraping", &long, 1),
            doc(Source::Github, "mid.md", "Scraping", &long, 1),
            doc(Source::Github, "low.md", "Notes", &"scraping notes ".repeat(100), 1),
        ]);
        let mut s = settings();
        s.max_prompt_chars = 2_500;
        s.max_document_chars = 1_500;

        let ranked = rank_documents("scraping", &store, 10);
        assert_eq!(ranked[0].document.identifier, "best.md");

        let ctx = build_context("scraping", None, &store, &s);
        assert!(ctx.prompt.chars().count() <= s.max_prompt_chars);
        // best fits whole, mid is shortened, low is dropped
        let urls: Vec<&str> = ctx.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://example.com/best.md", "https://example.com/mid.md"]
        );
        assert!(!ctx.prompt.contains("low.md"));
    }

    #[test]
    fn test_oversized_question_and_ocr_stay_within_budget() {
        let store = course_store();
        let mut s = settings();
        s.max_prompt_chars = 300;
        let question = "scraping ".repeat(100);
        let ocr = "docker ".repeat(100);

        let ctx = build_context(&question, Some(&ocr), &store, &s);
        assert!(ctx.prompt.chars().count() <= 300);
        assert!(ctx.links.is_empty());
        // the question is kept before image text
        assert!(!ctx.prompt.contains("Image text"));
    }

    #[test]
    fn test_ocr_is_cut_before_question() {
        let store = ContentStore::empty("none");
        let mut s = settings();
        s.max_prompt_chars = 100;
        let ctx = build_context("short question", Some(&"x".repeat(500)), &store, &s);
        assert!(ctx.prompt.starts_with("Question: short question\n\nImage text:\nxxx"));
        assert_eq!(ctx.prompt.chars().count(), 100);
    }

    #[test]
    fn test_tiny_budget() {
        let store = ContentStore::empty("none");
        let mut s = settings();
        s.max_prompt_chars = 4;
        let ctx = build_context("anything", None, &store, &s);
        assert_eq!(ctx.prompt.chars().count(), 4);
    }
}
