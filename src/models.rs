//! Core data models used throughout the assistant.
//!
//! These types represent the scraped documents the answers are grounded in,
//! and the question/answer shapes that cross the HTTP boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which scraper produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Course material from the GitHub course repository.
    Github,
    /// A post from the Discourse forum.
    Discourse,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Github => f.write_str("github"),
            Source::Discourse => f.write_str("discourse"),
        }
    }
}

/// A scraped document held in the content store.
///
/// Created only when the store is loaded; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedDocument {
    pub source: Source,
    /// File path for course material, `topic-<id>/<post_number>` for posts.
    pub identifier: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

/// Maximum characters of a forum post shown as link text.
const LINK_EXCERPT_CHARS: usize = 100;

impl ScrapedDocument {
    /// The link returned to the student for this document.
    ///
    /// Course material is labelled by its title; forum posts by an excerpt
    /// of what was said, since every post in a topic shares the title.
    pub fn link(&self) -> Link {
        let text = match self.source {
            Source::Github => self.title.clone(),
            Source::Discourse => {
                let flat = self.body.split_whitespace().collect::<Vec<_>>().join(" ");
                if flat.is_empty() {
                    self.title.clone()
                } else {
                    excerpt(&flat, LINK_EXCERPT_CHARS)
                }
            }
        };
        Link {
            url: self.url.clone(),
            text,
        }
    }
}

/// A student question as received by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "question")]
    pub text: String,
    /// Optional base64-encoded screenshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// A link cited in an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub text: String,
}

/// The response body of `POST /api/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
