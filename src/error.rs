//! Error types for the answering pipeline.
//!
//! Each stage has its own error enum so callers can decide which failures
//! are recoverable. Only [`AnswerError`] ever reaches an HTTP client; the
//! store and OCR errors are absorbed into degraded answers.

use std::path::PathBuf;
use thiserror::Error;

/// Content store loading failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No collection file exists under the data directory.
    #[error("content store unavailable: no scraped data under {}", .0.display())]
    Unavailable(PathBuf),

    /// A collection file exists but cannot be read or parsed.
    #[error("content store file {} is malformed: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// OCR failures. Always recovered by proceeding without image text.
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("OCR engine failed: {0}")]
    Engine(String),

    #[error("OCR timed out")]
    Timeout,

    #[error("OCR is disabled")]
    Disabled,
}

/// LLM provider failures.
#[derive(Error, Debug)]
pub enum LlmError {
    /// No provider configured (e.g. missing API key).
    #[error("LLM provider is not configured: {0}")]
    Disabled(String),

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("unexpected LLM response: {0}")]
    InvalidResponse(String),
}

/// Failures surfaced to API callers.
#[derive(Error, Debug)]
pub enum AnswerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("answer not produced before the response deadline")]
    Timeout,

    #[error("model output could not be used: {0}")]
    MalformedModelOutput(String),

    #[error("upstream LLM failure: {0}")]
    Upstream(String),
}

impl AnswerError {
    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AnswerError::InvalidInput(_) => "bad_request",
            AnswerError::Timeout => "timeout",
            AnswerError::MalformedModelOutput(_) => "malformed_model_output",
            AnswerError::Upstream(_) => "upstream_error",
        }
    }
}
