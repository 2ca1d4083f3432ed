//! # TDS Virtual Teaching Assistant
//!
//! Answers student questions about a course from pre-scraped course
//! material and forum posts, with optional OCR of an attached screenshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────┐
//! │ JSON on disk │──▶│ContentStore │──▶│  Context  │──▶│   LLM    │
//! │ (scrapers)   │   │ (in memory) │   │ Assembler │   │(Completer)│
//! └──────────────┘   └─────────────┘   └─────▲─────┘   └────┬─────┘
//!                                            │ OCR text     │
//!                                      ┌─────┴─────┐   ┌────▼─────┐
//!                                      │TextExtract│   │ POST /api│
//!                                      └───────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Documents, questions and answers |
//! | [`store`] | Read-only in-memory content store |
//! | [`ocr`] | Image decoding and OCR capability |
//! | [`context`] | Ranking and budgeted prompt assembly |
//! | [`llm`] | LLM completion capability |
//! | [`answer`] | The answering pipeline |
//! | [`server`] | HTTP API |
//! | [`error`] | Error types |
//! | [`logging`] | Tracing subscriber setup |

pub mod answer;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod logging;
pub mod models;
pub mod ocr;
pub mod server;
pub mod store;
