//! OCR adapter for screenshots attached to questions.
//!
//! Images arrive base64-encoded in the request body. [`decode_image`]
//! validates them (base64 and a recognised image signature) before any
//! engine runs. Text extraction goes through the [`TextExtractor`] trait so
//! the answering pipeline can run against a fake in tests:
//!
//! - **[`TesseractExtractor`]**: pipes the image to the `tesseract` CLI.
//! - **[`DisabledExtractor`]**: always fails with [`OcrError::Disabled`].
//!
//! OCR is best-effort. Every failure is returned as an [`OcrError`] and the
//! caller carries on without image text.

use async_trait::async_trait;
use base64::Engine;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::OcrConfig;
use crate::error::OcrError;
use crate::models::truncate_chars;

/// Extracts text from decoded image bytes.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Engine name, for logs and `/health`.
    fn name(&self) -> &str;

    async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError>;
}

/// Image container formats accepted for OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    Webp,
}

impl ImageFormat {
    /// Identify the format from the file signature.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(ImageFormat::Tiff)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else if bytes.len() >= 14 && bytes.starts_with(b"BM") {
            Some(ImageFormat::Bmp)
        } else {
            None
        }
    }
}

/// Decode a base64 image, tolerating a `data:` URL prefix and line breaks.
///
/// Fails with [`OcrError::InvalidImage`] when the payload is not base64 or
/// the bytes are not a recognised image format.
pub fn decode_image(encoded: &str) -> Result<Vec<u8>, OcrError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(OcrError::InvalidImage("empty image payload".to_string()));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| OcrError::InvalidImage(format!("invalid base64: {}", e)))?;

    match ImageFormat::sniff(&bytes) {
        Some(_) => Ok(bytes),
        None => Err(OcrError::InvalidImage(
            "unrecognised image format".to_string(),
        )),
    }
}

/// Decode `encoded`, run OCR and return the trimmed text, cut to
/// `max_chars` characters.
pub async fn extract_from_base64(
    extractor: &dyn TextExtractor,
    encoded: &str,
    max_chars: usize,
) -> Result<String, OcrError> {
    let bytes = decode_image(encoded)?;
    let text = extractor.extract_text(&bytes).await?;
    Ok(truncate_chars(text.trim(), max_chars).to_string())
}

// ============ Disabled ============

/// Used when `ocr.engine = "disabled"`.
pub struct DisabledExtractor;

#[async_trait]
impl TextExtractor for DisabledExtractor {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn extract_text(&self, _image: &[u8]) -> Result<String, OcrError> {
        Err(OcrError::Disabled)
    }
}

// ============ Tesseract ============

/// Runs `<command> stdin stdout` and reads the recognised text from stdout.
pub struct TesseractExtractor {
    command: String,
    timeout: Duration,
}

impl TesseractExtractor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TextExtractor for TesseractExtractor {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError> {
        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OcrError::Engine(format!("failed to execute '{}': {}", self.command, e))
            })?;

        // Feed stdin concurrently so a chatty engine cannot block on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = image.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::debug!(error = %e, "OCR engine closed stdin early");
                }
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OcrError::Timeout)?
            .map_err(|e| OcrError::Engine(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Create the configured [`TextExtractor`].
///
/// | Config Value | Extractor |
/// |-------------|-----------|
/// | `"disabled"` | [`DisabledExtractor`] |
/// | `"tesseract"` | [`TesseractExtractor`] |
pub fn create_extractor(config: &OcrConfig) -> Arc<dyn TextExtractor> {
    match config.engine.as_str() {
        "tesseract" => Arc::new(TesseractExtractor::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
        )),
        _ => Arc::new(DisabledExtractor),
    }
}
