use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
    /// Hard cap on request bodies; base64 screenshots dominate the size.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            answer_timeout_secs: default_answer_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_answer_timeout_secs() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
    #[serde(default = "default_max_links")]
    pub max_links: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            max_prompt_chars: default_max_prompt_chars(),
            max_document_chars: default_max_document_chars(),
            max_links: default_max_links(),
        }
    }
}

fn default_max_documents() -> usize {
    5
}
fn default_max_prompt_chars() -> usize {
    12_000
}
fn default_max_document_chars() -> usize {
    2_000
}
fn default_max_links() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-3.5-turbo-0125".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    500
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_in_flight() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_engine")]
    pub engine: String,
    #[serde(default = "default_ocr_command")]
    pub command: String,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ocr_max_chars")]
    pub max_chars: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: default_ocr_engine(),
            command: default_ocr_command(),
            timeout_secs: default_ocr_timeout_secs(),
            max_chars: default_ocr_max_chars(),
        }
    }
}

fn default_ocr_engine() -> String {
    "tesseract".to_string()
}
fn default_ocr_command() -> String {
    "tesseract".to_string()
}
fn default_ocr_timeout_secs() -> u64 {
    10
}
fn default_ocr_max_chars() -> usize {
    1_000
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist, then apply environment overrides and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Apply `HOST`, `PORT` and `DATA_DIR` on top of the file configuration.
///
/// `lookup` is injected so tests do not depend on the process environment.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let (file_host, file_port) = match config.server.bind.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (config.server.bind.clone(), "8000".to_string()),
    };

    let host = lookup("HOST").filter(|h| !h.is_empty());
    let port = lookup("PORT").filter(|p| !p.is_empty());
    if host.is_some() || port.is_some() {
        config.server.bind = format!(
            "{}:{}",
            host.unwrap_or(file_host),
            port.unwrap_or(file_port)
        );
    }

    if let Some(dir) = lookup("DATA_DIR").filter(|d| !d.is_empty()) {
        config.data.dir = PathBuf::from(dir);
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.answer_timeout_secs == 0 {
        anyhow::bail!("server.answer_timeout_secs must be > 0");
    }
    if config.server.max_body_bytes == 0 {
        anyhow::bail!("server.max_body_bytes must be > 0");
    }

    // Validate context budget
    if config.context.max_documents == 0 {
        anyhow::bail!("context.max_documents must be >= 1");
    }
    if config.context.max_prompt_chars == 0 {
        anyhow::bail!("context.max_prompt_chars must be > 0");
    }
    if config.context.max_document_chars == 0
        || config.context.max_document_chars > config.context.max_prompt_chars
    {
        anyhow::bail!("context.max_document_chars must be in [1, context.max_prompt_chars]");
    }

    // Validate LLM
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.max_in_flight == 0 {
        anyhow::bail!("llm.max_in_flight must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    // Validate OCR
    match config.ocr.engine.as_str() {
        "disabled" | "tesseract" => {}
        other => anyhow::bail!(
            "Unknown ocr engine: '{}'. Must be disabled or tesseract.",
            other
        ),
    }
    if config.ocr.timeout_secs == 0 {
        anyhow::bail!("ocr.timeout_secs must be > 0");
    }

    Ok(())
}
