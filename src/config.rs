//! Loading and handling of the application's configuration.
//!
//! [`RagConfig`] is read from a YAML file by [`load_config`]. Every section and almost every
//! field has a default, so a minimal file only names the knowledge source:
//!
//! ```yaml
//! knowledge_path: "profile.json"
//! cache_path: "embeddings.bin"
//! embedding:
//!   model: "text-embedding-3-small"
//!   api_key_env: ["OPENAI_API_KEY", "OPENAI_API_KEY_2"]
//! generation:
//!   model: "gpt-4o-mini"
//!   api_key_env: ["OPENAI_API_KEY"]
//! retrieval:
//!   top_k: 3
//! ```
//!
//! ```no_run
//! use profile_rag::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.retrieval);
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::*;

use crate::error::{RagError, RagResult};
use crate::search::DEFAULT_TOP_K;

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RagConfig {
    /// Knowledge source: a JSON record array or a profile document.
    pub knowledge_path: PathBuf,

    /// Embedding cache manifest location.
    pub cache_path: PathBuf,

    /// Name of a prompt template under `<config_dir>/templates/`. Built-in default when unset.
    pub template: Option<String>,

    pub embedding: EmbeddingSettings,

    pub generation: GenerationSettings,

    pub retrieval: RetrievalSettings,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            knowledge_path: PathBuf::from("knowledge.json"),
            cache_path: PathBuf::from("embeddings.bin"),
            template: None,
            embedding: EmbeddingSettings::default(),
            generation: GenerationSettings::default(),
            retrieval: RetrievalSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Offline feature hashing.
    Hashing,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub kind: EmbeddingKind,
    pub api_base: String,
    pub model: String,
    /// Inline credentials, rotated in order.
    pub api_keys: Vec<String>,
    /// Environment variables holding further credentials.
    pub api_key_env: Vec<String>,
    pub rotation_window_secs: u64,
    /// Texts per embedding call during startup population.
    pub batch_size: usize,
    /// Embedding calls in flight during startup population.
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Requested output dimensionality, when the model supports it.
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::OpenAi,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_keys: Vec::new(),
            api_key_env: vec!["OPENAI_API_KEY".to_string()],
            rotation_window_secs: 60,
            batch_size: 32,
            concurrency: 2,
            timeout_secs: 10,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
            dimensions: None,
        }
    }
}

impl EmbeddingSettings {
    pub fn credentials(&self) -> Vec<String> {
        resolve_credentials(&self.api_keys, &self.api_key_env)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GenerationSettings {
    pub api_base: String,
    pub model: String,
    pub api_keys: Vec<String>,
    pub api_key_env: Vec<String>,
    pub rotation_window_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_keys: Vec::new(),
            api_key_env: vec!["OPENAI_API_KEY".to_string()],
            rotation_window_secs: 60,
            max_tokens: 512,
            temperature: 0.7,
            timeout_secs: 30,
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

impl GenerationSettings {
    pub fn credentials(&self) -> Vec<String> {
        resolve_credentials(&self.api_keys, &self.api_key_env)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Records handed to generation per query.
    pub top_k: usize,
    /// Stale fraction of the collection above which the whole cache is rebuilt.
    pub rebuild_threshold: f64,
    /// Query embeddings memoised in process.
    pub query_cache_size: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            rebuild_threshold: 0.5,
            query_cache_size: 256,
        }
    }
}

fn resolve_credentials(inline: &[String], env_names: &[String]) -> Vec<String> {
    let mut credentials: Vec<String> = inline.to_vec();
    for name in env_names {
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => credentials.push(value.trim().to_string()),
            _ => debug!("Credential variable {} is not set", name),
        }
    }
    credentials
}

impl RagConfig {
    /// Check value ranges serde cannot express.
    pub fn validate(&self) -> RagResult<()> {
        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.rebuild_threshold) {
            return Err(RagError::Config(
                "retrieval.rebuild_threshold must lie in [0, 1]".into(),
            ));
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(RagError::Config(
                "embedding.batch_size and embedding.concurrency must be at least 1".into(),
            ));
        }
        if self.embedding.timeout_secs == 0 || self.generation.timeout_secs == 0 {
            return Err(RagError::Config("timeouts must be at least one second".into()));
        }
        Ok(())
    }
}

/// Loads the application's configuration from a YAML file.
///
/// ### Errors
/// [`RagError::Io`] when the file cannot be read, [`RagError::Yaml`] when it does not parse,
/// [`RagError::Config`] when a value is out of range.
pub fn load_config(file: impl AsRef<Path>) -> RagResult<RagConfig> {
    let file = file.as_ref();
    info!("Loading config: {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: RagConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
