//! # Errors
//!
//! One error type for the whole pipeline. The variants follow how the service reacts to
//! them:
//!
//! - [`RagError::DataLoad`] is fatal at startup: without knowledge there is no service.
//! - [`RagError::EmbeddingUnavailable`] is recoverable: retrieval drops to the lexical tier.
//! - [`RagError::IncompatibleVector`] is recoverable: lexical tier now, cache rebuild later.
//! - [`RagError::Generation`] is surfaced to the caller as an error payload.
//! - [`RagError::Cache`] never escapes the cache: reads degrade to "absent", writes are skipped.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("failed to load knowledge from {path}: {reason}")]
    DataLoad { path: PathBuf, reason: String },
    #[error("embedding provider unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    IncompatibleVector { expected: usize, actual: usize },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("embedding cache error: {0}")]
    Cache(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RagError {
    pub(crate) fn data_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RagError::DataLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// `true` for failures the service absorbs by degrading instead of failing the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingUnavailable { .. }
                | RagError::IncompatibleVector { .. }
                | RagError::Cache(_)
        )
    }
}

pub type RagResult<T> = Result<T, RagError>;
