//! # profile_rag
//!
//! Retrieval-augmented question answering over a personal knowledge base: a fixed set of
//! question/answer pairs about one person. A query is embedded, matched against cached
//! record embeddings, and the best records are handed to a generative model as grounding
//! context.
//!
//! ## Pipeline
//!
//! ```text
//! knowledge.json ──► KnowledgeStore ──► EmbeddingCache ◄──► EmbeddingProvider
//!                                            │
//! query ──► embed ──► search (vector | lexical) ──► PromptTemplate ──► Generator ──► answer
//! ```
//!
//! - [`knowledge`] / [`profile`]: load and validate the records.
//! - [`embedding_cache`]: per-record vectors keyed by content fingerprint, persisted
//!   atomically, rebuilt when the model changes or too much of the collection changed.
//! - [`remote`] / [`provider`]: embedding calls with credential rotation, retry and timeout.
//! - [`search`]: cosine ranking with a lexical fallback tier.
//! - [`template`] / [`generation`]: grounding payload and chat-completion call.
//! - [`service`]: lifecycle and per-query orchestration.
//! - [`response`]: JSON payloads at the output boundary.
//!
//! ## Quick start
//!
//! ```no_run
//! use profile_rag::{config::load_config, service::RagService};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(profile_rag::config_dir()?.join("config.yaml"))?;
//! let service = RagService::from_config(&config).await?;
//! let result = service.answer("What's your name?").await?;
//! println!("{}", result.generated_answer);
//! # Ok(()) }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod commands;
pub mod config;
pub mod embedding_cache;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod profile;
pub mod provider;
pub mod remote;
pub mod response;
pub mod search;
pub mod service;
pub mod template;

use error::{RagError, RagResult};

/// Per-platform configuration directory (`~/.config/prag` on Linux).
///
/// Not created by this function.
pub fn config_dir() -> RagResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "profile-rag", "prag")
        .ok_or_else(|| RagError::Config("unable to determine config directory".into()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
