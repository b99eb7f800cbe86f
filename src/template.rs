//! # Prompt templates
//!
//! A template is a small YAML document controlling what the generative model sees:
//!
//! - `system_prompt` steers the model and opens the grounding payload,
//! - `context_header` introduces the retrieved records,
//! - `no_context_reply` is returned as-is when retrieval finds nothing,
//! - optional `pre_user_message_content` / `post_user_message_content` wrap every query.
//!
//! Templates live under the configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! ```yaml
//! system_prompt: "You are Gopala. Answer in the first person, using only the facts below."
//! context_header: "Facts:"
//! no_context_reply: "I don't have that information."
//! post_user_message_content: "Keep the answer under three sentences."
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::RagResult;
use crate::knowledge::KnowledgeRecord;

/// Default reply when nothing relevant was retrieved.
pub const NO_CONTEXT_REPLY: &str =
    "I don't have enough information to answer that question about this profile.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptTemplate {
    pub system_prompt: String,

    #[serde(default = "default_context_header")]
    pub context_header: String,

    #[serde(default = "default_no_context_reply")]
    pub no_context_reply: String,

    /// Added before each query at send time.
    #[serde(default)]
    pub pre_user_message_content: Option<String>,

    /// Added after each query at send time.
    #[serde(default)]
    pub post_user_message_content: Option<String>,
}

fn default_context_header() -> String {
    "Relevant information:".to_string()
}

fn default_no_context_reply() -> String {
    NO_CONTEXT_REPLY.to_string()
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prompt: "You answer questions about the person described below, speaking as \
                            that person. Use only the information provided. If it does not \
                            contain the answer, say you don't have that information."
                .to_string(),
            context_header: default_context_header(),
            no_context_reply: default_no_context_reply(),
            pre_user_message_content: None,
            post_user_message_content: None,
        }
    }
}

impl PromptTemplate {
    /// Grounding payload: system prompt, then the records in ranked order.
    pub fn render_grounding<'a, I>(&self, records: I) -> String
    where
        I: IntoIterator<Item = &'a KnowledgeRecord>,
    {
        let mut payload = format!("{}\n\n{}\n", self.system_prompt.trim_end(), self.context_header);
        for (rank, record) in records.into_iter().enumerate() {
            payload.push_str(&format!(
                "\n{}. Q: {}\n   A: {}\n",
                rank + 1,
                record.question.trim(),
                record.answer.trim()
            ));
        }
        payload
    }

    /// The query with the template's pre/post content applied.
    pub fn render_user_message(&self, query: &str) -> String {
        let mut message = String::new();
        if let Some(pre) = &self.pre_user_message_content {
            message.push_str(pre);
            message.push('\n');
        }
        message.push_str(query);
        if let Some(post) = &self.post_user_message_content {
            message.push('\n');
            message.push_str(post);
        }
        message
    }
}

/// Load a template by name from `<config_dir>/templates/<name>.yaml`.
pub fn load_template(name: &str) -> RagResult<PromptTemplate> {
    let path = crate::config_dir()?.join(format!("templates/{name}.yaml"));
    load_template_file(&path)
}

pub fn load_template_file(path: &Path) -> RagResult<PromptTemplate> {
    tracing::info!("Loading template: {}", path.display());
    let content = fs::read_to_string(path)?;
    let template: PromptTemplate = serde_yaml::from_str(&content)?;
    Ok(template)
}
