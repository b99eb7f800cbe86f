//! Payloads handed across the output boundary.
//!
//! A successful answer carries the generated text, the records it was grounded on and the
//! query. A failed one carries only an error message, never partial context.

use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::service::RetrievalResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub response: String,
    pub relevant_context: Vec<ContextItem>,
    pub query: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl From<RetrievalResult> for AnswerPayload {
    fn from(result: RetrievalResult) -> Self {
        Self {
            response: result.generated_answer,
            relevant_context: result
                .matches
                .into_iter()
                .map(|m| ContextItem {
                    question: m.record.question,
                    answer: m.record.answer,
                })
                .collect(),
            query: result.query,
            timestamp: result.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl From<&RagError> for ErrorPayload {
    fn from(error: &RagError) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeRecord;
    use crate::search::{Score, SearchTier};
    use crate::service::RankedRecord;
    use serde_json::json;

    #[test]
    fn test_answer_payload_shape() {
        let result = RetrievalResult {
            query: "what's your name".into(),
            tier: SearchTier::Vector,
            fallback: None,
            matches: vec![RankedRecord {
                record: KnowledgeRecord::new(0, "What is your name?", "Gopala Swamy"),
                score: Score::Similarity { value: 0.9 },
            }],
            generated_answer: "I'm Gopala Swamy.".into(),
            timestamp: 1_700_000_000_000,
        };

        let payload = serde_json::to_value(AnswerPayload::from(result)).unwrap();
        assert_eq!(
            payload,
            json!({
                "response": "I'm Gopala Swamy.",
                "relevant_context": [{"question": "What is your name?", "answer": "Gopala Swamy"}],
                "query": "what's your name",
                "timestamp": 1_700_000_000_000i64
            })
        );
    }

    #[test]
    fn test_error_payload_has_no_context() {
        let payload = ErrorPayload::from(&RagError::Generation("quota exceeded".into()));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"error": "generation failed: quota exceeded"}));
    }
}
