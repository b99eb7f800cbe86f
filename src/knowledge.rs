//! # Knowledge store
//!
//! Loads the fixed collection of question/answer records the service answers from and
//! exposes it read-only.
//!
//! ## Source format
//! The source is a JSON file in one of two shapes:
//!
//! - a top-level **array** of records. Each record needs `question` and `answer` text
//!   (the conversation-log spellings `userQuestion` / `modelAnswer` are accepted too) and may
//!   carry a numeric `id`. Records without an `id` get their position as id; in a source that
//!   mixes both, a position already claimed by an explicit id is skipped and the record is
//!   numbered above the largest explicit id instead. Two explicit ids that repeat are still
//!   an error. Any other field is kept in [`KnowledgeRecord::extra`] and written back by
//!   [`KnowledgeStore::write`].
//! - a top-level **object**, read as a profile document and flattened into records by
//!   [`crate::profile::records_from_profile`].
//!
//! ```json
//! [
//!   { "question": "What is your name?", "answer": "Gopala Swamy" },
//!   { "question": "Where do you work?", "answer": "Acme Corp", "tags": ["job"] }
//! ]
//! ```
//!
//! Loading never touches the network and never mutates the file.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::error::{RagError, RagResult};
use crate::profile;

/// A single question/answer pair. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// Stable ordinal, unique within a loaded collection.
    pub id: u64,
    pub question: String,
    pub answer: String,
    /// Source fields the pipeline does not use; preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KnowledgeRecord {
    /// Record with no extra source fields.
    pub fn new(id: u64, question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id,
            question: question.into(),
            answer: answer.into(),
            extra: Map::new(),
        }
    }

    /// Content fingerprint over question and answer text.
    ///
    /// A unit separator sits between the two fields so moving text across the boundary
    /// changes the hash.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.question.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(self.answer.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Text submitted to the embedding provider for this record.
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.question, self.answer)
    }
}

/// Raw record as found in the source file.
#[derive(Debug, Deserialize)]
struct SourceRecord {
    #[serde(default)]
    id: Option<u64>,
    #[serde(alias = "userQuestion")]
    question: String,
    #[serde(alias = "modelAnswer")]
    answer: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Ids for records in source order. Explicit ids are kept; a record without one takes its
/// position, or the next id above every explicit one when its position is already claimed.
fn assign_ids(explicit: impl Iterator<Item = Option<u64>> + Clone) -> Vec<u64> {
    let mut taken: HashSet<u64> = explicit.clone().flatten().collect();
    let mut next = taken.iter().max().map_or(0, |max| max.saturating_add(1));
    explicit
        .enumerate()
        .map(|(position, id)| match id {
            Some(id) => id,
            None => {
                let mut id = position as u64;
                if taken.contains(&id) {
                    while taken.contains(&next) {
                        next = next.saturating_add(1);
                    }
                    id = next;
                }
                taken.insert(id);
                id
            }
        })
        .collect()
}

/// Read-only collection of [`KnowledgeRecord`]s in source order.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    source: PathBuf,
    records: Vec<KnowledgeRecord>,
    positions: HashMap<u64, usize>,
}

impl KnowledgeStore {
    /// Load and validate the collection at `path`.
    ///
    /// ### Errors
    /// [`RagError::DataLoad`] when the file is missing or unreadable, is not valid JSON,
    /// holds no records, holds a record with an empty question or answer, or repeats an id.
    pub fn load(path: impl AsRef<Path>) -> RagResult<Self> {
        let path = path.as_ref();
        info!("Loading knowledge from {}", path.display());

        let content =
            fs::read_to_string(path).map_err(|e| RagError::data_load(path, e.to_string()))?;
        let document: Value =
            serde_json::from_str(&content).map_err(|e| RagError::data_load(path, e.to_string()))?;

        let records: Vec<KnowledgeRecord> = match document {
            Value::Array(items) => {
                let raws = items
                    .into_iter()
                    .enumerate()
                    .map(|(position, item)| {
                        serde_json::from_value::<SourceRecord>(item).map_err(|e| {
                            RagError::data_load(path, format!("record {position}: {e}"))
                        })
                    })
                    .collect::<RagResult<Vec<_>>>()?;
                let ids = assign_ids(raws.iter().map(|raw| raw.id));
                raws.into_iter()
                    .zip(ids)
                    .map(|(raw, id)| KnowledgeRecord {
                        id,
                        question: raw.question,
                        answer: raw.answer,
                        extra: raw.extra,
                    })
                    .collect()
            }
            Value::Object(profile) => {
                debug!("Knowledge source is a profile document, flattening");
                profile::records_from_profile(&profile)
                    .into_iter()
                    .enumerate()
                    .map(|(position, section)| {
                        KnowledgeRecord::new(position as u64, section.title, section.text)
                    })
                    .collect()
            }
            _ => {
                return Err(RagError::data_load(
                    path,
                    "expected an array of records or a profile object",
                ));
            }
        };

        let store = Self::build(path.to_path_buf(), records)?;
        info!("Loaded {} knowledge records", store.len());
        Ok(store)
    }

    /// Build a store from records already in memory, with the same validation as [`load`](Self::load).
    ///
    /// ### Errors
    /// [`RagError::DataLoad`] for an empty list, an empty question or answer, or a repeated id.
    pub fn from_records(records: Vec<KnowledgeRecord>) -> RagResult<Self> {
        Self::build(PathBuf::from("<memory>"), records)
    }

    fn build(source: PathBuf, records: Vec<KnowledgeRecord>) -> RagResult<Self> {
        if records.is_empty() {
            return Err(RagError::data_load(source, "knowledge base is empty"));
        }

        let mut positions = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if record.question.trim().is_empty() || record.answer.trim().is_empty() {
                return Err(RagError::data_load(
                    source,
                    format!("record {} has an empty question or answer", record.id),
                ));
            }
            if positions.insert(record.id, position).is_some() {
                return Err(RagError::data_load(
                    source,
                    format!("duplicate record id {}", record.id),
                ));
            }
        }

        Ok(Self {
            source,
            records,
            positions,
        })
    }

    /// All records in source order.
    pub fn records(&self) -> &[KnowledgeRecord] {
        &self.records
    }

    /// Record with the given id, if the collection has one.
    ///
    /// ### Examples
    /// ```
    /// use profile_rag::knowledge::{KnowledgeRecord, KnowledgeStore};
    ///
    /// let store = KnowledgeStore::from_records(vec![
    ///     KnowledgeRecord::new(4, "Where do you work?", "Acme Corp"),
    /// ])?;
    /// assert_eq!(store.get(4).map(|r| r.answer.as_str()), Some("Acme Corp"));
    /// assert!(store.get(0).is_none());
    /// # Ok::<(), profile_rag::error::RagError>(())
    /// ```
    pub fn get(&self, id: u64) -> Option<&KnowledgeRecord> {
        self.positions.get(&id).map(|&position| &self.records[position])
    }

    /// Number of records. Never zero for a loaded store.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// File the records were loaded from, or `<memory>`.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Fingerprint of the whole collection: ids and record fingerprints, in order.
    pub fn collection_fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for record in &self.records {
            hasher.update(&record.id.to_le_bytes());
            hasher.update(record.fingerprint().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Write the collection back as a record array, including unknown source fields.
    ///
    /// Ids are written explicitly, so a rewritten file loads with the same ids.
    ///
    /// ### Errors
    /// Serialisation or I/O errors.
    pub fn write(&self, path: impl AsRef<Path>) -> RagResult<()> {
        let json = serde_json::to_string_pretty(&self.records)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_source(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn test_load_record_array() {
        let file = write_source(
            r#"[
                {"question": "What is your name?", "answer": "Gopala Swamy"},
                {"question": "Where do you work?", "answer": "Acme Corp"}
            ]"#,
        );
        let store = KnowledgeStore::load(file.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.records()[0].id, 0);
        assert_eq!(store.records()[1].id, 1);
        assert_eq!(store.get(1).unwrap().answer, "Acme Corp");
    }

    #[test]
    fn test_load_conversation_log_spelling() {
        let file = write_source(
            r#"[{"userQuestion": "Notice period?", "modelAnswer": "30 days", "id": 7}]"#,
        );
        let store = KnowledgeStore::load(file.path()).unwrap();
        let record = &store.records()[0];
        assert_eq!(record.id, 7);
        assert_eq!(record.question, "Notice period?");
        assert_eq!(record.answer, "30 days");
    }

    #[test]
    fn test_load_is_idempotent() {
        let file = write_source(r#"[{"question": "q", "answer": "a"}]"#);
        let first = KnowledgeStore::load(file.path()).unwrap();
        let second = KnowledgeStore::load(file.path()).unwrap();
        assert_eq!(first.records(), second.records());
    }

    #[test]
    fn test_load_empty_collection_fails() {
        let file = write_source("[]");
        let err = KnowledgeStore::load(file.path()).unwrap_err();
        assert!(matches!(err, RagError::DataLoad { .. }));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = KnowledgeStore::load("non/existent/knowledge.json").unwrap_err();
        assert!(matches!(err, RagError::DataLoad { .. }));
    }

    #[test]
    fn test_load_malformed_fails() {
        let file = write_source(r#"[{"question": "only a question"}]"#);
        assert!(matches!(
            KnowledgeStore::load(file.path()),
            Err(RagError::DataLoad { .. })
        ));

        let file = write_source("not json at all");
        assert!(matches!(
            KnowledgeStore::load(file.path()),
            Err(RagError::DataLoad { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let records = vec![
            KnowledgeRecord::new(1, "a", "b"),
            KnowledgeRecord::new(1, "c", "d"),
        ];
        assert!(KnowledgeStore::from_records(records).is_err());
    }

    #[test]
    fn test_mixed_ids_do_not_collide() {
        let file = write_source(
            r#"[
                {"id": 1, "question": "What is your name?", "answer": "Gopala Swamy"},
                {"question": "Where do you work?", "answer": "Acme Corp"},
                {"question": "What is your notice period?", "answer": "30 days"},
                {"question": "Where do you live?", "answer": "Pune", "id": 7}
            ]"#,
        );
        let store = KnowledgeStore::load(file.path()).unwrap();

        let ids: Vec<u64> = store.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 8, 2, 7]);
        assert_eq!(store.get(8).unwrap().answer, "Acme Corp");
        assert_eq!(store.get(2).unwrap().answer, "30 days");

        let again = KnowledgeStore::load(file.path()).unwrap();
        assert_eq!(again.collection_fingerprint(), store.collection_fingerprint());
    }

    #[test]
    fn test_repeated_explicit_ids_fail_to_load() {
        let file = write_source(
            r#"[
                {"id": 3, "question": "q1", "answer": "a1"},
                {"id": 3, "question": "q2", "answer": "a2"}
            ]"#,
        );
        let err = KnowledgeStore::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate record id 3"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let record = KnowledgeRecord::new(0, "What is your name?", "Gopala Swamy");
        let same = KnowledgeRecord::new(5, "What is your name?", "Gopala Swamy");
        let edited = KnowledgeRecord::new(0, "What is your name?", "G. Swamy");
        let shifted = KnowledgeRecord::new(0, "What is your name?G", "opala Swamy");

        assert_eq!(record.fingerprint(), same.fingerprint());
        assert_ne!(record.fingerprint(), edited.fingerprint());
        assert_ne!(record.fingerprint(), shifted.fingerprint());
    }

    #[test]
    fn test_collection_fingerprint_changes_with_any_record() {
        let base = KnowledgeStore::from_records(vec![
            KnowledgeRecord::new(0, "q1", "a1"),
            KnowledgeRecord::new(1, "q2", "a2"),
        ])
        .unwrap();
        let edited = KnowledgeStore::from_records(vec![
            KnowledgeRecord::new(0, "q1", "a1"),
            KnowledgeRecord::new(1, "q2", "a2 (updated)"),
        ])
        .unwrap();
        assert_ne!(base.collection_fingerprint(), edited.collection_fingerprint());
        assert_eq!(base.collection_fingerprint(), base.collection_fingerprint());
    }

    #[test]
    fn test_write_round_trips_unknown_fields() {
        let file = write_source(
            r#"[{"question": "q", "answer": "a", "tags": ["x", "y"], "source": "chat"}]"#,
        );
        let store = KnowledgeStore::load(file.path()).unwrap();

        let out = NamedTempFile::new().unwrap();
        store.write(out.path()).unwrap();
        let reloaded = KnowledgeStore::load(out.path()).unwrap();

        assert_eq!(store.records(), reloaded.records());
        assert_eq!(
            reloaded.records()[0].extra.get("source"),
            Some(&Value::String("chat".into()))
        );
    }
}
