//! # Embedding cache
//!
//! Persistent per-record embeddings keyed by a content fingerprint, so unchanged knowledge is
//! never sent to the embedding provider twice.
//!
//! ## Manifest
//! Everything lives in one [`CacheManifest`] file: the provider model id the vectors came
//! from, the fingerprint of the whole collection (only set once every record has a fresh
//! entry), the vector dimension, and one [`EmbeddingCacheEntry`] per record.
//!
//! ## Persistence
//! The manifest is bincode-encoded and written through a temporary file in the target
//! directory, flushed, synced, then renamed over the old manifest. Readers see either the
//! previous manifest or the new one. A manifest that cannot be read or decoded is treated as
//! absent and logged; it is never an error for the caller.
//!
//! ## Rebuild policy
//! [`EmbeddingCache::reconcile`] decides what has to be recomputed at startup:
//!
//! | situation                                             | plan                     |
//! |-------------------------------------------------------|--------------------------|
//! | model id differs                                      | discard all, recompute all |
//! | collection fingerprint and model id match             | trust everything         |
//! | stale fraction above `rebuild_threshold`              | discard all, recompute all |
//! | otherwise                                             | recompute stale entries only |

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{RagError, RagResult};
use crate::knowledge::KnowledgeStore;

const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Cached vector for one knowledge record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheEntry {
    pub record_id: u64,
    /// Fingerprint of the record content the vector was computed from.
    pub fingerprint: String,
    pub vector: Vec<f32>,
}

/// On-disk form of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub format_version: u32,
    pub provider_model_id: String,
    pub collection_fingerprint: Option<String>,
    pub dimension: Option<usize>,
    pub entries: BTreeMap<u64, EmbeddingCacheEntry>,
}

impl CacheManifest {
    /// Manifest with no entries for `provider_model_id`.
    pub fn empty(provider_model_id: impl Into<String>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            provider_model_id: provider_model_id.into(),
            collection_fingerprint: None,
            dimension: None,
            entries: BTreeMap::new(),
        }
    }
}

/// Read a manifest from `path`. Missing, unreadable, corrupt or outdated files yield `None`.
pub fn load_manifest(path: &Path) -> Option<CacheManifest> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No embedding cache at {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("Embedding cache at {} is unreadable: {}", path.display(), e);
            return None;
        }
    };

    match bincode::serde::decode_from_slice::<CacheManifest, _>(&bytes, bincode::config::standard())
    {
        Ok((manifest, _)) if manifest.format_version == MANIFEST_FORMAT_VERSION => Some(manifest),
        Ok((manifest, _)) => {
            warn!(
                "Embedding cache at {} has format version {}, ignoring it",
                path.display(),
                manifest.format_version
            );
            None
        }
        Err(e) => {
            warn!("Embedding cache at {} is corrupt: {}", path.display(), e);
            None
        }
    }
}

/// Atomically replace the manifest at `path`.
///
/// The temporary file is deleted on every failure path; the old manifest stays intact.
pub fn persist_manifest(path: &Path, manifest: &CacheManifest) -> RagResult<()> {
    let bytes = bincode::serde::encode_to_vec(manifest, bincode::config::standard())
        .map_err(|e| RagError::Cache(e.to_string()))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    // On failure the temp file comes back inside the error and is deleted when dropped.
    tmp.persist(path).map_err(|e| RagError::Io(e.error))?;

    debug!(
        "Persisted {} cache entries to {}",
        manifest.entries.len(),
        path.display()
    );
    Ok(())
}

/// Why every record has to be embedded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    /// No usable manifest was found.
    Empty,
    /// Vectors were produced by a different provider model.
    ModelChanged,
    /// More records changed than `rebuild_threshold` allows.
    TooManyChanges,
    /// The provider kept its model id but now returns vectors of another dimension.
    DimensionChanged,
}

/// What [`EmbeddingCache::reconcile`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePlan {
    /// Collection unchanged, every cached vector is trusted as-is.
    FastPath,
    /// Fresh entries kept; the listed records need new vectors.
    Partial { stale: Vec<u64> },
    /// Everything discarded; every record needs a new vector.
    Full { reason: RebuildReason, stale: Vec<u64> },
}

impl CachePlan {
    /// Record ids that need a new vector under this plan.
    pub fn stale(&self) -> &[u64] {
        match self {
            CachePlan::FastPath => &[],
            CachePlan::Partial { stale } | CachePlan::Full { stale, .. } => stale,
        }
    }
}

/// In-memory view of the manifest plus where it lives on disk.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    path: PathBuf,
    manifest: CacheManifest,
}

impl EmbeddingCache {
    /// Load the manifest at `path`, or start empty for `provider_model_id`.
    ///
    /// A manifest from another model is kept until [`reconcile`](Self::reconcile) discards it.
    pub fn open(path: impl Into<PathBuf>, provider_model_id: &str) -> Self {
        let path = path.into();
        let manifest = match load_manifest(&path) {
            Some(manifest) => {
                info!(
                    "Loaded {} cached embeddings ({}) from {}",
                    manifest.entries.len(),
                    manifest.provider_model_id,
                    path.display()
                );
                manifest
            }
            None => CacheManifest::empty(provider_model_id),
        };
        Self { path, manifest }
    }

    /// Where [`persist`](Self::persist) writes the manifest.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current in-memory manifest, including changes not yet persisted.
    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    /// Cached vector for `record_id`, whatever content it was computed from.
    ///
    /// Use [`entry`](Self::entry) to compare the fingerprint against the current record.
    ///
    /// ### Examples
    /// ```
    /// use profile_rag::embedding_cache::EmbeddingCache;
    ///
    /// let mut cache = EmbeddingCache::open("/nonexistent/cache.bin", "hashing-3");
    /// cache.put(7, "fingerprint", vec![0.0, 1.0, 0.0]).unwrap();
    /// assert_eq!(cache.get(7), Some(&[0.0, 1.0, 0.0][..]));
    /// assert_eq!(cache.get(8), None);
    /// ```
    pub fn get(&self, record_id: u64) -> Option<&[f32]> {
        self.manifest
            .entries
            .get(&record_id)
            .map(|entry| entry.vector.as_slice())
    }

    /// Full cache entry for `record_id`, fingerprint included.
    pub fn entry(&self, record_id: u64) -> Option<&EmbeddingCacheEntry> {
        self.manifest.entries.get(&record_id)
    }

    /// Insert or replace the entry for `record_id`. Repeating the same call is a no-op.
    ///
    /// ### Errors
    /// [`RagError::IncompatibleVector`] when `vector` does not match the cache dimension.
    pub fn put(&mut self, record_id: u64, fingerprint: &str, vector: Vec<f32>) -> RagResult<()> {
        match self.manifest.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(RagError::IncompatibleVector {
                    expected,
                    actual: vector.len(),
                });
            }
            None if vector.is_empty() => {
                return Err(RagError::Cache(format!(
                    "empty vector for record {record_id}"
                )));
            }
            None => self.manifest.dimension = Some(vector.len()),
            Some(_) => {}
        }

        if let Some(existing) = self.manifest.entries.get(&record_id)
            && existing.fingerprint == fingerprint
            && existing.vector == vector
        {
            return Ok(());
        }

        self.manifest.collection_fingerprint = None;
        self.manifest.entries.insert(
            record_id,
            EmbeddingCacheEntry {
                record_id,
                fingerprint: fingerprint.to_string(),
                vector,
            },
        );
        Ok(())
    }

    /// Drop every entry and adopt `provider_model_id`.
    pub fn reset(&mut self, provider_model_id: &str) {
        self.manifest = CacheManifest::empty(provider_model_id);
    }

    /// Decide which records need new vectors, discarding whatever can no longer be trusted.
    pub fn reconcile(
        &mut self,
        store: &KnowledgeStore,
        provider_model_id: &str,
        rebuild_threshold: f64,
    ) -> CachePlan {
        let all_ids = || store.records().iter().map(|r| r.id).collect::<Vec<_>>();

        if self.manifest.provider_model_id != provider_model_id {
            info!(
                "Embedding model changed ({} -> {}), discarding cache",
                self.manifest.provider_model_id, provider_model_id
            );
            self.reset(provider_model_id);
            return CachePlan::Full {
                reason: RebuildReason::ModelChanged,
                stale: all_ids(),
            };
        }

        let collection_fingerprint = store.collection_fingerprint();
        if self.manifest.collection_fingerprint.as_deref() == Some(collection_fingerprint.as_str())
        {
            debug!("Knowledge unchanged, trusting all cached embeddings");
            return CachePlan::FastPath;
        }

        if self.manifest.entries.is_empty() {
            return CachePlan::Full {
                reason: RebuildReason::Empty,
                stale: all_ids(),
            };
        }

        let current: HashSet<u64> = store.records().iter().map(|r| r.id).collect();
        let before = self.manifest.entries.len();
        self.manifest
            .entries
            .retain(|record_id, _| current.contains(record_id));
        if self.manifest.entries.len() != before {
            debug!(
                "Dropped {} cache entries for removed records",
                before - self.manifest.entries.len()
            );
        }

        let stale: Vec<u64> = store
            .records()
            .iter()
            .filter(|record| {
                self.manifest
                    .entries
                    .get(&record.id)
                    .is_none_or(|entry| entry.fingerprint != record.fingerprint())
            })
            .map(|record| record.id)
            .collect();

        let stale_fraction = stale.len() as f64 / store.len().max(1) as f64;
        if stale_fraction > rebuild_threshold {
            info!(
                "{} of {} records changed (threshold {:.2}), rebuilding cache",
                stale.len(),
                store.len(),
                rebuild_threshold
            );
            self.reset(provider_model_id);
            return CachePlan::Full {
                reason: RebuildReason::TooManyChanges,
                stale: all_ids(),
            };
        }

        for record_id in &stale {
            self.manifest.entries.remove(record_id);
        }
        if stale.is_empty() {
            self.manifest.collection_fingerprint = Some(collection_fingerprint);
            CachePlan::FastPath
        } else {
            self.manifest.collection_fingerprint = None;
            CachePlan::Partial { stale }
        }
    }

    /// Record the collection fingerprint once every record of `store` has a fresh entry.
    ///
    /// Returns `false` (and leaves the fingerprint unset) while any record is missing.
    pub fn mark_complete(&mut self, store: &KnowledgeStore) -> bool {
        let complete = store.records().iter().all(|record| {
            self.manifest
                .entries
                .get(&record.id)
                .is_some_and(|entry| entry.fingerprint == record.fingerprint())
        });
        self.manifest.collection_fingerprint = complete.then(|| store.collection_fingerprint());
        complete
    }

    /// Write the manifest to [`path`](Self::path) with [`persist_manifest`].
    ///
    /// ### Errors
    /// I/O or encoding errors. The manifest previously on disk is left intact.
    pub fn persist(&self) -> RagResult<()> {
        persist_manifest(&self.path, &self.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeRecord;
    use tempfile::TempDir;

    const MODEL: &str = "text-embedding-3-small";

    fn store(records: &[(&str, &str)]) -> KnowledgeStore {
        KnowledgeStore::from_records(
            records
                .iter()
                .enumerate()
                .map(|(i, (q, a))| KnowledgeRecord::new(i as u64, *q, *a))
                .collect(),
        )
        .unwrap()
    }

    fn fill(cache: &mut EmbeddingCache, store: &KnowledgeStore) {
        for record in store.records() {
            cache
                .put(record.id, &record.fingerprint(), vec![record.id as f32, 1.0, 0.5])
                .unwrap();
        }
    }

    #[test]
    fn test_put_then_get_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);

        cache.put(3, "fp", vec![0.1, 0.2, 0.3]).unwrap();
        cache.put(3, "fp", vec![0.1, 0.2, 0.3]).unwrap();

        assert_eq!(cache.get(3), Some(&[0.1, 0.2, 0.3][..]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(4), None);
    }

    #[test]
    fn test_put_rejects_other_dimension() {
        let dir = TempDir::new().unwrap();
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);
        cache.put(0, "fp", vec![1.0, 0.0]).unwrap();

        let err = cache.put(1, "fp", vec![1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            RagError::IncompatibleVector {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_persist_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.bin");
        let kb = store(&[("q1", "a1"), ("q2", "a2")]);

        let mut cache = EmbeddingCache::open(&path, MODEL);
        fill(&mut cache, &kb);
        assert!(cache.mark_complete(&kb));
        cache.persist().unwrap();

        let loaded = load_manifest(&path).unwrap();
        assert_eq!(&loaded, cache.manifest());

        // No temp files left behind next to the manifest.
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_failed_persist_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.bin");
        let kb = store(&[("q1", "a1"), ("q2", "a2")]);

        let mut cache = EmbeddingCache::open(&path, MODEL);
        fill(&mut cache, &kb);
        cache.persist().unwrap();
        let before = load_manifest(&path).unwrap();

        // The rename cannot replace a non-empty directory.
        let blocked = dir.path().join("blocked.bin");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();
        let mut next = cache.manifest().clone();
        next.entries.clear();
        assert!(persist_manifest(&blocked, &next).is_err());

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["blocked.bin", "cache.bin"]);
        assert!(blocked.join("keep").exists());
        assert_eq!(load_manifest(&path), Some(before));
    }

    #[test]
    fn test_corrupt_manifest_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.bin");
        fs::write(&path, b"definitely not a manifest").unwrap();

        assert!(load_manifest(&path).is_none());
        let cache = EmbeddingCache::open(&path, MODEL);
        assert!(cache.is_empty());
        assert_eq!(cache.manifest().provider_model_id, MODEL);
    }

    #[test]
    fn test_reconcile_cold_start_embeds_everything() {
        let dir = TempDir::new().unwrap();
        let kb = store(&[("q1", "a1"), ("q2", "a2")]);
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);

        let plan = cache.reconcile(&kb, MODEL, 0.5);
        assert_eq!(
            plan,
            CachePlan::Full {
                reason: RebuildReason::Empty,
                stale: vec![0, 1]
            }
        );
    }

    #[test]
    fn test_reconcile_fast_path_after_complete_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.bin");
        let kb = store(&[("q1", "a1"), ("q2", "a2")]);

        let mut cache = EmbeddingCache::open(&path, MODEL);
        fill(&mut cache, &kb);
        cache.mark_complete(&kb);
        cache.persist().unwrap();

        let mut reopened = EmbeddingCache::open(&path, MODEL);
        assert_eq!(reopened.reconcile(&kb, MODEL, 0.5), CachePlan::FastPath);
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_edited_record_is_stale_without_touching_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.bin");
        let kb = store(&[("q1", "a1"), ("q2", "a2"), ("q3", "a3")]);

        let mut cache = EmbeddingCache::open(&path, MODEL);
        fill(&mut cache, &kb);
        cache.mark_complete(&kb);
        cache.persist().unwrap();

        let edited = store(&[("q1", "a1"), ("q2", "a2 changed"), ("q3", "a3")]);
        let mut reopened = EmbeddingCache::open(&path, MODEL);
        let plan = reopened.reconcile(&edited, MODEL, 0.5);

        assert_eq!(plan, CachePlan::Partial { stale: vec![1] });
        assert!(reopened.get(0).is_some());
        assert!(reopened.get(1).is_none());
        assert!(reopened.get(2).is_some());
    }

    #[test]
    fn test_too_many_changes_rebuilds_everything() {
        let dir = TempDir::new().unwrap();
        let kb = store(&[("q1", "a1"), ("q2", "a2"), ("q3", "a3")]);
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);
        fill(&mut cache, &kb);

        let edited = store(&[("q1", "x"), ("q2", "y"), ("q3", "a3")]);
        let plan = cache.reconcile(&edited, MODEL, 0.5);

        assert_eq!(
            plan,
            CachePlan::Full {
                reason: RebuildReason::TooManyChanges,
                stale: vec![0, 1, 2]
            }
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_model_change_discards_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.bin");
        let kb = store(&[("What is your name?", "Gopala Swamy"), ("Where do you work?", "Acme Corp")]);

        let mut cache = EmbeddingCache::open(&path, "old-model");
        fill(&mut cache, &kb);
        cache.mark_complete(&kb);
        cache.persist().unwrap();

        let mut reopened = EmbeddingCache::open(&path, MODEL);
        let plan = reopened.reconcile(&kb, MODEL, 1.0);

        assert_eq!(
            plan,
            CachePlan::Full {
                reason: RebuildReason::ModelChanged,
                stale: vec![0, 1]
            }
        );
        assert!(reopened.is_empty());
        assert_eq!(reopened.manifest().provider_model_id, MODEL);
        assert_eq!(reopened.manifest().dimension, None);
    }

    #[test]
    fn test_removed_records_are_pruned() {
        let dir = TempDir::new().unwrap();
        let kb = store(&[("q1", "a1"), ("q2", "a2"), ("q3", "a3")]);
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);
        fill(&mut cache, &kb);

        let shrunk = store(&[("q1", "a1"), ("q2", "a2")]);
        assert_eq!(cache.reconcile(&shrunk, MODEL, 0.5), CachePlan::FastPath);
        assert_eq!(cache.len(), 2);
        assert!(cache.mark_complete(&shrunk));
    }

    #[test]
    fn test_mark_complete_requires_every_record() {
        let dir = TempDir::new().unwrap();
        let kb = store(&[("q1", "a1"), ("q2", "a2")]);
        let mut cache = EmbeddingCache::open(dir.path().join("cache.bin"), MODEL);
        cache.put(0, &kb.records()[0].fingerprint(), vec![1.0]).unwrap();

        assert!(!cache.mark_complete(&kb));
        assert_eq!(cache.manifest().collection_fingerprint, None);
    }
}
