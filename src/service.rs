//! # Retrieval service
//!
//! [`RagService`] owns everything a query needs: the knowledge store, the candidate index of
//! cached record embeddings, the embedding provider, the generator and the prompt template.
//!
//! ## Lifecycle
//! [`RagService::start`] loads the knowledge (a failure here is fatal), reconciles the
//! embedding cache, embeds stale records in bounded-concurrency batches and persists the
//! cache after each successful batch. A batch that fails is logged and its records are left
//! to the lexical tier. The candidate index is then frozen: the service is read-only from
//! here on and can be shared behind an `Arc`.
//!
//! ## Answering
//! [`RagService::answer`] embeds the query (memoised per process), runs the tier-selecting
//! search, renders the grounding payload from the matches in rank order and asks the
//! generator. When nothing matches, the template's `no_context_reply` is returned without a
//! generation call. Answering never writes to the knowledge store or the embedding cache.
//!
//! When the query embedding and the cached embeddings disagree on dimension, the query is
//! answered lexically and [`RagService::rebuild_due`] turns `true`; the caller decides when
//! to swap in a [`RagService::rebuild`]-ed instance, usually through
//! [`RagService::rebuild_if_due`] once the answer is out. The rebuilt cache is persisted, so
//! the next process starts healed. At startup the same mismatch is caught while embedding
//! stale records and escalates to a full rebuild
//! ([`RebuildReason::DimensionChanged`]).

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    pin::pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, error, info, warn};

use crate::config::RagConfig;
use crate::embedding_cache::{CachePlan, EmbeddingCache, RebuildReason};
use crate::error::{RagError, RagResult};
use crate::generation::{ChatCompletionGenerator, Generator};
use crate::knowledge::{KnowledgeRecord, KnowledgeStore};
use crate::provider::{self, EmbeddingProvider, embed_all};
use crate::search::{self, Candidate, FallbackReason, Ranking, Score, SearchTier};
use crate::template::{self, PromptTemplate};

/// Tunables of a running service.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub cache_path: PathBuf,
    pub top_k: usize,
    pub rebuild_threshold: f64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub query_cache_size: usize,
    pub template: PromptTemplate,
}

impl ServiceOptions {
    /// Defaults for everything but the cache location.
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        let defaults = RagConfig::default();
        Self {
            cache_path: cache_path.into(),
            ..Self::from_config(&defaults, PromptTemplate::default())
        }
    }

    /// Tunables taken from the `retrieval` and `embedding` sections of `config`.
    pub fn from_config(config: &RagConfig, template: PromptTemplate) -> Self {
        Self {
            cache_path: config.cache_path.clone(),
            top_k: config.retrieval.top_k,
            rebuild_threshold: config.retrieval.rebuild_threshold,
            batch_size: config.embedding.batch_size,
            concurrency: config.embedding.concurrency,
            query_cache_size: config.retrieval.query_cache_size,
            template,
        }
    }
}

/// What startup population did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PopulationReport {
    pub records: usize,
    /// Set when the whole cache was discarded.
    pub full_rebuild: Option<RebuildReason>,
    /// Records that needed a new vector.
    pub stale: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Records searchable by the vector tier.
    pub indexed: usize,
}

/// A grounding record with the score that ranked it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRecord {
    pub record: KnowledgeRecord,
    pub score: Score,
}

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub tier: SearchTier,
    pub fallback: Option<FallbackReason>,
    /// Grounding records in rank order.
    pub matches: Vec<RankedRecord>,
    pub generated_answer: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Bounded memo of query embeddings, oldest evicted first.
#[derive(Debug)]
struct QueryCache {
    capacity: usize,
    vectors: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl QueryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            vectors: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.vectors.get(key).cloned()
    }

    fn insert(&mut self, key: String, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.vectors.insert(key.clone(), vector).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.vectors.remove(&oldest);
            }
        }
    }
}

/// Loaded knowledge, frozen candidate index and the providers used per query.
pub struct RagService {
    store: KnowledgeStore,
    candidates: Vec<Candidate>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn Generator>,
    options: ServiceOptions,
    query_cache: Mutex<QueryCache>,
    rebuild_due: AtomicBool,
    report: PopulationReport,
}

impl RagService {
    /// Build providers from `config` and start.
    ///
    /// ### Errors
    /// Whatever building the embedding provider or [`start`](Self::start) returns.
    pub async fn from_config(config: &RagConfig) -> RagResult<Self> {
        let embedder = provider::from_settings(&config.embedding)?;
        let generator: Arc<dyn Generator> =
            Arc::new(ChatCompletionGenerator::from_settings(&config.generation));
        Self::start(config, embedder, generator).await
    }

    /// Load knowledge and template named by `config`, then populate the cache.
    ///
    /// ### Errors
    /// [`RagError::DataLoad`] when the knowledge cannot be loaded, or the template error when
    /// a configured template cannot be read.
    pub async fn start(
        config: &RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
    ) -> RagResult<Self> {
        let store = KnowledgeStore::load(&config.knowledge_path)?;
        let template = match &config.template {
            Some(name) => template::load_template(name)?,
            None => PromptTemplate::default(),
        };
        let options = ServiceOptions::from_config(config, template);
        Ok(Self::with_store(store, embedder, generator, options).await)
    }

    /// Start over an already loaded store.
    ///
    /// Population problems never fail startup: records that could not be embedded are only
    /// reachable through the lexical tier, which [`report`](Self::report) shows.
    pub async fn with_store(
        store: KnowledgeStore,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
        options: ServiceOptions,
    ) -> Self {
        Self::launch(store, embedder, generator, options, false).await
    }

    async fn launch(
        store: KnowledgeStore,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
        options: ServiceOptions,
        discard_cache: bool,
    ) -> Self {
        let mut cache = EmbeddingCache::open(&options.cache_path, embedder.model_id());
        if discard_cache {
            cache.reset(embedder.model_id());
        }

        let mut report = populate(&store, &mut cache, embedder.as_ref(), &options).await;
        let candidates = candidate_index(&store, &cache);
        report.indexed = candidates.len();

        if report.indexed < store.len() {
            warn!(
                "{} of {} records have no embedding and are only reachable by lexical search",
                store.len() - report.indexed,
                store.len()
            );
        }
        info!(
            "Service ready: {} records, {} indexed with {}",
            store.len(),
            report.indexed,
            embedder.model_id()
        );

        Self {
            query_cache: Mutex::new(QueryCache::new(options.query_cache_size)),
            store,
            candidates,
            embedder,
            generator,
            options,
            rebuild_due: AtomicBool::new(false),
            report,
        }
    }

    /// Knowledge the service answers from.
    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    /// What startup population did to the embedding cache.
    pub fn report(&self) -> &PopulationReport {
        &self.report
    }

    /// Tunables the service was started with.
    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// `true` once a query found the cached embeddings incompatible with the provider.
    pub fn rebuild_due(&self) -> bool {
        self.rebuild_due.load(Ordering::SeqCst)
    }

    /// A new service over the same knowledge with the embedding cache rebuilt from scratch.
    pub async fn rebuild(&self) -> RagService {
        info!("Rebuilding embedding cache at {}", self.options.cache_path.display());
        Self::launch(
            self.store.clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.generator),
            self.options.clone(),
            true,
        )
        .await
    }

    /// Swap in a rebuilt service when a query flagged the cache as incompatible, otherwise
    /// hand back `self` untouched.
    ///
    /// ### Examples
    /// ```no_run
    /// # use profile_rag::{config::RagConfig, service::RagService};
    /// # async fn run(config: RagConfig) -> Result<(), Box<dyn std::error::Error>> {
    /// let service = RagService::from_config(&config).await?;
    /// let result = service.answer("Where do you work?").await?;
    /// println!("{}", result.generated_answer);
    /// let service = service.rebuild_if_due().await;
    /// # drop(service);
    /// # Ok(()) }
    /// ```
    pub async fn rebuild_if_due(self) -> RagService {
        if self.rebuild_due() {
            self.rebuild().await
        } else {
            self
        }
    }

    /// Answer `query` stamped with the current time. See [`answer_with_timestamp`](Self::answer_with_timestamp).
    pub async fn answer(&self, query: &str) -> RagResult<RetrievalResult> {
        self.answer_with_timestamp(query, None).await
    }

    /// Answer `query`, stamping the result with `timestamp` (ms) or the current time.
    ///
    /// ### Errors
    /// [`RagError::Generation`] when the generator fails. Embedding problems never fail a
    /// query; they only move it to the lexical tier.
    pub async fn answer_with_timestamp(
        &self,
        query: &str,
        timestamp: Option<i64>,
    ) -> RagResult<RetrievalResult> {
        let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
        let ranking = self.retrieve(query).await;

        let matches: Vec<RankedRecord> = ranking
            .matches
            .iter()
            .filter_map(|m| {
                self.store.get(m.record_id).map(|record| RankedRecord {
                    record: record.clone(),
                    score: m.score,
                })
            })
            .collect();

        let template = &self.options.template;
        let generated_answer = if matches.is_empty() {
            info!("No relevant knowledge for query, skipping generation");
            template.no_context_reply.clone()
        } else {
            let context = template.render_grounding(matches.iter().map(|m| &m.record));
            let user_message = template.render_user_message(query.trim());
            self.generator
                .generate(&context, &user_message)
                .await
                .map_err(|e| match e {
                    RagError::Generation(_) => e,
                    other => RagError::Generation(other.to_string()),
                })?
        };

        Ok(RetrievalResult {
            query: query.to_string(),
            tier: ranking.tier,
            fallback: ranking.fallback,
            matches,
            generated_answer,
            timestamp,
        })
    }

    /// Rank the knowledge for `query` without generating.
    pub async fn retrieve(&self, query: &str) -> Ranking {
        let query = query.trim();
        let vector = if query.is_empty() {
            None
        } else {
            match self.query_vector(query).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!("Query embedding unavailable: {}", e);
                    None
                }
            }
        };

        let ranking = search::search(
            query,
            vector.as_deref(),
            &self.candidates,
            self.store.records(),
            self.options.top_k,
        );

        if ranking.fallback == Some(FallbackReason::IncompatibleVectors)
            && !self.rebuild_due.swap(true, Ordering::SeqCst)
        {
            error!(
                "Cached embeddings are incompatible with {}, a cache rebuild is due",
                self.embedder.model_id()
            );
        }
        if let Some(reason) = ranking.fallback {
            warn!("Answering from lexical search ({:?})", reason);
        }
        debug!(
            "Retrieved {} record(s) via {:?}",
            ranking.matches.len(),
            ranking.tier
        );
        ranking
    }

    async fn query_vector(&self, query: &str) -> RagResult<Vec<f32>> {
        let key = blake3::hash(query.as_bytes()).to_hex().to_string();
        let cached = self.query_cache().get(&key);
        if let Some(vector) = cached {
            debug!("Query embedding served from memo");
            return Ok(vector);
        }

        let vector = self.embedder.embed_one(query).await?;
        self.query_cache().insert(key, vector.clone());
        Ok(vector)
    }

    fn query_cache(&self) -> MutexGuard<'_, QueryCache> {
        self.query_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reconcile `cache` with `store` and embed whatever is stale.
///
/// Fresh vectors whose dimension differs from the cached ones turn a partial update into a
/// full rebuild: the cache is reset and every record is embedded again.
async fn populate(
    store: &KnowledgeStore,
    cache: &mut EmbeddingCache,
    embedder: &dyn EmbeddingProvider,
    options: &ServiceOptions,
) -> PopulationReport {
    let model_id = embedder.model_id().to_string();
    let collection_fingerprint = store.collection_fingerprint();
    let trusted = cache.manifest().provider_model_id == model_id
        && cache.manifest().collection_fingerprint.as_deref()
            == Some(collection_fingerprint.as_str());

    let plan = cache.reconcile(store, &model_id, options.rebuild_threshold);
    let stale: Vec<&KnowledgeRecord> = plan.stale().iter().filter_map(|id| store.get(*id)).collect();

    let mut report = PopulationReport {
        records: store.len(),
        full_rebuild: match &plan {
            CachePlan::Full { reason, .. } => Some(*reason),
            _ => None,
        },
        stale: stale.len(),
        ..PopulationReport::default()
    };

    let keeps_old_vectors = !matches!(plan, CachePlan::Full { .. });
    if let Some((expected, actual)) =
        embed_records(&stale, cache, embedder, options, &mut report, keeps_old_vectors).await
    {
        warn!(
            "{} now returns {}-dimensional vectors (cache holds {}), rebuilding cache",
            model_id, actual, expected
        );
        cache.reset(&model_id);
        let everything: Vec<&KnowledgeRecord> = store.records().iter().collect();
        report = PopulationReport {
            records: store.len(),
            full_rebuild: Some(RebuildReason::DimensionChanged),
            stale: everything.len(),
            ..PopulationReport::default()
        };
        embed_records(&everything, cache, embedder, options, &mut report, false).await;
    }

    if cache.mark_complete(store) {
        debug!("Embedding cache covers the whole collection");
    }
    if !trusted && let Err(e) = cache.persist() {
        warn!("Could not persist embedding cache: {}", e);
    }
    report
}

/// Embed `records` in batches, storing and persisting each successful batch.
///
/// With `stop_on_new_dimension`, the first batch whose vectors disagree with the cached
/// dimension stops the run and returns `(cached, fresh)` dimensions; otherwise such vectors
/// are discarded and counted as failed.
async fn embed_records(
    records: &[&KnowledgeRecord],
    cache: &mut EmbeddingCache,
    embedder: &dyn EmbeddingProvider,
    options: &ServiceOptions,
    report: &mut PopulationReport,
    stop_on_new_dimension: bool,
) -> Option<(usize, usize)> {
    if records.is_empty() {
        return None;
    }
    info!("Embedding {} record(s) with {}", records.len(), embedder.model_id());
    let step = options.batch_size.max(1);
    let texts: Vec<String> = records.iter().map(|r| r.embedding_text()).collect();
    let mut batches = pin!(embed_all(embedder, &texts, step, options.concurrency));

    while let Some((offset, result)) = batches.next().await {
        let batch = &records[offset..(offset + step).min(records.len())];
        match result {
            Ok(vectors) => {
                if stop_on_new_dimension
                    && let Some(expected) = cache.manifest().dimension
                    && let Some(fresh) = vectors.iter().find(|v| v.len() != expected)
                {
                    return Some((expected, fresh.len()));
                }
                for (record, vector) in batch.iter().zip(vectors) {
                    match cache.put(record.id, &record.fingerprint(), vector) {
                        Ok(()) => report.embedded += 1,
                        Err(e) => {
                            warn!("Discarding vector for record {}: {}", record.id, e);
                            report.failed += 1;
                        }
                    }
                }
                if let Err(e) = cache.persist() {
                    warn!("Could not persist embedding cache: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Embedding {} record(s) failed, they stay lexical-only: {}",
                    batch.len(),
                    e
                );
                report.failed += batch.len();
            }
        }
    }
    None
}

/// Cached vectors whose fingerprint still matches their record.
fn candidate_index(store: &KnowledgeStore, cache: &EmbeddingCache) -> Vec<Candidate> {
    store
        .records()
        .iter()
        .filter_map(|record| {
            let entry = cache.entry(record.id)?;
            (entry.fingerprint == record.fingerprint()).then(|| Candidate {
                record_id: record.id,
                vector: entry.vector.clone(),
            })
        })
        .collect()
}
