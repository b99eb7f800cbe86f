//! # Similarity search
//!
//! Ranks knowledge records against a query in one of two tiers:
//!
//! - **Vector tier**: cosine similarity between the query embedding and each record's cached
//!   embedding. Scores lie in `[-1, 1]`.
//! - **Lexical tier**: overlap of significant terms between the query text and the record's
//!   question and answer. Used when no query embedding is available, and for records whose
//!   own embedding is missing or degenerate. Lexical matches carry no similarity score.
//!
//! [`search`] picks the tier and returns a [`Ranking`] tagged with it, so callers never have
//! to infer which path produced the matches.
//!
//! Every ranking is sorted by descending score; equal scores are broken by ascending record
//! id so identical inputs always produce identical output. In a vector-tier ranking, scored
//! matches come first and lexically ranked fillers after them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashSet},
};
use tracing::debug;

use crate::error::{RagError, RagResult};
use crate::knowledge::KnowledgeRecord;

pub const DEFAULT_TOP_K: usize = 3;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("token pattern is valid"));

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "am", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by",
        "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "how", "i",
        "if", "in", "into", "is", "it", "its", "me", "my", "of", "on", "or", "our", "so",
        "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
        "those", "to", "us", "was", "we", "were", "what", "when", "where", "which", "who",
        "whom", "why", "will", "with", "would", "you", "your", "yours",
    ]
    .into_iter()
    .collect()
});

/// Lower-cased alphanumeric tokens of `text`, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Tokens of `text` minus stop words and single characters.
///
/// When nothing survives the filter (a query made only of stop words), all tokens are kept.
pub fn significant_terms(text: &str) -> BTreeSet<String> {
    let tokens = tokenize(text);
    let significant: BTreeSet<String> = tokens
        .iter()
        .filter(|t| t.chars().count() > 1 && !STOP_WORDS.contains(t.as_str()))
        .cloned()
        .collect();
    if significant.is_empty() {
        tokens.into_iter().collect()
    } else {
        significant
    }
}

/// Cosine similarity of `a` and `b`, clamped into `[-1, 1]`.
///
/// `None` when either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    Some((dot / denominator).clamp(-1.0, 1.0))
}

fn is_degenerate(vector: &[f32]) -> bool {
    vector.is_empty() || vector.iter().all(|x| *x == 0.0) || vector.iter().any(|x| !x.is_finite())
}

/// Score attached to a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Score {
    /// Cosine similarity in `[-1, 1]`.
    Similarity { value: f32 },
    /// Lexical match; no similarity score exists. `shared_terms` is kept for diagnosis.
    Unavailable { shared_terms: usize },
}

impl Score {
    pub fn similarity(&self) -> Option<f32> {
        match self {
            Score::Similarity { value } => Some(*value),
            Score::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMatch {
    pub record_id: u64,
    pub score: Score,
}

/// A record's cached embedding, as seen by the vector tier.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub record_id: u64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTier {
    Vector,
    Lexical,
}

/// Why a ranking was produced by the lexical tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The query could not be embedded.
    NoQueryVector,
    /// The query embedding has zero magnitude.
    DegenerateQuery,
    /// No record has a usable embedding.
    NoCandidates,
    /// Query and record embeddings have different dimensions.
    IncompatibleVectors,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub tier: SearchTier,
    pub fallback: Option<FallbackReason>,
    pub matches: Vec<ScoredMatch>,
}

impl Ranking {
    fn lexical(reason: FallbackReason, matches: Vec<ScoredMatch>) -> Self {
        Self {
            tier: SearchTier::Lexical,
            fallback: Some(reason),
            matches,
        }
    }
}

fn by_similarity(a: &(u64, f32), b: &(u64, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

/// Scores candidates with usable vectors, sorted. Degenerate ones are skipped.
fn score_candidates(query: &[f32], candidates: &[Candidate]) -> RagResult<Vec<(u64, f32)>> {
    let mut scored = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if candidate.vector.len() != query.len() {
            return Err(RagError::IncompatibleVector {
                expected: candidate.vector.len(),
                actual: query.len(),
            });
        }
        if let Some(score) = cosine_similarity(query, &candidate.vector) {
            scored.push((candidate.record_id, score));
        }
    }

    scored.sort_by(by_similarity);
    Ok(scored)
}

/// Top `k` candidates by cosine similarity to `query`.
///
/// Candidates with degenerate vectors are left out.
///
/// ### Errors
/// [`RagError::IncompatibleVector`] when any candidate's dimension differs from the query's.
pub fn vector_search(
    query: &[f32],
    candidates: &[Candidate],
    k: usize,
) -> RagResult<Vec<ScoredMatch>> {
    let mut scored = score_candidates(query, candidates)?;
    scored.truncate(k);
    Ok(scored
        .into_iter()
        .map(|(record_id, value)| ScoredMatch {
            record_id,
            score: Score::Similarity { value },
        })
        .collect())
}

/// Number of query terms found among `record_terms`.
///
/// A term also counts when it is a prefix of a record term or the other way round, for terms
/// of at least four characters (`name` / `names`, `engineer` / `engineering`).
fn shared_terms(query_terms: &BTreeSet<String>, record_terms: &BTreeSet<String>) -> usize {
    query_terms
        .iter()
        .filter(|q| {
            record_terms.contains(q.as_str())
                || record_terms.iter().any(|r| {
                    let (short, long) = if r.len() < q.len() { (r, *q) } else { (*q, r) };
                    short.chars().count() >= 4 && long.starts_with(short.as_str())
                })
        })
        .count()
}

/// Top `k` records by shared significant terms with `query`.
///
/// Only records sharing at least one term are returned.
pub fn lexical_search<'a, I>(query: &str, records: I, k: usize) -> Vec<ScoredMatch>
where
    I: IntoIterator<Item = &'a KnowledgeRecord>,
{
    let query_terms = significant_terms(query);
    if query_terms.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<(u64, usize)> = records
        .into_iter()
        .filter_map(|record| {
            let record_terms: BTreeSet<String> =
                tokenize(&format!("{} {}", record.question, record.answer))
                    .into_iter()
                    .collect();
            let shared = shared_terms(&query_terms, &record_terms);
            (shared > 0).then_some((record.id, shared))
        })
        .collect();

    hits.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    hits.truncate(k);
    hits.into_iter()
        .map(|(record_id, shared_terms)| ScoredMatch {
            record_id,
            score: Score::Unavailable { shared_terms },
        })
        .collect()
}

/// Tier-selecting search.
///
/// Uses the vector tier when `query_vector` is usable and at least one candidate has a usable
/// embedding, the lexical tier otherwise. In the vector tier, records without a usable
/// embedding are ranked lexically and fill the slots left after the scored matches.
pub fn search(
    query: &str,
    query_vector: Option<&[f32]>,
    candidates: &[Candidate],
    records: &[KnowledgeRecord],
    k: usize,
) -> Ranking {
    if k == 0 {
        return Ranking {
            tier: SearchTier::Vector,
            fallback: None,
            matches: Vec::new(),
        };
    }

    let Some(query_vector) = query_vector else {
        return Ranking::lexical(FallbackReason::NoQueryVector, lexical_search(query, records, k));
    };
    if is_degenerate(query_vector) {
        return Ranking::lexical(
            FallbackReason::DegenerateQuery,
            lexical_search(query, records, k),
        );
    }

    let mut scored = match score_candidates(query_vector, candidates) {
        Ok(result) => result,
        Err(e) => {
            debug!("Vector tier unusable: {}", e);
            return Ranking::lexical(
                FallbackReason::IncompatibleVectors,
                lexical_search(query, records, k),
            );
        }
    };
    if scored.is_empty() {
        return Ranking::lexical(FallbackReason::NoCandidates, lexical_search(query, records, k));
    }

    let scored_ids: HashSet<u64> = scored.iter().map(|(id, _)| *id).collect();
    scored.truncate(k);
    let mut matches: Vec<ScoredMatch> = scored
        .into_iter()
        .map(|(record_id, value)| ScoredMatch {
            record_id,
            score: Score::Similarity { value },
        })
        .collect();

    let remaining = k - matches.len();
    if remaining > 0 {
        let unscored = records.iter().filter(|r| !scored_ids.contains(&r.id));
        matches.extend(lexical_search(query, unscored, remaining));
    }

    Ranking {
        tier: SearchTier::Vector,
        fallback: None,
        matches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<KnowledgeRecord> {
        vec![
            KnowledgeRecord::new(0, "What is your name?", "Gopala Swamy"),
            KnowledgeRecord::new(1, "Where do you work?", "Acme Corp"),
            KnowledgeRecord::new(2, "What languages do you use?", "Rust and Python"),
        ]
    }

    fn candidate(record_id: u64, vector: &[f32]) -> Candidate {
        Candidate {
            record_id,
            vector: vector.to_vec(),
        }
    }

    fn ids(matches: &[ScoredMatch]) -> Vec<u64> {
        matches.iter().map(|m| m.record_id).collect()
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), Some(-1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);

        let v = [0.3, -0.7, 0.2, 0.9];
        let s = cosine_similarity(&v, &v).unwrap();
        assert!((s - 1.0).abs() < 1e-6);
        assert!((-1.0..=1.0).contains(&s));
    }

    #[test]
    fn test_vector_search_top_k_sorted_with_id_ties() {
        let candidates = vec![
            candidate(3, &[0.0, 1.0]),
            candidate(1, &[1.0, 0.0]),
            candidate(0, &[1.0, 0.0]),
            candidate(2, &[0.7, 0.7]),
        ];
        let matches = vector_search(&[1.0, 0.0], &candidates, 3).unwrap();

        assert_eq!(ids(&matches), vec![0, 1, 2]);
        let scores: Vec<f32> = matches.iter().filter_map(|m| m.score.similarity()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_vector_search_k_larger_than_collection() {
        let candidates = vec![candidate(0, &[1.0, 0.0]), candidate(1, &[0.0, 1.0])];
        assert_eq!(vector_search(&[1.0, 0.0], &candidates, 10).unwrap().len(), 2);
        assert!(vector_search(&[1.0, 0.0], &candidates, 0).unwrap().is_empty());
    }

    #[test]
    fn test_vector_search_rejects_dimension_mismatch() {
        let candidates = vec![candidate(0, &[1.0, 0.0, 0.0])];
        let err = vector_search(&[1.0, 0.0], &candidates, 3).unwrap_err();
        assert!(matches!(
            err,
            RagError::IncompatibleVector {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_vector_search_skips_degenerate_candidates() {
        let candidates = vec![candidate(0, &[0.0, 0.0]), candidate(1, &[1.0, 0.0])];
        assert_eq!(ids(&vector_search(&[1.0, 0.0], &candidates, 3).unwrap()), vec![1]);
    }

    #[test]
    fn test_significant_terms_drop_stop_words() {
        let terms = significant_terms("What's your name?");
        assert_eq!(terms.into_iter().collect::<Vec<_>>(), vec!["name"]);

        let only_stop_words = significant_terms("who are you");
        assert_eq!(only_stop_words.len(), 3);
    }

    #[test]
    fn test_lexical_search_scenario_b() {
        let records = records();
        let matches = lexical_search("name", &records, 3);
        assert_eq!(ids(&matches), vec![0]);
        assert_eq!(matches[0].score, Score::Unavailable { shared_terms: 1 });
    }

    #[test]
    fn test_lexical_search_no_shared_terms_is_empty() {
        assert!(lexical_search("favourite colour", &records(), 3).is_empty());
        assert!(lexical_search("", &records(), 3).is_empty());
    }

    #[test]
    fn test_lexical_search_ties_by_id_and_prefixes() {
        let records = vec![
            KnowledgeRecord::new(5, "Team names?", "Platform"),
            KnowledgeRecord::new(2, "Your name?", "Gopala"),
        ];
        let matches = lexical_search("name", &records, 3);
        assert_eq!(ids(&matches), vec![2, 5]);
    }

    #[test]
    fn test_search_without_query_vector_is_lexical() {
        let ranking = search("name", None, &[], &records(), 3);
        assert_eq!(ranking.tier, SearchTier::Lexical);
        assert_eq!(ranking.fallback, Some(FallbackReason::NoQueryVector));
        assert_eq!(ids(&ranking.matches), vec![0]);
    }

    #[test]
    fn test_search_prefers_vector_tier() {
        let candidates = vec![
            candidate(0, &[1.0, 0.0]),
            candidate(1, &[0.0, 1.0]),
            candidate(2, &[0.5, 0.5]),
        ];
        let ranking = search("anything", Some(&[0.9, 0.1]), &candidates, &records(), 2);
        assert_eq!(ranking.tier, SearchTier::Vector);
        assert_eq!(ranking.fallback, None);
        assert_eq!(ids(&ranking.matches), vec![0, 2]);
    }

    #[test]
    fn test_search_fills_with_lexical_for_records_without_vectors() {
        let candidates = vec![candidate(1, &[1.0, 0.0]), candidate(2, &[0.0, 0.0])];
        let ranking = search("Rust name", Some(&[1.0, 0.0]), &candidates, &records(), 3);

        assert_eq!(ranking.tier, SearchTier::Vector);
        assert_eq!(ids(&ranking.matches), vec![1, 0, 2]);
        assert!(ranking.matches[0].score.similarity().is_some());
        assert!(ranking.matches[1].score.similarity().is_none());
    }

    #[test]
    fn test_search_incompatible_vectors_falls_back() {
        let candidates = vec![candidate(0, &[1.0, 0.0, 0.0])];
        let ranking = search("name", Some(&[1.0, 0.0]), &candidates, &records(), 3);
        assert_eq!(ranking.tier, SearchTier::Lexical);
        assert_eq!(ranking.fallback, Some(FallbackReason::IncompatibleVectors));
        assert_eq!(ids(&ranking.matches), vec![0]);
    }

    #[test]
    fn test_search_degenerate_query_and_empty_index() {
        let ranking = search("name", Some(&[0.0, 0.0]), &[], &records(), 3);
        assert_eq!(ranking.fallback, Some(FallbackReason::DegenerateQuery));

        let ranking = search("name", Some(&[1.0, 0.0]), &[], &records(), 3);
        assert_eq!(ranking.fallback, Some(FallbackReason::NoCandidates));
    }

    #[test]
    fn test_search_is_deterministic() {
        let candidates = vec![candidate(0, &[0.5, 0.5]), candidate(1, &[0.5, 0.5])];
        let first = search("q", Some(&[1.0, 1.0]), &candidates, &records(), 3);
        let second = search("q", Some(&[1.0, 1.0]), &candidates, &records(), 3);
        assert_eq!(first, second);
        assert_eq!(ids(&first.matches), vec![0, 1]);
    }
}
