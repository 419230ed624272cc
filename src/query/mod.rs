//! Query engine
//!
//! Turns submitted sketches into top-k [`Match`] lists, either globally or
//! per series name. Index failures are retried once and then downgraded to an
//! empty result for the affected sketch, so one bad query never sinks a
//! multi-sketch submission.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::index::{IndexHit, MetadataFilter, NearestNeighborIndex};
use crate::normalize::{self, InsufficientSamplesPolicy};
use crate::types::{Match, SketchId, Vector};
use crate::{Error, Result};

pub mod rerank;

/// Candidates fetched per requested result when re-ranking
pub const RERANK_OVERSAMPLE: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Top-k restricted to each name of the allow-list, flattened
    #[default]
    PerName,
    /// Top-k across the whole corpus
    Global,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rerank {
    #[default]
    None,
    Dtw,
}

/// Query engine settings
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub k: usize,
    pub mode: QueryMode,
    /// Length of the normalized query vector; must equal the index dimension
    pub target_size: usize,
    /// In-flight per-name queries
    pub concurrency: usize,
    pub rerank: Rerank,
    /// Sakoe-Chiba radius for DTW re-ranking
    pub dtw_band: Option<usize>,
    pub insufficient_samples: InsufficientSamplesPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            k: 5,
            mode: QueryMode::PerName,
            target_size: 32,
            concurrency: 8,
            rerank: Rerank::None,
            dtw_band: None,
            insufficient_samples: InsufficientSamplesPolicy::Reject,
        }
    }
}

/// Result of one engine run
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// One entry per submitted sketch; empty when nothing matched or the
    /// index failed
    pub matches: BTreeMap<SketchId, Vec<Match>>,
    /// Sketches whose index calls failed after the retry
    pub errors: BTreeMap<SketchId, String>,
}

impl QueryOutcome {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

pub struct QueryEngine {
    index: Arc<dyn NearestNeighborIndex>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(index: Arc<dyn NearestNeighborIndex>, config: QueryConfig) -> Result<Self> {
        if config.k == 0 {
            return Err(Error::InvalidRequest("k must be positive".into()));
        }
        if config.concurrency == 0 {
            return Err(Error::InvalidRequest("concurrency must be positive".into()));
        }
        if config.target_size != index.dimension() {
            return Err(Error::DimensionMismatch {
                expected: index.dimension(),
                got: config.target_size,
            });
        }
        Ok(Self { index, config })
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Query every sketch with the configured `k`
    pub async fn run(
        &self,
        sketches: &BTreeMap<SketchId, Vec<f64>>,
        allowlist: Option<&[String]>,
    ) -> Result<QueryOutcome> {
        self.run_with_k(sketches, self.config.k, allowlist).await
    }

    /// Query every sketch independently.
    ///
    /// Normalization failures reject the whole call before any index query
    /// runs. `allowlist` selects the names for per-name mode (default: every
    /// name in the index); global mode ignores it.
    pub async fn run_with_k(
        &self,
        sketches: &BTreeMap<SketchId, Vec<f64>>,
        k: usize,
        allowlist: Option<&[String]>,
    ) -> Result<QueryOutcome> {
        if k == 0 {
            return Err(Error::InvalidRequest("k must be positive".into()));
        }

        let vectors = sketches
            .iter()
            .map(|(id, samples)| {
                normalize::normalize_with_policy(
                    samples,
                    self.config.target_size,
                    self.config.insufficient_samples,
                )
                .map(|v| (*id, v))
            })
            .collect::<Result<Vec<(SketchId, Vector)>>>()?;

        let mut outcome = QueryOutcome::default();

        let names = match self.config.mode {
            QueryMode::Global => Vec::new(),
            QueryMode::PerName => match allowlist {
                Some(names) => names.to_vec(),
                None => match self.names_with_retry().await {
                    Ok(names) => names,
                    Err(e) => {
                        for (id, _) in vectors {
                            outcome.matches.insert(id, Vec::new());
                            outcome.errors.insert(id, e.to_string());
                        }
                        return Ok(outcome);
                    }
                },
            },
        };

        for (id, vector) in vectors {
            let result = match self.config.mode {
                QueryMode::Global => self.search(&vector, k, None).await,
                QueryMode::PerName => self.per_name(&vector, k, &names).await,
            };

            match result {
                Ok(matches) => {
                    tracing::debug!(sketch = %id, matches = matches.len(), "Sketch queried");
                    outcome.matches.insert(id, matches);
                }
                Err(e) => {
                    tracing::warn!(sketch = %id, error = %e, "Sketch query failed, returning no matches");
                    outcome.matches.insert(id, Vec::new());
                    outcome.errors.insert(id, e.to_string());
                }
            }
        }

        Ok(outcome)
    }

    /// Fan out one query per name, then merge in `names` order
    async fn per_name(&self, vector: &[f32], k: usize, names: &[String]) -> Result<Vec<Match>> {
        let mut per_name: HashMap<String, Result<Vec<Match>>> = stream::iter(names.iter().cloned())
            .map(|name| async move {
                let filter = MetadataFilter::name_eq(name.clone());
                let result = self.search(vector, k, Some(&filter)).await;
                (name, result)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut merged = Vec::new();
        for name in names {
            if let Some(result) = per_name.remove(name) {
                merged.extend(result?);
            }
        }
        Ok(merged)
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Match>> {
        let hits = match self.config.rerank {
            Rerank::None => self.query_with_retry(vector, k, filter).await?,
            Rerank::Dtw => {
                let candidates = self
                    .query_with_retry(vector, k.saturating_mul(RERANK_OVERSAMPLE), filter)
                    .await?;
                rerank::rerank(vector, candidates, k, self.config.dtw_band)
            }
        };

        Ok(hits
            .iter()
            .map(|hit| Match::from_metadata(&hit.metadata, hit.distance))
            .collect())
    }

    async fn query_with_retry(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>> {
        match self.index.query(vector, k, filter).await {
            Err(e) if e.is_index_error() => {
                tracing::warn!(error = %e, name = ?filter.and_then(|f| f.name()), "Index query failed, retrying once");
                self.index.query(vector, k, filter).await
            }
            other => other,
        }
    }

    async fn names_with_retry(&self) -> Result<Vec<String>> {
        match self.index.names().await {
            Err(e) if e.is_index_error() => {
                tracing::warn!(error = %e, "Listing names failed, retrying once");
                self.index.names().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;
    use crate::types::{DistanceMetric, IndexRecord, WindowMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// Flat index that fails its first `failures` queries
    struct FlakyIndex {
        inner: RwLock<FlatIndex>,
        failures: AtomicUsize,
    }

    impl FlakyIndex {
        fn new(failures: usize) -> Self {
            let mut inner = FlatIndex::new(4, DistanceMetric::L2).unwrap();
            let mut records = Vec::new();
            for (n, name) in ["A", "B", "C"].iter().enumerate() {
                for i in 0..3 {
                    let base = (n * 3 + i) as f32 / 10.0;
                    records.push(IndexRecord {
                        id: format!("{}-{}", name, i),
                        vector: vec![base, base + 0.1, base + 0.2, base + 0.3],
                        metadata: WindowMetadata {
                            name: name.to_string(),
                            start_date: String::new(),
                            end_date: String::new(),
                            start_idx: i,
                            end_idx: i + 7,
                            window_size: 7,
                            document: String::new(),
                        },
                    });
                }
            }
            inner.add(records).unwrap();
            Self {
                inner: RwLock::new(inner),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl NearestNeighborIndex for FlakyIndex {
        fn dimension(&self) -> usize {
            4
        }

        async fn insert_batch(&self, records: Vec<IndexRecord>) -> Result<()> {
            self.inner.write().await.add(records)
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: Option<&MetadataFilter>,
        ) -> Result<Vec<IndexHit>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::IndexUnavailable("simulated outage".into()));
            }
            self.inner.read().await.search(vector, k, filter)
        }

        async fn names(&self) -> Result<Vec<String>> {
            Ok(self.inner.read().await.names())
        }
    }

    /// Answers early names last: "A" sleeps longest, "C" returns at once
    struct SlowFirstIndex {
        inner: FlakyIndex,
        completed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NearestNeighborIndex for SlowFirstIndex {
        fn dimension(&self) -> usize {
            4
        }

        async fn insert_batch(&self, records: Vec<IndexRecord>) -> Result<()> {
            self.inner.insert_batch(records).await
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: Option<&MetadataFilter>,
        ) -> Result<Vec<IndexHit>> {
            let name = filter.and_then(|f| f.name()).unwrap_or_default().to_string();
            let delay_ms = match name.as_str() {
                "A" => 60,
                "B" => 30,
                _ => 0,
            };
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            let hits = self.inner.query(vector, k, filter).await;
            self.completed.lock().unwrap().push(name);
            hits
        }

        async fn names(&self) -> Result<Vec<String>> {
            self.inner.names().await
        }
    }

    fn engine(index: FlakyIndex, mode: QueryMode) -> QueryEngine {
        QueryEngine::new(
            Arc::new(index),
            QueryConfig {
                k: 2,
                mode,
                target_size: 4,
                concurrency: 2,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn sketches(n: usize) -> BTreeMap<SketchId, Vec<f64>> {
        (0..n)
            .map(|i| (SketchId::new(), vec![0.0, 1.0 + i as f64, 2.0, 3.0]))
            .collect()
    }

    #[tokio::test]
    async fn test_per_name_covers_every_name() {
        let engine = engine(FlakyIndex::new(0), QueryMode::PerName);
        let outcome = engine.run(&sketches(1), None).await.unwrap();

        let matches = outcome.matches.values().next().unwrap();
        assert_eq!(matches.len(), 6);
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A", "A", "B", "B", "C", "C"]);
        assert_eq!(outcome.error_count(), 0);
    }

    #[tokio::test]
    async fn test_allowlist_order_and_unknown_names() {
        let engine = engine(FlakyIndex::new(0), QueryMode::PerName);
        let allow = vec!["C".to_string(), "missing".to_string(), "A".to_string()];
        let outcome = engine.run(&sketches(1), Some(&allow)).await.unwrap();

        let matches = outcome.matches.values().next().unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["C", "C", "A", "A"]);
    }

    #[tokio::test]
    async fn test_per_name_merge_ignores_completion_order() {
        let index = Arc::new(SlowFirstIndex {
            inner: FlakyIndex::new(0),
            completed: std::sync::Mutex::new(Vec::new()),
        });
        let engine = QueryEngine::new(
            index.clone(),
            QueryConfig {
                k: 2,
                mode: QueryMode::PerName,
                target_size: 4,
                concurrency: 3,
                ..Default::default()
            },
        )
        .unwrap();

        let allow = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let outcome = engine.run(&sketches(1), Some(&allow)).await.unwrap();

        assert_eq!(*index.completed.lock().unwrap(), vec!["C", "B", "A"]);
        let matches = outcome.matches.values().next().unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A", "A", "B", "B", "C", "C"]);
    }

    #[tokio::test]
    async fn test_global_mode() {
        let engine = engine(FlakyIndex::new(0), QueryMode::Global);
        let outcome = engine.run(&sketches(2), None).await.unwrap();

        assert_eq!(outcome.matches.len(), 2);
        for matches in outcome.matches.values() {
            assert_eq!(matches.len(), 2);
            assert!(matches[0].score <= matches[1].score);
        }
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let engine = engine(FlakyIndex::new(1), QueryMode::Global);
        let outcome = engine.run(&sketches(1), None).await.unwrap();

        assert_eq!(outcome.error_count(), 0);
        assert_eq!(outcome.matches.values().next().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_downgrades_one_sketch() {
        // Two failures exhaust the retry of the first sketch only
        let engine = engine(FlakyIndex::new(2), QueryMode::Global);
        let outcome = engine.run(&sketches(2), None).await.unwrap();

        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.error_count(), 1);
        let failed = outcome.errors.keys().next().unwrap();
        assert!(outcome.matches[failed].is_empty());
        assert!(outcome
            .matches
            .iter()
            .any(|(id, m)| id != failed && m.len() == 2));
    }

    #[tokio::test]
    async fn test_insufficient_samples() {
        let engine = engine(FlakyIndex::new(0), QueryMode::Global);
        let mut input = BTreeMap::new();
        input.insert(SketchId::new(), vec![1.0]);
        assert!(matches!(
            engine.run(&input, None).await,
            Err(Error::InsufficientSamples { got: 1, .. })
        ));

        let lenient = QueryEngine::new(
            Arc::new(FlakyIndex::new(0)),
            QueryConfig {
                target_size: 4,
                insufficient_samples: InsufficientSamplesPolicy::ZeroVector,
                ..Default::default()
            },
        )
        .unwrap();
        let outcome = lenient.run(&input, None).await.unwrap();
        assert_eq!(outcome.error_count(), 0);
    }

    #[tokio::test]
    async fn test_dtw_rerank_keeps_k() {
        let engine = QueryEngine::new(
            Arc::new(FlakyIndex::new(0)),
            QueryConfig {
                k: 1,
                mode: QueryMode::PerName,
                target_size: 4,
                rerank: Rerank::Dtw,
                ..Default::default()
            },
        )
        .unwrap();
        let outcome = engine.run(&sketches(1), None).await.unwrap();
        let matches = outcome.matches.values().next().unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.score >= 0.0));
    }

    #[test]
    fn test_engine_validation() {
        let index: Arc<dyn NearestNeighborIndex> = Arc::new(FlakyIndex::new(0));
        assert!(QueryEngine::new(
            index.clone(),
            QueryConfig {
                k: 0,
                target_size: 4,
                ..Default::default()
            }
        )
        .is_err());
        assert!(matches!(
            QueryEngine::new(index, QueryConfig::default()),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
