//! Index builder
//!
//! Slides fixed-size windows over every series of a corpus, normalizes each
//! gap-free window and inserts it into a [`NearestNeighborIndex`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::corpus::Corpus;
use crate::index::NearestNeighborIndex;
use crate::normalize::{self, MIN_SAMPLES};
use crate::types::{IndexRecord, RecordId, Series, Window, WindowMetadata};
use crate::{Error, Result};

/// How record ids are assigned
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Fresh UUIDv4 per record; rebuilding without clearing duplicates the corpus
    #[default]
    Random,
    /// UUIDv5 of `(name, window_size, start_idx)`; rebuilds overwrite in place
    Stable,
}

impl IdStrategy {
    pub fn record_id(&self, name: &str, window_size: usize, start_idx: usize) -> RecordId {
        match self {
            IdStrategy::Random => Uuid::new_v4().to_string(),
            IdStrategy::Stable => {
                let key = format!("{}\u{1f}{}\u{1f}{}", name, window_size, start_idx);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
            }
        }
    }
}

/// Builder settings
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub window_sizes: Vec<usize>,
    pub target_size: usize,
    pub step: usize,
    pub id_strategy: IdStrategy,
    /// Records per `insert_batch` call
    pub batch_size: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            window_sizes: vec![7, 14, 30],
            target_size: 32,
            step: 1,
            id_strategy: IdStrategy::Random,
            batch_size: 1024,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_sizes.is_empty() {
            return Err(Error::InvalidRequest("window_sizes must not be empty".into()));
        }
        if let Some(&w) = self.window_sizes.iter().find(|&&w| w < MIN_SAMPLES) {
            return Err(Error::InvalidRequest(format!(
                "window size {} is smaller than {}",
                w, MIN_SAMPLES
            )));
        }
        if self.target_size == 0 {
            return Err(Error::InvalidRequest("target_size must be positive".into()));
        }
        if self.step == 0 {
            return Err(Error::InvalidRequest("step must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidRequest("batch_size must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one build run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub inserted: usize,
    /// Windows dropped because they contain a missing value
    pub skipped_windows: usize,
    /// Series that yield no windows at all (empty, too short or all missing)
    pub skipped_series: usize,
}

/// Gap-free windows of `series`, in start order.
///
/// Starts run from 0 to `len - window_size` inclusive by `step`; a window
/// that touches any non-finite value is left out.
pub fn windows(series: &Series, window_size: usize, step: usize) -> impl Iterator<Item = Window> + '_ {
    // missing[i] = number of non-finite values in values[..i]
    let mut missing = Vec::with_capacity(series.values.len() + 1);
    missing.push(0usize);
    for v in &series.values {
        let last = missing[missing.len() - 1];
        missing.push(last + usize::from(!v.is_finite()));
    }

    let starts = match series.values.len().checked_sub(window_size) {
        Some(last) if step > 0 && window_size > 0 => Some((0..=last).step_by(step)),
        _ => None,
    };

    starts
        .into_iter()
        .flatten()
        .filter(move |&start| missing[start + window_size] == missing[start])
        .map(move |start| Window {
            series_name: series.name.clone(),
            start_idx: start,
            end_idx: start + window_size,
        })
}

/// Number of window starts for a series of `len` values, gaps ignored
fn window_count(len: usize, window_size: usize, step: usize) -> usize {
    match len.checked_sub(window_size) {
        Some(span) if step > 0 => span / step + 1,
        _ => 0,
    }
}

/// Populates an index from a corpus
pub struct IndexBuilder {
    config: BuildConfig,
}

impl IndexBuilder {
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Index every gap-free window of every series at every window size.
    ///
    /// Bad series are skipped and counted; an index write failure aborts the
    /// run (records already inserted stay in the index).
    pub async fn build(
        &self,
        corpus: &Corpus,
        index: &dyn NearestNeighborIndex,
    ) -> Result<BuildReport> {
        if index.dimension() != self.config.target_size {
            return Err(Error::DimensionMismatch {
                expected: index.dimension(),
                got: self.config.target_size,
            });
        }

        let mut report = BuildReport::default();
        let usable: Vec<&Series> = corpus
            .series()
            .iter()
            .filter(|s| {
                let usable = s.len() >= MIN_SAMPLES && !s.is_all_missing();
                if !usable {
                    tracing::warn!(series = %s.name, len = s.len(), "Skipping unusable series");
                }
                usable
            })
            .collect();
        report.skipped_series = corpus.len() - usable.len();

        let mut batch = Vec::with_capacity(self.config.batch_size);

        for &window_size in &self.config.window_sizes {
            let mut inserted = 0usize;
            let mut skipped = 0usize;

            for series in &usable {
                let mut produced = 0usize;
                for window in windows(series, window_size, self.config.step) {
                    batch.push(self.record(series, &window)?);
                    produced += 1;

                    if batch.len() >= self.config.batch_size {
                        index.insert_batch(std::mem::take(&mut batch)).await?;
                    }
                }
                inserted += produced;
                skipped += window_count(series.len(), window_size, self.config.step) - produced;
            }

            tracing::info!(window_size, inserted, skipped_windows = skipped, "Indexed window size");
            report.inserted += inserted;
            report.skipped_windows += skipped;
        }

        if !batch.is_empty() {
            index.insert_batch(batch).await?;
        }
        index.flush().await?;

        tracing::info!(
            inserted = report.inserted,
            skipped_windows = report.skipped_windows,
            skipped_series = report.skipped_series,
            "Index build complete"
        );
        Ok(report)
    }

    fn record(&self, series: &Series, window: &Window) -> Result<IndexRecord> {
        let values = &series.values[window.start_idx..window.end_idx];
        let vector = normalize::normalize(values, self.config.target_size)?;

        let start_date = series.timestamps[window.start_idx].format("%Y-%m-%d").to_string();
        let end_date = series.timestamps[window.end_idx - 1].format("%Y-%m-%d").to_string();
        let window_size = window.window_size();

        Ok(IndexRecord {
            id: self
                .config
                .id_strategy
                .record_id(&series.name, window_size, window.start_idx),
            vector,
            metadata: WindowMetadata {
                document: format!("{}_{}_{}", series.name, start_date, end_date),
                name: series.name.clone(),
                start_date,
                end_date,
                start_idx: window.start_idx,
                end_idx: window.end_idx,
                window_size,
            },
        })
    }
}

/// Build with default batching and random ids
pub async fn build_index(
    corpus: &Corpus,
    index: &dyn NearestNeighborIndex,
    window_sizes: &[usize],
    target_size: usize,
    step: usize,
) -> Result<BuildReport> {
    let builder = IndexBuilder::new(BuildConfig {
        window_sizes: window_sizes.to_vec(),
        target_size,
        step,
        ..BuildConfig::default()
    })?;
    builder.build(corpus, index).await
}
