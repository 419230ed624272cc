use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::builder::{BuildConfig, IdStrategy};
use crate::index::CollectionOptions;
use crate::normalize::{InsufficientSamplesPolicy, MIN_SAMPLES};
use crate::query::{QueryConfig, QueryMode, Rerank};
use crate::session::{SessionConfig, PALETTE};
use crate::storage::StorageConfig;
use crate::types::DistanceMetric;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSection,
    pub index: IndexSection,
    pub query: QuerySection,
    pub session: SessionSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    ///
    /// `SEQINDEX_CONFIG` names the file (default `config.toml`); variables
    /// such as `SEQINDEX_QUERY__K=10` override single keys.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("SEQINDEX_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path.to_path_buf()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SEQINDEX")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("index.window_sizes")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let collection = self.storage.collection.trim();
        if collection.is_empty() || collection.contains(['/', '\\']) || collection == ".." {
            bail!("storage.collection must be a plain, non-empty name");
        }

        if self.index.window_sizes.is_empty() {
            bail!("index.window_sizes must contain at least one size");
        }
        if let Some(size) = self.index.window_sizes.iter().find(|&&w| w < MIN_SAMPLES) {
            bail!("index.window_sizes entry {} is below the minimum of {}", size, MIN_SAMPLES);
        }
        if self.index.target_size == 0 {
            bail!("index.target_size must be positive");
        }
        if self.index.step == 0 {
            bail!("index.step must be positive");
        }
        if self.index.batch_size == 0 {
            bail!("index.batch_size must be positive");
        }
        if self.index.segment_rows == 0 {
            bail!("index.segment_rows must be positive");
        }
        if self.index.max_series == Some(0) {
            bail!("index.max_series must be positive when set");
        }

        if self.query.k == 0 {
            bail!("query.k must be positive");
        }
        if self.query.concurrency == 0 {
            bail!("query.concurrency must be positive");
        }
        if self.query.history_sample_count < MIN_SAMPLES {
            bail!("query.history_sample_count must be at least {}", MIN_SAMPLES);
        }

        if self.session.palette_size == 0 || self.session.palette_size > PALETTE.len() {
            bail!("session.palette_size must be between 1 and {}", PALETTE.len());
        }
        if self.session.histogram_bins == 0 {
            bail!("session.histogram_bins must be positive");
        }
        let (min, max) = self.session.default_window_range;
        if min > max {
            bail!("session.default_window_range min {} exceeds max {}", min, max);
        }
        let threshold = self.session.default_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("session.default_threshold must be a non-negative number");
        }

        Ok(())
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::Local {
            root_path: self.storage.root_path.clone(),
        }
    }

    /// WAL lives next to the collection data
    pub fn wal_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.root_path)
            .join("wal")
            .join(&self.storage.collection)
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            wal_dir: Some(self.wal_dir()),
            segment_rows: self.index.segment_rows,
        }
    }

    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            window_sizes: self.index.window_sizes.clone(),
            target_size: self.index.target_size,
            step: self.index.step,
            id_strategy: self.index.id_strategy,
            batch_size: self.index.batch_size,
        }
    }

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            k: self.query.k,
            mode: self.query.mode,
            target_size: self.index.target_size,
            concurrency: self.query.concurrency,
            rerank: self.query.rerank,
            dtw_band: self.query.dtw_band,
            insufficient_samples: self.query.insufficient_samples,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            history_sample_count: self.query.history_sample_count,
            palette_size: self.session.palette_size,
            histogram_bins: self.session.histogram_bins,
            default_window_range: self.session.default_window_range,
            default_threshold: self.session.default_threshold,
            insufficient_samples: self.query.insufficient_samples,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root_path: String,
    pub collection: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root_path: "./seqindex_db".to_string(),
            collection: "sp500_series".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub window_sizes: Vec<usize>,
    pub target_size: usize,
    pub step: usize,
    /// Index only the first N series of the corpus
    pub max_series: Option<usize>,
    pub id_strategy: IdStrategy,
    pub batch_size: usize,
    pub segment_rows: usize,
    pub metric: DistanceMetric,
}

impl Default for IndexSection {
    fn default() -> Self {
        let build = BuildConfig::default();
        Self {
            window_sizes: build.window_sizes,
            target_size: build.target_size,
            step: build.step,
            max_series: None,
            id_strategy: build.id_strategy,
            batch_size: build.batch_size,
            segment_rows: CollectionOptions::default().segment_rows,
            metric: DistanceMetric::L2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub k: usize,
    pub mode: QueryMode,
    pub history_sample_count: usize,
    pub concurrency: usize,
    pub rerank: Rerank,
    pub dtw_band: Option<usize>,
    pub insufficient_samples: InsufficientSamplesPolicy,
}

impl Default for QuerySection {
    fn default() -> Self {
        let query = QueryConfig::default();
        Self {
            k: query.k,
            mode: query.mode,
            history_sample_count: SessionConfig::default().history_sample_count,
            concurrency: query.concurrency,
            rerank: query.rerank,
            dtw_band: query.dtw_band,
            insufficient_samples: query.insufficient_samples,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub palette_size: usize,
    pub histogram_bins: usize,
    pub default_window_range: (usize, usize),
    pub default_threshold: f32,
}

impl Default for SessionSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            palette_size: session.palette_size,
            histogram_bins: session.histogram_bins,
            default_window_range: session.default_window_range,
            default_threshold: session.default_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
