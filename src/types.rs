//! Core types for seqindex

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Vector type
pub type Vector = Vec<f32>;

/// Record ID type (globally unique string)
pub type RecordId = String;

/// Distance metric for vector search
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    L2,
    Cosine,
}

/// One named, time-ordered numeric sequence.
///
/// Missing observations are stored as `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
    pub timestamps: Vec<NaiveDate>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every value is missing (non-finite)
    pub fn is_all_missing(&self) -> bool {
        self.values.iter().all(|v| !v.is_finite())
    }
}

/// Half-open slice `[start_idx, end_idx)` of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Window {
    pub series_name: String,
    pub start_idx: usize,
    pub end_idx: usize,
}

impl Window {
    pub fn window_size(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// Metadata stored next to every indexed vector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowMetadata {
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub start_idx: usize,
    pub end_idx: usize,
    pub window_size: usize,
    /// `{name}_{start_date}_{end_date}`
    #[serde(default)]
    pub document: String,
}

/// A vector plus its metadata, the unit persisted by a collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    pub id: RecordId,
    pub vector: Vector,
    pub metadata: WindowMetadata,
}

/// Unique identifier of a submitted sketch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SketchId(pub Uuid);

impl SketchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SketchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SketchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A user-drawn query shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sketch {
    pub id: SketchId,
    /// Normalized y-values sampled at uniform x positions
    pub shapes: Vec<f64>,
    /// Window-size range that was active when the sketch was submitted
    pub window_size_filter: (usize, usize),
}

/// One nearest-neighbor hit. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub name: String,
    pub start_idx: usize,
    pub end_idx: usize,
    pub window_size: usize,
    pub score: f32,
}

impl Match {
    pub fn from_metadata(metadata: &WindowMetadata, score: f32) -> Self {
        let window_size = if metadata.window_size > 0 {
            metadata.window_size
        } else {
            metadata.end_idx.saturating_sub(metadata.start_idx)
        };
        Self {
            name: metadata.name.clone(),
            start_idx: metadata.start_idx,
            end_idx: metadata.end_idx,
            window_size,
            score,
        }
    }
}

/// Segment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: String,
    pub file_path: String,
    pub row_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Collection statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CollectionStats {
    pub total_records: usize,
    pub segment_count: usize,
    pub buffered_records: usize,
    pub per_window_size: BTreeMap<usize, usize>,
    pub per_name: BTreeMap<String, usize>,
}
