//! Session state
//!
//! Everything a user accumulates while sketching lives in [`SessionState`].
//! Each user action is a transformation `(old state, input) -> new state`;
//! nothing is kept in globals and the persisted index is never modified.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::{Histogram, MatchSet};
use crate::filter::{rank_names, MatchFilter, WindowRange};
use crate::normalize::{self, InsufficientSamplesPolicy, Point};
use crate::query::QueryEngine;
use crate::types::{Match, Sketch, SketchId};
use crate::{Error, Result};

/// 20-entry categorical palette, indexed by submission order
pub const PALETTE: [&str; 20] = [
    "#1f77b4", "#aec7e8", "#ff7f0e", "#ffbb78", "#2ca02c", "#98df8a", "#d62728", "#ff9896",
    "#9467bd", "#c5b0d5", "#8c564b", "#c49c94", "#e377c2", "#f7b6d2", "#7f7f7f", "#c7c7c7",
    "#bcbd22", "#dbdb8d", "#17becf", "#9edae5",
];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Samples kept per sketch
    pub history_sample_count: usize,
    pub palette_size: usize,
    pub histogram_bins: usize,
    pub default_window_range: (usize, usize),
    pub default_threshold: f32,
    pub insufficient_samples: InsufficientSamplesPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_sample_count: 30,
            palette_size: PALETTE.len(),
            histogram_bins: 30,
            default_window_range: (7, 30),
            default_threshold: 1.0,
            insufficient_samples: InsufficientSamplesPolicy::Reject,
        }
    }
}

impl SessionConfig {
    /// Display color for the `index`-th submission
    pub fn color(&self, index: usize) -> &'static str {
        let size = self.palette_size.clamp(1, PALETTE.len());
        PALETTE[index % size]
    }
}

/// One submitted sketch with its matches and display state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub sketch: Sketch,
    pub matches: Vec<Match>,
    pub color: String,
    pub label: String,
    /// Series pinned for the main chart
    pub selected_series: Option<String>,
}

/// How the user drew the shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SketchInput {
    /// `M x,y L x,y ...` path
    Path(String),
    Points(Vec<Point>),
    /// Y values at evenly spaced x positions
    Samples(Vec<f64>),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub sketch: SketchInput,
    pub window_range: WindowRange,
    pub names: Option<Vec<String>>,
    /// Overrides the engine's `k`
    pub k: Option<usize>,
}

/// Partial filter update; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct FilterChange {
    pub threshold: Option<f32>,
    pub window_range: Option<WindowRange>,
    /// `Some(None)` removes the name filter
    pub names: Option<Option<Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Sketches in submission order
    pub history: Vec<Sketch>,
    pub patterns: Vec<Pattern>,
    /// Every match of every submitted sketch, unfiltered
    pub matches: MatchSet,
    pub threshold: f32,
    pub window_range: WindowRange,
    pub names: Option<Vec<String>>,
    pub selected_series: BTreeSet<String>,
    pub active_sketch: Option<SketchId>,
    pub submit_label: String,
}

impl SessionState {
    pub fn new(config: &SessionConfig) -> Self {
        let (min, max) = config.default_window_range;
        Self {
            history: Vec::new(),
            patterns: Vec::new(),
            matches: MatchSet::new(),
            threshold: config.default_threshold,
            window_range: WindowRange::clamped(min, max),
            names: None,
            selected_series: BTreeSet::new(),
            active_sketch: None,
            submit_label: submit_label(0),
        }
    }

    pub fn filter(&self) -> Result<MatchFilter> {
        let filter = MatchFilter::new(self.threshold, self.window_range)?;
        Ok(match &self.names {
            Some(names) => filter.with_names(names.iter().cloned()),
            None => filter,
        })
    }

    pub fn sketch_order(&self) -> Vec<SketchId> {
        self.history.iter().map(|s| s.id).collect()
    }
}

/// What the presentation layer renders from a state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub filtered: MatchSet,
    /// Most matches first
    pub ranked_names: Vec<(String, usize)>,
    pub histogram: Histogram,
    pub max_score: f32,
    pub window_bounds: (usize, usize),
    pub series_to_sketch: BTreeMap<String, usize>,
}

/// Result of a submission
#[derive(Debug, Clone)]
pub struct Submitted {
    pub state: SessionState,
    pub sketch_id: SketchId,
    /// Set when the index failed for this sketch (its match list is empty)
    pub error: Option<String>,
}

/// Drives session transitions against a query engine
pub struct Session {
    engine: QueryEngine,
    config: SessionConfig,
}

impl Session {
    pub fn new(engine: QueryEngine, config: SessionConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn initial_state(&self) -> SessionState {
        SessionState::new(&self.config)
    }

    /// Resample the drawn shape to `history_sample_count` normalized values
    pub fn shapes(&self, input: &SketchInput) -> Result<Vec<f64>> {
        let n = self.config.history_sample_count;
        let policy = self.config.insufficient_samples;
        let result = match input {
            SketchInput::Path(path) => return normalize::parse_and_interpolate_path(path, n, policy),
            SketchInput::Points(points) => normalize::interpolate_points(points, n),
            SketchInput::Samples(samples) => {
                let points: Vec<Point> = samples
                    .iter()
                    .enumerate()
                    .map(|(i, y)| Point::new(i as f64, *y))
                    .collect();
                normalize::interpolate_points(&points, n)
            }
        };
        match result {
            Err(Error::InsufficientSamples { .. }) if policy == InsufficientSamplesPolicy::ZeroVector => {
                Ok(vec![0.0; n])
            }
            other => other,
        }
    }

    /// Query a new sketch and fold its matches into the session.
    ///
    /// The threshold is reset to the new `max_score` so every match is
    /// visible, and every matched series becomes selected.
    pub async fn submit(&self, state: SessionState, request: SubmitRequest) -> Result<Submitted> {
        let shapes = self.shapes(&request.sketch)?;
        let sketch = Sketch {
            id: SketchId::new(),
            shapes,
            window_size_filter: request.window_range.into(),
        };

        let input = BTreeMap::from([(sketch.id, sketch.shapes.clone())]);
        let k = request.k.unwrap_or(self.engine.config().k);
        let mut outcome = self
            .engine
            .run_with_k(&input, k, request.names.as_deref())
            .await?;

        let matches = outcome.matches.remove(&sketch.id).unwrap_or_default();
        let error = outcome.errors.remove(&sketch.id);

        let mut state = state;
        state
            .matches
            .merge(&BTreeMap::from([(sketch.id, matches.clone())]));

        let index = state.patterns.len();
        state.patterns.push(Pattern {
            sketch: sketch.clone(),
            matches,
            color: self.config.color(index).to_string(),
            label: format!("Pattern {}", index + 1),
            selected_series: None,
        });
        state.history.push(sketch.clone());

        state.threshold = state.matches.max_score();
        state.window_range = request.window_range;
        state.names = request.names;
        state.selected_series = state.matches.matched_names().into_iter().collect();
        state.active_sketch = Some(sketch.id);
        state.submit_label = submit_label(state.history.len());

        tracing::debug!(
            sketch = %sketch.id,
            patterns = state.patterns.len(),
            matches = state.matches.match_count(),
            "Sketch submitted"
        );

        Ok(Submitted {
            state,
            sketch_id: sketch.id,
            error,
        })
    }

    /// Render what the current filters let through
    pub fn view(&self, state: &SessionState) -> Result<SessionView> {
        let filtered = state.filter()?.apply(&state.matches);
        Ok(SessionView {
            ranked_names: rank_names(&filtered),
            histogram: state.matches.histogram(self.config.histogram_bins),
            max_score: state.matches.max_score(),
            window_bounds: state.matches.window_bounds(),
            series_to_sketch: state.matches.series_assignment(&state.sketch_order()),
            filtered,
        })
    }

    /// Update filters without touching the index
    pub fn change_filter(&self, state: SessionState, change: FilterChange) -> Result<SessionState> {
        let mut state = state;
        if let Some(threshold) = change.threshold {
            state.threshold = threshold;
        }
        if let Some(range) = change.window_range {
            state.window_range = range;
        }
        if let Some(names) = change.names {
            state.names = names;
        }
        // Surface bad values now rather than on the next render
        state.filter()?;
        Ok(state)
    }

    /// Forget every sketch and match; the index is left alone
    pub fn clear(&self, _state: SessionState) -> SessionState {
        self.initial_state()
    }

    /// Add or remove a series from the selection
    pub fn toggle_series(&self, state: SessionState, name: &str) -> SessionState {
        let mut state = state;
        if !state.selected_series.remove(name) {
            state.selected_series.insert(name.to_string());
        }
        state
    }

    /// Pin `name` on the pattern of `sketch_id`
    pub fn pin_series(
        &self,
        state: SessionState,
        sketch_id: SketchId,
        name: Option<String>,
    ) -> Result<SessionState> {
        let mut state = state;
        let pattern = state
            .patterns
            .iter_mut()
            .find(|p| p.sketch.id == sketch_id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown sketch {}", sketch_id)))?;
        pattern.selected_series = name;
        Ok(state)
    }
}

fn submit_label(count: usize) -> String {
    format!("Submitted ({} shape{})", count, if count == 1 { "" } else { "s" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FlatIndex, IndexHit, MetadataFilter, NearestNeighborIndex};
    use crate::query::{QueryConfig, QueryMode};
    use crate::types::{DistanceMetric, IndexRecord, WindowMetadata};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    struct MemIndex(RwLock<FlatIndex>);

    #[async_trait]
    impl NearestNeighborIndex for MemIndex {
        fn dimension(&self) -> usize {
            8
        }

        async fn insert_batch(&self, records: Vec<IndexRecord>) -> Result<()> {
            self.0.write().await.add(records)
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: Option<&MetadataFilter>,
        ) -> Result<Vec<IndexHit>> {
            self.0.read().await.search(vector, k, filter)
        }

        async fn names(&self) -> Result<Vec<String>> {
            Ok(self.0.read().await.names())
        }
    }

    async fn session() -> Session {
        let index = MemIndex(RwLock::new(FlatIndex::new(8, DistanceMetric::L2).unwrap()));
        let mut records = Vec::new();
        for (n, name) in ["A", "B", "C"].iter().enumerate() {
            for (w, size) in [7usize, 14].iter().enumerate() {
                let slope = (n * 2 + w) as f64 + 1.0;
                let raw: Vec<f64> = (0..*size).map(|i| (i as f64 * slope).sin()).collect();
                records.push(IndexRecord {
                    id: format!("{}-{}", name, size),
                    vector: normalize::normalize(&raw, 8).unwrap(),
                    metadata: WindowMetadata {
                        name: name.to_string(),
                        start_date: String::new(),
                        end_date: String::new(),
                        start_idx: 0,
                        end_idx: *size,
                        window_size: *size,
                        document: String::new(),
                    },
                });
            }
        }
        index.insert_batch(records).await.unwrap();

        let engine = QueryEngine::new(
            Arc::new(index),
            QueryConfig {
                k: 1,
                mode: QueryMode::PerName,
                target_size: 8,
                ..Default::default()
            },
        )
        .unwrap();
        Session::new(engine, SessionConfig::default())
    }

    fn request(path: &str) -> SubmitRequest {
        SubmitRequest {
            sketch: SketchInput::Path(path.to_string()),
            window_range: WindowRange::new(7, 30).unwrap(),
            names: None,
            k: None,
        }
    }

    #[tokio::test]
    async fn test_submit_two_sketches() {
        let session = session().await;
        let state = session.initial_state();
        assert_eq!(state.submit_label, "Submitted (0 shapes)");

        let first = session
            .submit(state, request("M 0,0 L 10,10 L 20,0"))
            .await
            .unwrap();
        assert!(first.error.is_none());
        assert_eq!(first.state.submit_label, "Submitted (1 shape)");
        assert_eq!(first.state.history[0].shapes.len(), 30);

        let second = session
            .submit(first.state, request("M 0,10 L 10,0 L 20,5"))
            .await
            .unwrap();
        let state = second.state;

        assert_eq!(state.history.len(), 2);
        assert_eq!(state.patterns[0].color, PALETTE[0]);
        assert_eq!(state.patterns[1].color, PALETTE[1]);
        assert_eq!(state.patterns[1].label, "Pattern 2");

        let grouped = state.matches.grouped();
        for name in ["A", "B", "C"] {
            assert!(grouped[name].contains_key(&first.sketch_id));
            assert!(grouped[name].contains_key(&second.sketch_id));
        }
        assert_eq!(
            state.selected_series.iter().collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert_eq!(state.threshold, state.matches.max_score());

        let view = session.view(&state).unwrap();
        assert_eq!(view.filtered, state.matches);
        assert_eq!(view.series_to_sketch["A"], 0);
        assert_eq!(view.histogram.counts.len(), 30);
    }

    #[tokio::test]
    async fn test_change_filter_and_clear() {
        let session = session().await;
        let submitted = session
            .submit(session.initial_state(), request("M 0,0 L 5,3 L 10,10"))
            .await
            .unwrap();

        let rejected = session.change_filter(
            submitted.state.clone(),
            FilterChange {
                threshold: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(matches!(rejected, Err(Error::InvalidFilter(_))));

        let state = session
            .change_filter(
                submitted.state,
                FilterChange {
                    window_range: Some(WindowRange::new(14, 14).unwrap()),
                    names: Some(Some(vec!["B".to_string()])),
                    ..Default::default()
                },
            )
            .unwrap();
        let view = session.view(&state).unwrap();
        assert!(view
            .filtered
            .iter()
            .all(|(name, _, m)| name == "B" && m.window_size == 14));
        assert!(view.ranked_names.len() <= 1);
        // Unfiltered matches are kept for the next filter change
        assert_eq!(state.matches.matched_names().len(), 3);

        let cleared = session.clear(state);
        assert_eq!(cleared, session.initial_state());
    }

    #[tokio::test]
    async fn test_selection() {
        let session = session().await;
        let submitted = session
            .submit(session.initial_state(), request("M 0,0 L 10,10"))
            .await
            .unwrap();

        let state = session.toggle_series(submitted.state, "A");
        assert!(!state.selected_series.contains("A"));
        let state = session.toggle_series(state, "A");
        assert!(state.selected_series.contains("A"));

        let state = session
            .pin_series(state, submitted.sketch_id, Some("B".into()))
            .unwrap();
        assert_eq!(state.patterns[0].selected_series.as_deref(), Some("B"));
        assert!(session.pin_series(state, SketchId::new(), None).is_err());
    }

    #[tokio::test]
    async fn test_rejects_short_sketch() {
        let session = session().await;
        let result = session
            .submit(session.initial_state(), request("M 3,4"))
            .await;
        assert!(matches!(result, Err(Error::InsufficientSamples { .. })));
    }

    #[test]
    fn test_palette_wraps() {
        let config = SessionConfig::default();
        assert_eq!(config.color(0), config.color(20));
        assert_ne!(config.color(0), config.color(1));
    }
}
