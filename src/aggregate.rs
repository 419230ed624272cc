//! Result aggregation
//!
//! Regroups per-sketch match lists by series name, accumulates them across
//! submissions and derives the numbers the presentation layer calibrates its
//! controls with (score histogram, threshold bound, window-size bounds).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Match, SketchId};

/// `name -> sketch_id -> matches`
pub type Grouped = BTreeMap<String, BTreeMap<SketchId, Vec<Match>>>;

/// Window-size slider bounds when there is nothing to calibrate against
pub const DEFAULT_WINDOW_BOUNDS: (usize, usize) = (7, 30);

/// Upper score bound of an empty match set
pub const DEFAULT_MAX_SCORE: f32 = 1.0;

/// Regroup query output by name, then sketch
pub fn aggregate(topk: &BTreeMap<SketchId, Vec<Match>>) -> Grouped {
    let mut set = MatchSet::new();
    set.merge(topk);
    set.into_grouped()
}

/// Fixed-width score histogram over `[0, max_score]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `bins + 1` ascending bin edges
    pub edges: Vec<f32>,
    pub counts: Vec<usize>,
}

/// Accumulated matches of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSet {
    grouped: Grouped,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_grouped(grouped: Grouped) -> Self {
        Self { grouped }
    }

    /// Append new query results; existing groups are extended, never replaced
    pub fn merge(&mut self, topk: &BTreeMap<SketchId, Vec<Match>>) {
        for (sketch_id, matches) in topk {
            for m in matches {
                let mut m = m.clone();
                if m.window_size == 0 {
                    m.window_size = m.end_idx.saturating_sub(m.start_idx);
                }
                self.grouped
                    .entry(m.name.clone())
                    .or_default()
                    .entry(*sketch_id)
                    .or_default()
                    .push(m);
            }
        }
    }

    pub fn grouped(&self) -> &Grouped {
        &self.grouped
    }

    pub fn into_grouped(self) -> Grouped {
        self.grouped
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Every match with its name and sketch
    pub fn iter(&self) -> impl Iterator<Item = (&str, SketchId, &Match)> {
        self.grouped.iter().flat_map(|(name, by_sketch)| {
            by_sketch
                .iter()
                .flat_map(move |(id, matches)| matches.iter().map(move |m| (name.as_str(), *id, m)))
        })
    }

    pub fn match_count(&self) -> usize {
        self.iter().count()
    }

    pub fn all_scores(&self) -> Vec<f32> {
        self.iter().map(|(_, _, m)| m.score).collect()
    }

    /// Largest finite score, or 1.0 when there is none (always positive)
    pub fn max_score(&self) -> f32 {
        self.iter()
            .map(|(_, _, m)| m.score)
            .filter(|s| s.is_finite())
            .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))))
            .filter(|max| *max > 0.0)
            .unwrap_or(DEFAULT_MAX_SCORE)
    }

    pub fn histogram(&self, bins: usize) -> Histogram {
        let bins = bins.max(1);
        let max = self.max_score();
        let width = max / bins as f32;

        let edges = (0..=bins).map(|i| i as f32 * width).collect();
        let mut counts = vec![0; bins];
        for score in self.all_scores().into_iter().filter(|s| s.is_finite()) {
            let bin = ((score.max(0.0) / width) as usize).min(bins - 1);
            counts[bin] += 1;
        }

        Histogram { edges, counts }
    }

    /// Distinct window sizes present
    pub fn window_sizes(&self) -> BTreeSet<usize> {
        self.iter().map(|(_, _, m)| m.window_size).collect()
    }

    /// Smallest and largest window size, or [`DEFAULT_WINDOW_BOUNDS`]
    pub fn window_bounds(&self) -> (usize, usize) {
        let sizes = self.window_sizes();
        match (sizes.first(), sizes.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => DEFAULT_WINDOW_BOUNDS,
        }
    }

    /// Names with at least one match, sorted
    pub fn matched_names(&self) -> Vec<String> {
        self.grouped
            .iter()
            .filter(|(_, by_sketch)| by_sketch.values().any(|m| !m.is_empty()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn sketch_ids(&self) -> BTreeSet<SketchId> {
        self.grouped
            .values()
            .flat_map(|by_sketch| by_sketch.keys().copied())
            .collect()
    }

    /// Assign every matched name the submission index of the earliest sketch
    /// (in `order`) that matched it. Used for display colors only.
    pub fn series_assignment(&self, order: &[SketchId]) -> BTreeMap<String, usize> {
        self.grouped
            .iter()
            .filter_map(|(name, by_sketch)| {
                order
                    .iter()
                    .position(|id| by_sketch.get(id).is_some_and(|m| !m.is_empty()))
                    .map(|idx| (name.clone(), idx))
            })
            .collect()
    }

    /// Drop everything matched for `sketch_id`
    pub fn remove_sketch(&mut self, sketch_id: SketchId) {
        for by_sketch in self.grouped.values_mut() {
            by_sketch.remove(&sketch_id);
        }
        self.grouped.retain(|_, by_sketch| !by_sketch.is_empty());
    }
}
