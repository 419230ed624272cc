//! Match filtering and name ranking

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::MatchSet;
use crate::types::Match;
use crate::{Error, Result};

/// Inclusive window-size range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    min: usize,
    max: usize,
}

impl WindowRange {
    /// Reject `min > max`
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidFilter(format!(
                "window range min {} is greater than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Collapse a degenerate range to `min..=min`
    pub fn clamped(min: usize, max: usize) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn contains(&self, window_size: usize) -> bool {
        self.min <= window_size && window_size <= self.max
    }
}

impl From<WindowRange> for (usize, usize) {
    fn from(range: WindowRange) -> Self {
        (range.min, range.max)
    }
}

/// Threshold, window range and optional name allow-list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFilter {
    threshold: f32,
    window_range: WindowRange,
    names: Option<BTreeSet<String>>,
}

impl MatchFilter {
    pub fn new(threshold: f32, window_range: WindowRange) -> Result<Self> {
        if threshold.is_nan() || threshold < 0.0 {
            return Err(Error::InvalidFilter(format!(
                "threshold must be a non-negative number, got {}",
                threshold
            )));
        }
        Ok(Self {
            threshold,
            window_range,
            names: None,
        })
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn window_range(&self) -> WindowRange {
        self.window_range
    }

    pub fn names(&self) -> Option<&BTreeSet<String>> {
        self.names.as_ref()
    }

    /// Non-finite scores never pass
    pub fn passes(&self, m: &Match) -> bool {
        m.score.is_finite() && m.score <= self.threshold && self.window_range.contains(m.window_size)
    }

    fn allows(&self, name: &str) -> bool {
        self.names.as_ref().map_or(true, |names| names.contains(name))
    }

    /// Filtered copy of `matches`. Names and sketches left without any match
    /// are dropped.
    pub fn apply(&self, matches: &MatchSet) -> MatchSet {
        let grouped = matches
            .grouped()
            .iter()
            .filter(|(name, _)| self.allows(name))
            .filter_map(|(name, by_sketch)| {
                let kept: BTreeMap<_, Vec<Match>> = by_sketch
                    .iter()
                    .filter_map(|(id, list)| {
                        let passing: Vec<Match> =
                            list.iter().filter(|m| self.passes(m)).cloned().collect();
                        (!passing.is_empty()).then_some((*id, passing))
                    })
                    .collect();
                (!kept.is_empty()).then(|| (name.clone(), kept))
            })
            .collect();

        MatchSet::from_grouped(grouped)
    }
}

/// Names ordered by descending match count, ties by name
pub fn rank_names(matches: &MatchSet) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = matches
        .grouped()
        .iter()
        .map(|(name, by_sketch)| (name.clone(), by_sketch.values().map(Vec::len).sum()))
        .filter(|(_, count)| *count > 0)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SketchId;

    fn m(name: &str, size: usize, score: f32) -> Match {
        Match {
            name: name.to_string(),
            start_idx: 0,
            end_idx: size,
            window_size: size,
            score,
        }
    }

    fn sample() -> (MatchSet, SketchId, SketchId) {
        let s1 = SketchId::new();
        let s2 = SketchId::new();
        let mut set = MatchSet::new();
        set.merge(&BTreeMap::from([
            (
                s1,
                vec![
                    m("A", 7, 0.1),
                    m("A", 14, 0.6),
                    m("B", 30, 0.2),
                    m("C", 7, f32::NAN),
                ],
            ),
            (s2, vec![m("B", 7, 0.3), m("C", 7, 0.9), m("D", 14, 0.05)]),
        ]));
        (set, s1, s2)
    }

    #[test]
    fn test_window_range() {
        assert!(matches!(WindowRange::new(30, 7), Err(Error::InvalidFilter(_))));
        let clamped = WindowRange::clamped(30, 7);
        assert_eq!((clamped.min(), clamped.max()), (30, 30));

        let range = WindowRange::new(7, 14).unwrap();
        assert!(range.contains(7) && range.contains(14));
        assert!(!range.contains(30));
    }

    #[test]
    fn test_threshold_validation() {
        let range = WindowRange::new(7, 30).unwrap();
        assert!(MatchFilter::new(-0.1, range).is_err());
        assert!(MatchFilter::new(f32::NAN, range).is_err());
        assert!(MatchFilter::new(0.0, range).is_ok());
    }

    #[test]
    fn test_apply() {
        let (set, s1, s2) = sample();
        let filter = MatchFilter::new(0.5, WindowRange::new(7, 14).unwrap()).unwrap();
        let filtered = filter.apply(&set);

        let grouped = filtered.grouped();
        assert_eq!(grouped["A"][&s1].len(), 1);
        // B's only passing match comes from the second sketch
        assert!(!grouped["B"].contains_key(&s1));
        assert_eq!(grouped["B"][&s2].len(), 1);
        // C has only a NaN score and a score above the threshold
        assert!(!grouped.contains_key("C"));
        assert!(grouped.contains_key("D"));

        // Input untouched
        assert_eq!(set.match_count(), 7);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (set, _, _) = sample();
        let filter = MatchFilter::new(0.3, WindowRange::new(7, 30).unwrap())
            .unwrap()
            .with_names(["A", "B", "C"]);

        let once = filter.apply(&set);
        assert_eq!(filter.apply(&once), once);
        assert!(!once.grouped().contains_key("D"));
    }

    #[test]
    fn test_threshold_below_every_score() {
        let (set, _, _) = sample();
        let filter = MatchFilter::new(0.01, WindowRange::new(1, 100).unwrap()).unwrap();
        let filtered = filter.apply(&set);
        assert!(filtered.is_empty());
        assert!(filtered.grouped().is_empty());
    }

    #[test]
    fn test_rank_names() {
        let (set, _, _) = sample();
        let ranked = rank_names(&set);
        assert_eq!(
            ranked,
            vec![
                ("A".to_string(), 2),
                ("B".to_string(), 2),
                ("C".to_string(), 2),
                ("D".to_string(), 1),
            ]
        );

        let filter = MatchFilter::new(0.25, WindowRange::new(7, 30).unwrap()).unwrap();
        let ranked = rank_names(&filter.apply(&set));
        let names: Vec<&str> = ranked.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "D"]);
    }
}
