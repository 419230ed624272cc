//! Shape normalization
//!
//! Every indexed window and every submitted sketch is reduced to the same
//! representation before any distance is computed:
//! 1. linear resampling onto `target_size` uniform positions of `[0, 1]`
//! 2. min-max scaling with `(v - min) / (max - min + EPSILON)`
//!
//! The order of the two steps is part of the index format. Changing it makes
//! query vectors incomparable with vectors already stored in a collection.

use serde::{Deserialize, Serialize};

use crate::types::Vector;
use crate::{Error, Result};

/// Minimum number of raw samples needed to interpolate
pub const MIN_SAMPLES: usize = 2;

/// Guard added to the min-max denominator; constant inputs map to all zeros
pub const EPSILON: f64 = 1e-8;

/// What to do when a shape has fewer than [`MIN_SAMPLES`] points
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientSamplesPolicy {
    /// Fail with [`Error::InsufficientSamples`]
    #[default]
    Reject,
    /// Return an all-zero vector of the requested length
    ZeroVector,
}

/// A point of a freehand path in drawing coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Normalize raw samples into a fixed-length query vector.
pub fn normalize(raw_samples: &[f64], target_size: usize) -> Result<Vector> {
    check_samples(raw_samples)?;
    let resampled = resample(raw_samples, target_size)?;
    Ok(min_max(&resampled).into_iter().map(|v| v as f32).collect())
}

/// Same as [`normalize`] but applies `policy` to short inputs.
pub fn normalize_with_policy(
    raw_samples: &[f64],
    target_size: usize,
    policy: InsufficientSamplesPolicy,
) -> Result<Vector> {
    match normalize(raw_samples, target_size) {
        Err(Error::InsufficientSamples { .. })
            if policy == InsufficientSamplesPolicy::ZeroVector =>
        {
            Ok(vec![0.0; target_size])
        }
        other => other,
    }
}

/// Linearly resample onto `target_size` points.
///
/// Input and output are both treated as evenly spaced over `[0, 1]`; the
/// original sample positions (wall-clock time) are ignored.
pub fn resample(raw_samples: &[f64], target_size: usize) -> Result<Vec<f64>> {
    check_samples(raw_samples)?;
    if target_size == 0 {
        return Err(Error::InvalidRequest("target_size must be positive".into()));
    }

    let last = (raw_samples.len() - 1) as f64;
    let steps = target_size.saturating_sub(1).max(1) as f64;

    let out = (0..target_size)
        .map(|i| {
            let pos = (i as f64 / steps) * last;
            let lo = (pos.floor() as usize).min(raw_samples.len() - 2);
            let frac = pos - lo as f64;
            raw_samples[lo] + frac * (raw_samples[lo + 1] - raw_samples[lo])
        })
        .collect();

    Ok(out)
}

/// Min-max scale into `[0, 1]`
pub fn min_max(values: &[f64]) -> Vec<f64> {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min + EPSILON;
    values.iter().map(|v| (v - min) / range).collect()
}

fn check_samples(raw_samples: &[f64]) -> Result<()> {
    if raw_samples.len() < MIN_SAMPLES {
        return Err(Error::InsufficientSamples {
            got: raw_samples.len(),
            required: MIN_SAMPLES,
        });
    }
    if raw_samples.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidRequest(
            "samples must be finite numbers".into(),
        ));
    }
    Ok(())
}

/// Extract the `M x,y` / `L x,y` vertices of an SVG-style path.
///
/// Other commands are ignored. Point order is preserved.
pub fn parse_path(path: &str) -> Vec<Point> {
    let bytes = path.as_bytes();
    let mut points = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'M' || bytes[i] == b'L' {
            if let Some((point, consumed)) = parse_pair(&path[i + 1..]) {
                points.push(point);
                i += 1 + consumed;
                continue;
            }
        }
        i += 1;
    }

    points
}

/// `x,y` with optional whitespace before x and around the separator
fn parse_pair(s: &str) -> Option<(Point, usize)> {
    let lead = s.len() - s.trim_start().len();
    let (x, x_len) = parse_number(&s[lead..])?;
    let mut pos = lead + x_len;

    let rest = &s[pos..];
    let sep = rest.len() - rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace()).len();
    if sep == 0 {
        return None;
    }
    pos += sep;

    let (y, y_len) = parse_number(&s[pos..])?;
    Some((Point::new(x, y), pos + y_len))
}

fn parse_number(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    if bytes.first() == Some(&b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    s[..end].parse::<f64>().ok().map(|v| (v, end))
}

/// Turn drawn points into `output_length` normalized samples.
///
/// Points are sorted by x, y is interpolated at evenly spaced x positions
/// between the leftmost and rightmost point, and the result is min-max
/// scaled. For points that are already evenly spaced in x the output equals
/// `normalize(ys, output_length)`.
pub fn interpolate_points(points: &[Point], output_length: usize) -> Result<Vec<f64>> {
    if points.len() < MIN_SAMPLES {
        return Err(Error::InsufficientSamples {
            got: points.len(),
            required: MIN_SAMPLES,
        });
    }
    if output_length == 0 {
        return Err(Error::InvalidRequest("output_length must be positive".into()));
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(Error::InvalidRequest("points must be finite numbers".into()));
    }

    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x));

    let x_min = sorted[0].x;
    let x_max = sorted[sorted.len() - 1].x;

    let ys: Vec<f64> = sorted.iter().map(|p| p.y).collect();
    if x_max - x_min <= f64::EPSILON {
        // Vertical stroke: no x extent to interpolate over
        return Ok(min_max(&resample(&ys, output_length)?));
    }

    let steps = output_length.saturating_sub(1).max(1) as f64;
    let mut seg = 0;
    let resampled: Vec<f64> = (0..output_length)
        .map(|i| {
            let x = x_min + (x_max - x_min) * (i as f64 / steps);
            while seg + 2 < sorted.len() && sorted[seg + 1].x < x {
                seg += 1;
            }
            let (a, b) = (sorted[seg], sorted[seg + 1]);
            let dx = b.x - a.x;
            if dx.abs() <= f64::EPSILON {
                b.y
            } else {
                a.y + (x - a.x) / dx * (b.y - a.y)
            }
        })
        .collect();

    Ok(min_max(&resampled))
}

/// Parse a drawn path and produce the sketch's sample representation.
pub fn parse_and_interpolate_path(
    path: &str,
    output_length: usize,
    policy: InsufficientSamplesPolicy,
) -> Result<Vec<f64>> {
    let points = parse_path(path);
    match interpolate_points(&points, output_length) {
        Err(Error::InsufficientSamples { .. })
            if policy == InsufficientSamplesPolicy::ZeroVector =>
        {
            Ok(vec![0.0; output_length])
        }
        other => other,
    }
}
