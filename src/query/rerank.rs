//! Dynamic time warping re-ranking of index candidates

use std::cmp::Ordering;

use crate::index::IndexHit;

/// DTW distance between two sequences.
///
/// Local cost is the squared difference and the result is the square root of
/// the cheapest accumulated path cost, so for equal-length inputs it never
/// exceeds the Euclidean distance and identical inputs score 0. `band`
/// restricts the warping path to a Sakoe-Chiba band of that radius.
pub fn dtw_distance(a: &[f32], b: &[f32], band: Option<usize>) -> f32 {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return if n == m { 0.0 } else { f32::INFINITY };
    }

    // The band must at least cover the length difference or no path exists
    let radius = band.map(|r| r.max(n.abs_diff(m)));

    let mut prev = vec![f32::INFINITY; m + 1];
    let mut curr = vec![f32::INFINITY; m + 1];
    prev[0] = 0.0;

    for i in 1..=n {
        curr.fill(f32::INFINITY);
        let (lo, hi) = match radius {
            Some(r) => (i.saturating_sub(r).max(1), (i + r).min(m)),
            None => (1, m),
        };
        for j in lo..=hi {
            let cost = (a[i - 1] - b[j - 1]).powi(2);
            let best = prev[j - 1].min(prev[j]).min(curr[j - 1]);
            curr[j] = cost + best;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m].sqrt()
}

/// Re-score candidates against `query` with DTW and keep the best `k`.
///
/// Ties keep the index's original order.
pub fn rerank(query: &[f32], mut hits: Vec<IndexHit>, k: usize, band: Option<usize>) -> Vec<IndexHit> {
    for hit in &mut hits {
        hit.distance = dtw_distance(query, &hit.vector, band);
    }
    hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::flat::l2_distance;
    use crate::types::WindowMetadata;

    fn hit(id: &str, vector: Vec<f32>, distance: f32) -> IndexHit {
        IndexHit {
            id: id.to_string(),
            metadata: WindowMetadata {
                name: "A".to_string(),
                start_date: String::new(),
                end_date: String::new(),
                start_idx: 0,
                end_idx: vector.len(),
                window_size: vector.len(),
                document: String::new(),
            },
            distance,
            vector,
        }
    }

    #[test]
    fn test_dtw_identical_is_zero() {
        let a = [0.0, 0.3, 1.0, 0.4];
        assert_eq!(dtw_distance(&a, &a, None), 0.0);
        assert_eq!(dtw_distance(&a, &a, Some(0)), 0.0);
    }

    #[test]
    fn test_dtw_bounded_by_euclidean() {
        let a = [0.0, 0.0, 1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0, 0.0, 0.0];
        let dtw = dtw_distance(&a, &b, None);
        assert!(dtw <= l2_distance(&a, &b));
        // A one-step shift warps away completely
        assert!(dtw < 1e-6);

        // Radius 0 forces the diagonal, which is plain Euclidean
        assert!((dtw_distance(&a, &b, Some(0)) - l2_distance(&a, &b)).abs() < 1e-6);
    }

    #[test]
    fn test_dtw_unequal_lengths() {
        let d = dtw_distance(&[0.0, 1.0], &[0.0, 0.5, 1.0], Some(0));
        assert!(d.is_finite());
        assert_eq!(dtw_distance(&[], &[1.0], None), f32::INFINITY);
    }

    #[test]
    fn test_rerank_orders_and_truncates() {
        let query = vec![0.0, 0.0, 1.0, 0.0];
        let hits = vec![
            hit("far", vec![1.0, 1.0, 0.0, 1.0], 0.1),
            hit("shifted", vec![0.0, 1.0, 0.0, 0.0], 0.2),
            hit("same", vec![0.0, 0.0, 1.0, 0.0], 0.3),
        ];

        let ranked = rerank(&query, hits, 2, None);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].distance, 0.0);
        assert!(ranked[1].distance < 1e-6);
        assert!(ranked.iter().all(|h| h.id != "far"));
    }
}
