//! Knee-point cell calling on the barcode rank-count curve.
//!
//! Real cells sit on a high-count plateau; empty droplets form a long
//! low-count tail. The transition shows up as the point of maximum
//! curvature on the log-log rank-count curve. The curve is smoothed
//! with a moving average in log space before second-derivative
//! estimation so that runs of tied counts do not produce spurious
//! inflection points.

use crate::config::CountConfig;
use crate::dedup::BarcodeCounts;

/// Rank barcodes by total UMI count, descending.
///
/// Ties break by lexical barcode order so the ranking is deterministic
/// given identical counts. Barcodes whose every UMI was dropped carry
/// no evidence of a cell and are excluded from the curve.
pub fn rank_barcodes(aggregate: &[BarcodeCounts]) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = aggregate
        .iter()
        .filter(|bc| bc.total() > 0.0)
        .map(|bc| (bc.barcode.clone(), bc.total()))
        .collect();

    ranked.sort_unstable_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}

/// Centered moving average over the curve, window clamped at the ends.
fn smooth(values: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 {
        return values.to_vec();
    }
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

/// Find the knee of a descending count curve.
///
/// Returns the number of leading ranks retained as cells. The search
/// scans the smoothed log10 curve for the rank with the largest
/// second-derivative magnitude, within a window bounded by the
/// configured expected cell count (full range when the hint is absent
/// or zero). Among equal-curvature ranks the largest wins, so widening
/// the window never shrinks the called set on a single-knee curve.
pub fn find_knee(counts: &[f64], config: &CountConfig) -> usize {
    let n = counts.len();
    if n < 3 {
        return n;
    }

    let log_counts: Vec<f64> = counts.iter().map(|&c| c.max(f64::MIN_POSITIVE).log10()).collect();
    let smoothed = smooth(&log_counts, config.smoothing_window);

    // Interior ranks where a discrete second derivative exists.
    let (mut lo, mut hi) = (1usize, n - 2);
    if let Some(expected) = config.expected_cells {
        if expected > 0 {
            let (lo_mult, hi_mult) = config.knee_window;
            let lower = (expected as f64 * lo_mult).floor() as usize;
            let upper = (expected as f64 * hi_mult).ceil() as usize;
            lo = lo.max(lower);
            hi = hi.min(upper);
        }
    }
    if lo > hi {
        return n.min(hi + 1);
    }

    let mut best_rank = lo;
    let mut best_curvature = f64::NEG_INFINITY;
    for i in lo..=hi {
        let d2 = (smoothed[i + 1] - 2.0 * smoothed[i] + smoothed[i - 1]).abs();
        if d2 >= best_curvature {
            best_curvature = d2;
            best_rank = i;
        }
    }

    best_rank + 1
}

/// Rank barcodes and cut at the knee.
///
/// Returns the ordered retained barcode list and the knee rank.
pub fn call_cells(aggregate: &[BarcodeCounts], config: &CountConfig) -> (Vec<String>, usize) {
    let ranked = rank_barcodes(aggregate);
    let counts: Vec<f64> = ranked.iter().map(|(_, c)| *c).collect();
    let knee = find_knee(&counts, config);

    let retained = ranked
        .into_iter()
        .take(knee)
        .map(|(barcode, _)| barcode)
        .collect();
    (retained, knee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn barcode_counts(pairs: &[(&str, f64)]) -> Vec<BarcodeCounts> {
        pairs
            .iter()
            .map(|(bc, total)| {
                let mut counts = FxHashMap::default();
                counts.insert(0u32, *total);
                BarcodeCounts {
                    barcode: bc.to_string(),
                    counts,
                }
            })
            .collect()
    }

    /// 60 high-count cells followed by a long empty-droplet tail.
    fn plateau_curve() -> Vec<f64> {
        let mut counts = vec![1000.0; 60];
        counts.extend(vec![4.0; 600]);
        counts
    }

    #[test]
    fn test_rank_barcodes_descending_with_lexical_ties() {
        let aggregate = barcode_counts(&[("TTT", 5.0), ("AAA", 9.0), ("CCC", 5.0)]);
        let ranked = rank_barcodes(&aggregate);

        assert_eq!(ranked[0].0, "AAA");
        assert_eq!(ranked[1].0, "CCC");
        assert_eq!(ranked[2].0, "TTT");
    }

    #[test]
    fn test_rank_barcodes_drops_zero_totals() {
        let aggregate = barcode_counts(&[("AAA", 3.0), ("TTT", 0.0)]);
        let ranked = rank_barcodes(&aggregate);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_knee_on_plateau_curve() {
        let counts = plateau_curve();
        let config = CountConfig::default().with_smoothing_window(1);
        let knee = find_knee(&counts, &config);

        // The transition sits at rank 60; the discrete curvature peak
        // may land one rank to either side.
        assert!((59..=61).contains(&knee), "knee = {}", knee);
    }

    #[test]
    fn test_knee_with_smoothing_stays_near_transition() {
        let counts = plateau_curve();
        let config = CountConfig::default().with_smoothing_window(7);
        let knee = find_knee(&counts, &config);
        assert!((56..=64).contains(&knee), "knee = {}", knee);
    }

    #[test]
    fn test_knee_bounded_by_expected_cells() {
        let counts = plateau_curve();
        let config = CountConfig::default()
            .with_smoothing_window(1)
            .with_expected_cells(Some(60));
        let knee = find_knee(&counts, &config);
        assert!((59..=61).contains(&knee), "knee = {}", knee);
    }

    #[test]
    fn test_knee_window_widening_is_monotonic() {
        let counts = plateau_curve();
        let tight = CountConfig::default()
            .with_smoothing_window(1)
            .with_expected_cells(Some(60))
            .with_knee_window(0.5, 2.0);
        let wide = CountConfig::default()
            .with_smoothing_window(1)
            .with_expected_cells(Some(60))
            .with_knee_window(0.1, 10.0);

        let knee_tight = find_knee(&counts, &tight);
        let knee_wide = find_knee(&counts, &wide);
        assert!(knee_wide >= knee_tight);
    }

    #[test]
    fn test_tiny_curves_retain_everything() {
        let config = CountConfig::default();
        assert_eq!(find_knee(&[], &config), 0);
        assert_eq!(find_knee(&[10.0], &config), 1);
        assert_eq!(find_knee(&[10.0, 1.0], &config), 2);
    }

    #[test]
    fn test_call_cells_returns_ordered_prefix() {
        let mut pairs: Vec<(String, f64)> = Vec::new();
        for i in 0..60 {
            pairs.push((format!("CELL{:03}", i), 1000.0));
        }
        for i in 0..600 {
            pairs.push((format!("DROP{:03}", i), 4.0));
        }
        let pairs_ref: Vec<(&str, f64)> = pairs.iter().map(|(b, c)| (b.as_str(), *c)).collect();
        let aggregate = barcode_counts(&pairs_ref);

        let config = CountConfig::default().with_smoothing_window(1);
        let (retained, knee) = call_cells(&aggregate, &config);

        assert_eq!(retained.len(), knee);
        assert!((59..=61).contains(&knee));
        // Every retained barcode is from the plateau.
        assert!(retained.iter().take(59).all(|b| b.starts_with("CELL")));
    }
}
