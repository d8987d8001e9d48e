use crate::error::{Result, TptError};
use crate::math::matrix::Matrix;
use crate::math::stats::{entropy, percentile};

/// Default confidence percentile: keep the 10% lowest-entropy views.
pub const DEFAULT_PERCENTILE: f64 = 10.0;

/// Views that survived the confidence filter, index-aligned with their
/// distributions. `kept` holds the original row of each survivor, ascending.
#[derive(Debug, Clone)]
pub struct Filtered {
    pub views: Vec<Vec<f64>>,
    pub probs: Matrix,
    pub kept: Vec<usize>,
    pub threshold: f64,
}

/// Keeps the views whose prediction entropy is at or below the
/// `percentile`-th percentile of the batch.
///
/// The comparison is inclusive, so with `percentile > 0` at least the most
/// confident view survives (ties all survive). When `preserve_original` is
/// set, row 0 (the canonical view) is always part of the result.
pub fn filter_on_entropy(
    views: &[Vec<f64>],
    probs: &Matrix,
    percentile_p: f64,
    preserve_original: bool,
) -> Result<Filtered> {
    if !(0.0..=100.0).contains(&percentile_p) {
        return Err(TptError::Config(format!(
            "confidence percentile must be in [0, 100], got {}",
            percentile_p
        )));
    }
    if probs.rows == 0 || views.len() != probs.rows {
        return Err(TptError::ShapeMismatch {
            context: "filter_on_entropy",
            expected: (views.len(), probs.cols),
            actual: probs.shape(),
        });
    }

    let entropies: Vec<f64> = probs.data.iter().map(|row| entropy(row)).collect();
    let threshold = percentile(&entropies, percentile_p);

    let mut kept: Vec<usize> = entropies.iter()
        .enumerate()
        .filter(|(_, &h)| h <= threshold)
        .map(|(i, _)| i)
        .collect();

    if preserve_original && kept.first() != Some(&0) {
        kept.insert(0, 0);
    }

    Ok(Filtered {
        views: kept.iter().map(|&i| views[i].clone()).collect(),
        probs: probs.select_rows(&kept),
        kept,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::stats::entropy;

    fn batch(rows: Vec<Vec<f64>>) -> (Vec<Vec<f64>>, Matrix) {
        let views = (0..rows.len()).map(|i| vec![i as f64]).collect();
        (views, Matrix::from_rows(rows).unwrap())
    }

    #[test]
    fn keeps_confident_views_and_aligns_inputs() {
        let (views, probs) = batch(vec![
            vec![0.2, 0.2, 0.2, 0.2, 0.2],
            vec![0.96, 0.01, 0.01, 0.01, 0.01],
            vec![0.96, 0.01, 0.01, 0.01, 0.01],
            vec![0.96, 0.01, 0.01, 0.01, 0.01],
        ]);
        let out = filter_on_entropy(&views, &probs, 10.0, false).unwrap();
        assert_eq!(out.kept, vec![1, 2, 3]);
        for (view, &row) in out.views.iter().zip(&out.kept) {
            assert_eq!(view[0], row as f64);
        }
        for row in &out.probs.data {
            assert!(entropy(row) <= out.threshold);
        }
    }

    #[test]
    fn at_least_one_survivor_for_any_positive_percentile() {
        let (views, probs) = batch(vec![
            vec![0.5, 0.5],
            vec![0.9, 0.1],
            vec![0.6, 0.4],
            vec![0.99, 0.01],
            vec![0.7, 0.3],
        ]);
        for p in [0.5, 1.0, 10.0, 33.0, 50.0, 99.0, 100.0] {
            let out = filter_on_entropy(&views, &probs, p, false).unwrap();
            assert!(!out.kept.is_empty(), "no survivor at p = {}", p);
            assert_eq!(out.views.len(), out.probs.rows);
        }
        let all = filter_on_entropy(&views, &probs, 100.0, false).unwrap();
        assert_eq!(all.kept.len(), 5);
    }

    #[test]
    fn equal_entropies_all_pass() {
        let (views, probs) = batch(vec![vec![0.5, 0.5]; 4]);
        let out = filter_on_entropy(&views, &probs, 10.0, false).unwrap();
        assert_eq!(out.kept, vec![0, 1, 2, 3]);
    }

    #[test]
    fn canonical_view_is_forced_in_when_requested() {
        let (views, probs) = batch(vec![
            vec![0.5, 0.5],
            vec![0.99, 0.01],
            vec![0.6, 0.4],
        ]);
        let dropped = filter_on_entropy(&views, &probs, 10.0, false).unwrap();
        assert_eq!(dropped.kept, vec![1]);

        let preserved = filter_on_entropy(&views, &probs, 10.0, true).unwrap();
        assert_eq!(preserved.kept, vec![0, 1]);
        assert_eq!(preserved.views[0], vec![0.0]);
        assert_eq!(preserved.probs.row(0), &[0.5, 0.5]);
    }

    #[test]
    fn rejects_out_of_range_percentile() {
        let (views, probs) = batch(vec![vec![1.0, 0.0]]);
        assert!(matches!(
            filter_on_entropy(&views, &probs, 120.0, false),
            Err(TptError::Config(_))
        ));
    }
}
