/// Small epsilon added inside log() so a zero probability contributes 0, not NaN.
pub const ENTROPY_EPS: f64 = 1e-7;

/// Shannon entropy in nats: `-Σ p_i · ln(p_i + ε)`.
///
/// The ε shift makes a one-hot row come out at about `-1e-7`; the result is
/// floored at zero.
pub fn entropy(p: &[f64]) -> f64 {
    (-p.iter().map(|&x| x * (x + ENTROPY_EPS).ln()).sum::<f64>()).max(0.0)
}

/// Numerically stable `ln Σ exp(x_i)`. Returns `-inf` for an empty slice.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// `x - logsumexp(x)` for one row.
pub fn log_softmax(xs: &[f64]) -> Vec<f64> {
    let lse = logsumexp(xs);
    xs.iter().map(|x| x - lse).collect()
}

/// `p`-th percentile with linear interpolation between the closest ranks
/// (the conventional "linear" method). `p` is on the 0..=100 scale.
///
/// Panics on an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    assert!(!values.is_empty(), "percentile of an empty slice");
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Index of the maximum element in a slice.
pub fn argmax(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Indices of the `k` largest values, highest first.
pub fn top_k(v: &[f64], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..v.len()).collect();
    idx.sort_by(|&a, &b| v[b].partial_cmp(&v[a]).unwrap_or(std::cmp::Ordering::Equal));
    idx.truncate(k);
    idx
}

/// Sample standard deviation (n - 1 in the denominator). Zero for n < 2.
pub fn std_dev(v: &[f64]) -> f64 {
    let n = v.len();
    if n < 2 {
        return 0.0;
    }
    let mean = v.iter().sum::<f64>() / n as f64;
    let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}
