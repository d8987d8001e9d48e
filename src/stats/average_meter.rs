use serde::{Serialize, Deserialize};

/// Running `{sum, count}` accumulator with the last observed value.
///
/// `get_avg()` reports on the percentage scale and returns `-1.0` when
/// nothing has been observed yet; `mean()` is the raw average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `val` observed `n` times.
    pub fn update_n(&mut self, val: f64, n: u64) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    pub fn update(&mut self, val: f64) {
        self.update_n(val, 1);
    }

    /// Records a hit (1) or miss (0).
    pub fn record(&mut self, hit: bool) {
        self.update(if hit { 1.0 } else { 0.0 });
    }

    /// Average × 100, or `-1.0` for an empty meter.
    pub fn get_avg(&self) -> f64 {
        if self.count == 0 {
            return -1.0;
        }
        self.sum / self.count as f64 * 100.0
    }

    /// Plain average, `None` for an empty meter.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn fresh_meter_reports_sentinel() {
        assert_eq!(AverageMeter::new().get_avg(), -1.0);
        assert_eq!(AverageMeter::new().mean(), None);
    }

    #[test]
    fn one_hit_one_miss_is_fifty_percent() {
        let mut m = AverageMeter::new();
        m.update(1.0);
        m.update(0.0);
        assert_abs_diff_eq!(m.get_avg(), 50.0);
        assert_eq!(m.val, 0.0);
    }

    #[test]
    fn weighted_update_counts_n_times() {
        let mut m = AverageMeter::new();
        m.update_n(2.0, 3);
        assert_eq!(m.count, 3);
        assert_abs_diff_eq!(m.mean().unwrap(), 2.0);
    }
}
