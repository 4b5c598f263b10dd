//! Streaming quantile estimator
//!
//! Keeps up to [`MAX_SAMPLES`] values; past that, incoming values replace
//! random slots (reservoir sampling), so quantiles stay representative with
//! bounded memory. Quantile lookup sorts a copy and picks the sample at the
//! rounded index `phi * (n - 1) + 0.5`, which makes small-sample results
//! exact and deterministic.

use rand::Rng;

const MAX_SAMPLES: usize = 1_000;

/// Fixed-memory sample reservoir with quantile lookup.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    samples: Vec<f64>,
    count: u64,
}

impl Histogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Histogram {
            samples: Vec::new(),
            count: 0,
        }
    }

    /// Drop all accumulated samples.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.count = 0;
    }

    /// Add a sample.
    pub fn update(&mut self, v: f64) {
        self.count += 1;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(v);
            return;
        }
        let i = rand::thread_rng().gen_range(0..self.count);
        if (i as usize) < self.samples.len() {
            self.samples[i as usize] = v;
        }
    }

    /// Estimate the quantile for `phi` in `[0, 1]`. Returns NaN when no
    /// samples were added.
    pub fn quantile(&self, phi: f64) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if phi <= 0.0 {
            return sorted[0];
        }
        if phi >= 1.0 {
            return sorted[sorted.len() - 1];
        }
        let idx = (phi * (sorted.len() - 1) as f64 + 0.5) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// One-shot quantile over a value slice, skipping NaNs.
pub fn quantile(phi: f64, values: &[f64]) -> f64 {
    let mut h = Histogram::new();
    for &v in values {
        if !v.is_nan() {
            h.update(v);
        }
    }
    h.quantile(phi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(Histogram::new().quantile(0.5).is_nan());
    }

    #[test]
    fn test_median_index_rounding() {
        // 10 samples 120..210 step 10: median picks index 5 -> 170.
        let values: Vec<f64> = (0..10).map(|i| 120.0 + 10.0 * i as f64).collect();
        assert_eq!(quantile(0.5, &values), 170.0);
    }

    #[test]
    fn test_bounds() {
        let values = [3.0, 1.0, 2.0];
        assert_eq!(quantile(0.0, &values), 1.0);
        assert_eq!(quantile(1.0, &values), 3.0);
    }

    #[test]
    fn test_nan_skipped() {
        let values = [f64::NAN, 5.0, f64::NAN];
        assert_eq!(quantile(0.5, &values), 5.0);
    }

    #[test]
    fn test_reservoir_stays_bounded() {
        let mut h = Histogram::new();
        for i in 0..10_000 {
            h.update(i as f64);
        }
        let q = h.quantile(0.5);
        assert!(q.is_finite());
    }
}
