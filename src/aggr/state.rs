//! Online aggregation state
//!
//! One [`AggrState`] instance accumulates N input series into one output
//! series. `update` is called once per contributing series with a value
//! slice of exactly `points_len` entries (a mismatch is an internal
//! consolidation bug and panics); `finalize` applies the per-point
//! xFilesFactor gate against the number of contributing series.

use crate::aggr::histogram::Histogram;
use crate::error::{Error, Result};

/// Mutable accumulator combining many series into one output series.
pub trait AggrState: Send {
    /// Fold one contributing series' values into the accumulator.
    ///
    /// Panics when `values` does not have exactly `points_len` entries.
    fn update(&mut self, values: &[f64]);

    /// Produce the combined values. Points with too few contributing
    /// samples (per the xFilesFactor gate) come out as NaN.
    fn finalize(&mut self, x_files_factor: f64) -> Vec<f64>;
}

/// Create the accumulator for the given Graphite aggregate function name.
/// A trailing `Series` suffix is ignored, so `sumSeries` maps to `sum`.
pub fn new_aggr_state(points_len: usize, func_name: &str) -> Result<Box<dyn AggrState>> {
    let name = func_name.strip_suffix("Series").unwrap_or(func_name);
    let kind = match name {
        "average" | "avg" => StateKind::Avg {
            sums: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "avg_zero" => StateKind::AvgZero {
            sums: vec![0.0; points_len],
        },
        "median" => StateKind::Percentile {
            phi: 0.5,
            hs: vec![Histogram::new(); points_len],
            counts: vec![0; points_len],
        },
        "sum" | "total" => StateKind::Sum {
            sums: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "min" => StateKind::Min {
            mins: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "max" => StateKind::Max {
            maxs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "diff" => StateKind::Diff {
            vs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "pow" => StateKind::Pow {
            vs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "stddev" => StateKind::Stddev {
            means: vec![0.0; points_len],
            m2s: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "count" => StateKind::Count {
            counts: vec![0; points_len],
        },
        "range" | "rangeOf" => StateKind::Range {
            mins: vec![0.0; points_len],
            maxs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "multiply" => StateKind::Multiply {
            ms: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "first" => StateKind::First {
            vs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        "last" | "current" => StateKind::Last {
            vs: vec![0.0; points_len],
            counts: vec![0; points_len],
        },
        _ => {
            return Err(Error::Argument(format!(
                "unsupported aggregate function {:?}",
                func_name
            )));
        }
    };
    Ok(Box::new(AggrStateImpl {
        points_len,
        series_total: 0,
        kind,
    }))
}

/// Create a percentile accumulator for `n` in percent.
pub fn new_aggr_state_percentile(points_len: usize, n: f64) -> Box<dyn AggrState> {
    Box::new(AggrStateImpl {
        points_len,
        series_total: 0,
        kind: StateKind::Percentile {
            phi: n / 100.0,
            hs: vec![Histogram::new(); points_len],
            counts: vec![0; points_len],
        },
    })
}

struct AggrStateImpl {
    points_len: usize,
    series_total: usize,
    kind: StateKind,
}

enum StateKind {
    Avg { sums: Vec<f64>, counts: Vec<usize> },
    AvgZero { sums: Vec<f64> },
    Percentile { phi: f64, hs: Vec<Histogram>, counts: Vec<usize> },
    Sum { sums: Vec<f64>, counts: Vec<usize> },
    Min { mins: Vec<f64>, counts: Vec<usize> },
    Max { maxs: Vec<f64>, counts: Vec<usize> },
    Diff { vs: Vec<f64>, counts: Vec<usize> },
    Pow { vs: Vec<f64>, counts: Vec<usize> },
    Stddev { means: Vec<f64>, m2s: Vec<f64>, counts: Vec<usize> },
    Count { counts: Vec<usize> },
    Range { mins: Vec<f64>, maxs: Vec<f64>, counts: Vec<usize> },
    Multiply { ms: Vec<f64>, counts: Vec<usize> },
    First { vs: Vec<f64>, counts: Vec<usize> },
    Last { vs: Vec<f64>, counts: Vec<usize> },
}

impl AggrState for AggrStateImpl {
    fn update(&mut self, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.points_len,
            "BUG: unexpected number of points in values; got {}; want {}",
            values.len(),
            self.points_len
        );
        match &mut self.kind {
            StateKind::Avg { sums, counts } | StateKind::Sum { sums, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if !v.is_nan() {
                        sums[i] += v;
                        counts[i] += 1;
                    }
                }
            }
            StateKind::AvgZero { sums } => {
                for (i, &v) in values.iter().enumerate() {
                    if !v.is_nan() {
                        sums[i] += v;
                    }
                }
            }
            StateKind::Percentile { hs, counts, .. } => {
                for (i, &v) in values.iter().enumerate() {
                    if !v.is_nan() {
                        hs[i].update(v);
                        counts[i] += 1;
                    }
                }
            }
            StateKind::Min { mins, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    counts[i] += 1;
                    if counts[i] == 1 || v < mins[i] {
                        mins[i] = v;
                    }
                }
            }
            StateKind::Max { maxs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    counts[i] += 1;
                    if counts[i] == 1 || v > maxs[i] {
                        maxs[i] = v;
                    }
                }
            }
            StateKind::Diff { vs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    if counts[i] == 0 {
                        vs[i] = v;
                    } else {
                        vs[i] -= v;
                    }
                    counts[i] += 1;
                }
            }
            StateKind::Pow { vs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    if counts[i] == 0 {
                        vs[i] = v;
                    } else {
                        vs[i] = vs[i].powf(v);
                    }
                    counts[i] += 1;
                }
            }
            StateKind::Stddev { means, m2s, counts } => {
                // Welford's online algorithm, one accumulator per point.
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    let count = counts[i] + 1;
                    let delta = v - means[i];
                    let mean = means[i] + delta / count as f64;
                    let delta2 = v - mean;
                    means[i] = mean;
                    m2s[i] += delta * delta2;
                    counts[i] = count;
                }
            }
            StateKind::Count { counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if !v.is_nan() {
                        counts[i] += 1;
                    }
                }
            }
            StateKind::Range { mins, maxs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    counts[i] += 1;
                    if counts[i] == 1 {
                        mins[i] = v;
                        maxs[i] = v;
                    } else if v < mins[i] {
                        mins[i] = v;
                    } else if v > maxs[i] {
                        maxs[i] = v;
                    }
                }
            }
            StateKind::Multiply { ms, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    counts[i] += 1;
                    if counts[i] == 1 {
                        ms[i] = v;
                    } else {
                        ms[i] *= v;
                    }
                }
            }
            StateKind::First { vs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    counts[i] += 1;
                    if counts[i] == 1 {
                        vs[i] = v;
                    }
                }
            }
            StateKind::Last { vs, counts } => {
                for (i, &v) in values.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    vs[i] = v;
                    counts[i] += 1;
                }
            }
        }
        self.series_total += 1;
    }

    fn finalize(&mut self, x_files_factor: f64) -> Vec<f64> {
        let xff = (x_files_factor * self.series_total as f64) as usize;
        let gate = |count: usize, v: f64| -> f64 {
            if count > 0 && count >= xff {
                v
            } else {
                f64::NAN
            }
        };
        match &self.kind {
            StateKind::Avg { sums, counts } => counts
                .iter()
                .zip(sums)
                .map(|(&c, &s)| gate(c, s / c as f64))
                .collect(),
            // avg_zero ignores xFilesFactor and divides by the number of
            // contributing series, counting missing samples as zero.
            StateKind::AvgZero { sums } => {
                let total = self.series_total as f64;
                sums.iter()
                    .map(|&s| if total > 0.0 { s / total } else { f64::NAN })
                    .collect()
            }
            StateKind::Percentile { phi, hs, counts } => counts
                .iter()
                .zip(hs)
                .map(|(&c, h)| gate(c, h.quantile(*phi)))
                .collect(),
            StateKind::Sum { sums, counts } => {
                counts.iter().zip(sums).map(|(&c, &v)| gate(c, v)).collect()
            }
            StateKind::Min { mins, counts } => {
                counts.iter().zip(mins).map(|(&c, &v)| gate(c, v)).collect()
            }
            StateKind::Max { maxs, counts } => {
                counts.iter().zip(maxs).map(|(&c, &v)| gate(c, v)).collect()
            }
            StateKind::Diff { vs, counts }
            | StateKind::Pow { vs, counts }
            | StateKind::First { vs, counts }
            | StateKind::Last { vs, counts } => {
                counts.iter().zip(vs).map(|(&c, &v)| gate(c, v)).collect()
            }
            StateKind::Stddev { m2s, counts, .. } => counts
                .iter()
                .zip(m2s)
                .map(|(&c, &m2)| gate(c, (m2 / c as f64).sqrt()))
                .collect(),
            StateKind::Count { counts } => {
                counts.iter().map(|&c| gate(c, c as f64)).collect()
            }
            StateKind::Range { mins, maxs, counts } => counts
                .iter()
                .zip(mins.iter().zip(maxs))
                .map(|(&c, (&lo, &hi))| gate(c, hi - lo))
                .collect(),
            StateKind::Multiply { ms, counts } => {
                counts.iter().zip(ms).map(|(&c, &v)| gate(c, v)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAN: f64 = f64::NAN;

    fn run(name: &str, inputs: &[&[f64]], xff: f64) -> Vec<f64> {
        let mut state = new_aggr_state(inputs[0].len(), name).unwrap();
        for values in inputs {
            state.update(values);
        }
        state.finalize(xff)
    }

    #[test]
    fn test_sum() {
        assert_eq!(run("sum", &[&[1.0, 2.0], &[3.0, NAN]], 0.0), vec![4.0, 2.0]);
    }

    #[test]
    fn test_series_suffix_stripped() {
        assert_eq!(
            run("sumSeries", &[&[1.0], &[2.0]], 0.0),
            vec![3.0]
        );
    }

    #[test]
    fn test_avg_gate_counts_series() {
        // One of two series has a NaN at point 1: with xff=1 the point is
        // dropped, with xff=0.5 it survives.
        let inputs: &[&[f64]] = &[&[1.0, 2.0], &[3.0, NAN]];
        let strict = run("avg", inputs, 1.0);
        assert_eq!(strict[0], 2.0);
        assert!(strict[1].is_nan());
        assert_eq!(run("avg", inputs, 0.5), vec![2.0, 2.0]);
    }

    #[test]
    fn test_avg_zero_ignores_xff() {
        let inputs: &[&[f64]] = &[&[1.0, NAN], &[3.0, 4.0]];
        assert_eq!(run("avg_zero", inputs, 1.0), vec![2.0, 2.0]);
    }

    #[test]
    fn test_diff_is_first_minus_rest() {
        let inputs: &[&[f64]] = &[&[1.0], &[140.0]];
        assert_eq!(run("diff", inputs, 0.0), vec![-139.0]);
    }

    #[test]
    fn test_multiply_first_last_range() {
        let inputs: &[&[f64]] = &[&[2.0], &[140.0]];
        assert_eq!(run("multiply", inputs, 0.0), vec![280.0]);
        assert_eq!(run("first", inputs, 0.0), vec![2.0]);
        assert_eq!(run("last", inputs, 0.0), vec![140.0]);
        assert_eq!(run("range", inputs, 0.0), vec![138.0]);
    }

    #[test]
    fn test_median() {
        let inputs: &[&[f64]] = &[&[1.0], &[2.0], &[100.0]];
        assert_eq!(run("median", inputs, 0.0), vec![2.0]);
    }

    #[test]
    fn test_stddev_welford() {
        let inputs: &[&[f64]] = &[&[2.0], &[4.0], &[4.0], &[4.0], &[5.0], &[5.0], &[7.0], &[9.0]];
        let got = run("stddev", inputs, 0.0);
        assert!((got[0] - 2.0).abs() < 1e-12, "got {:?}", got);
    }

    #[test]
    fn test_empty_state_is_nan() {
        let mut state = new_aggr_state(2, "max").unwrap();
        let values = state.finalize(0.0);
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[test]
    #[should_panic(expected = "BUG")]
    fn test_length_mismatch_panics() {
        let mut state = new_aggr_state(3, "sum").unwrap();
        state.update(&[1.0, 2.0]);
    }

    #[test]
    fn test_unknown_function() {
        assert!(new_aggr_state(1, "bogus").is_err());
    }
}
