//! Aggregation engine
//!
//! Two layers:
//! - [`AggrFunc`]: stateless reduction over one materialized value slice,
//!   NaN-skipping, gated by the xFilesFactor policy in [`AggrFunc::apply`].
//! - [`AggrState`] (see [`state`]): online accumulator combining many
//!   series into one output series point-by-point.

pub mod histogram;
pub mod state;

pub use state::{new_aggr_state, AggrState};

use crate::error::{Error, Result};

/// Names whose accumulation is order-sensitive. These must always be fed
/// serially; everything else may use the concurrent wrapper.
pub fn is_serial_func(func_name: &str) -> bool {
    matches!(func_name, "diff" | "first" | "last" | "current" | "pow")
}

/// Stateless aggregation function over a materialized value slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggrFunc {
    /// Mean of non-NaN values.
    Avg,
    /// Sum of non-NaN values divided by the total length.
    AvgZero,
    /// 50th percentile.
    Median,
    /// Sum of non-NaN values.
    Sum,
    /// Minimum non-NaN value.
    Min,
    /// Maximum non-NaN value.
    Max,
    /// First non-NaN value minus the sum of the rest.
    Diff,
    /// Left-fold exponentiation over non-NaN values.
    Pow,
    /// Population standard deviation of non-NaN values.
    Stddev,
    /// Count of non-NaN values.
    Count,
    /// max - min over non-NaN values.
    Range,
    /// Product of non-NaN values.
    Multiply,
    /// First non-NaN value.
    First,
    /// Last non-NaN value.
    Last,
    /// N-th percentile, `n` in percent.
    Percentile(f64),
}

/// Average consolidation, the default for series without an override.
pub const AGGR_AVG: AggrFunc = AggrFunc::Avg;

impl AggrFunc {
    /// Look up a function by its Graphite name, including aliases.
    pub fn by_name(func_name: &str) -> Result<AggrFunc> {
        let f = match func_name {
            "average" | "avg" => AggrFunc::Avg,
            "avg_zero" => AggrFunc::AvgZero,
            "median" => AggrFunc::Median,
            "sum" | "total" => AggrFunc::Sum,
            "min" => AggrFunc::Min,
            "max" => AggrFunc::Max,
            "diff" => AggrFunc::Diff,
            "pow" => AggrFunc::Pow,
            "stddev" => AggrFunc::Stddev,
            "count" => AggrFunc::Count,
            "range" | "rangeOf" => AggrFunc::Range,
            "multiply" => AggrFunc::Multiply,
            "first" => AggrFunc::First,
            "last" | "current" => AggrFunc::Last,
            _ => {
                return Err(Error::Argument(format!(
                    "unsupported aggregate function {:?}",
                    func_name
                )));
            }
        };
        Ok(f)
    }

    /// Reduce `values` without the xFilesFactor gate.
    pub fn call(&self, values: &[f64]) -> f64 {
        match self {
            AggrFunc::Avg => aggr_avg(values),
            AggrFunc::AvgZero => aggr_avg_zero(values),
            AggrFunc::Median => histogram::quantile(0.5, values),
            AggrFunc::Sum => aggr_sum(values),
            AggrFunc::Min => fold_non_nan(values, f64::min),
            AggrFunc::Max => fold_non_nan(values, f64::max),
            AggrFunc::Diff => aggr_diff(values),
            AggrFunc::Pow => fold_non_nan(values, f64::powf),
            AggrFunc::Stddev => aggr_stddev(values),
            AggrFunc::Count => aggr_count(values),
            AggrFunc::Range => aggr_range(values),
            AggrFunc::Multiply => fold_non_nan(values, |a, b| a * b),
            AggrFunc::First => values.iter().copied().find(|v| !v.is_nan()).unwrap_or(f64::NAN),
            AggrFunc::Last => values
                .iter()
                .rev()
                .copied()
                .find(|v| !v.is_nan())
                .unwrap_or(f64::NAN),
            AggrFunc::Percentile(n) => histogram::quantile(n / 100.0, values),
        }
    }

    /// Reduce `values`, but only when enough of them are non-NaN:
    /// the function is invoked iff `count(non-NaN) >= len(values) * xff`,
    /// otherwise NaN is returned. This threshold policy is the core
    /// Graphite-compatibility invariant.
    pub fn apply(&self, x_files_factor: f64, values: &[f64]) -> f64 {
        if aggr_count(values) >= values.len() as f64 * x_files_factor {
            return self.call(values);
        }
        f64::NAN
    }
}

fn aggr_avg(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}

fn aggr_avg_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = values.iter().copied().filter(|v| !v.is_nan()).sum();
    sum / values.len() as f64
}

fn aggr_sum(values: &[f64]) -> f64 {
    let mut sum = f64::NAN;
    for &v in values {
        if v.is_nan() {
            continue;
        }
        if sum.is_nan() {
            sum = 0.0;
        }
        sum += v;
    }
    sum
}

fn aggr_diff(values: &[f64]) -> f64 {
    let mut result = f64::NAN;
    for &v in values {
        if v.is_nan() {
            continue;
        }
        if result.is_nan() {
            result = v;
        } else {
            result -= v;
        }
    }
    result
}

fn aggr_stddev(values: &[f64]) -> f64 {
    let avg = aggr_avg(values);
    if avg.is_nan() {
        return f64::NAN;
    }
    let mut sum_squares = 0.0;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            let d = v - avg;
            sum_squares += d * d;
            count += 1;
        }
    }
    (sum_squares / count as f64).sqrt()
}

fn aggr_count(values: &[f64]) -> f64 {
    values.iter().filter(|v| !v.is_nan()).count() as f64
}

fn aggr_range(values: &[f64]) -> f64 {
    let min = fold_non_nan(values, f64::min);
    if min.is_nan() {
        return f64::NAN;
    }
    fold_non_nan(values, f64::max) - min
}

fn fold_non_nan(values: &[f64], f: impl Fn(f64, f64) -> f64) -> f64 {
    let mut result = f64::NAN;
    for &v in values {
        if v.is_nan() {
            continue;
        }
        if result.is_nan() {
            result = v;
        } else {
            result = f(result, v);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAN: f64 = f64::NAN;

    #[test]
    fn test_basic_reductions() {
        let values = [1.0, NAN, 3.0];
        assert_eq!(AggrFunc::Avg.call(&values), 2.0);
        assert_eq!(AggrFunc::Sum.call(&values), 4.0);
        assert_eq!(AggrFunc::Min.call(&values), 1.0);
        assert_eq!(AggrFunc::Max.call(&values), 3.0);
        assert_eq!(AggrFunc::Count.call(&values), 2.0);
        assert_eq!(AggrFunc::Range.call(&values), 2.0);
        assert_eq!(AggrFunc::First.call(&values), 1.0);
        assert_eq!(AggrFunc::Last.call(&values), 3.0);
        assert_eq!(AggrFunc::Diff.call(&values), -2.0);
        assert_eq!(AggrFunc::Multiply.call(&values), 3.0);
        assert_eq!(AggrFunc::AvgZero.call(&values), 4.0 / 3.0);
    }

    #[test]
    fn test_all_nan() {
        let values = [NAN, NAN];
        assert!(AggrFunc::Avg.call(&values).is_nan());
        assert!(AggrFunc::Sum.call(&values).is_nan());
        assert_eq!(AggrFunc::Count.call(&values), 0.0);
        assert_eq!(AggrFunc::AvgZero.call(&values), 0.0);
    }

    #[test]
    fn test_pow_is_left_fold() {
        assert_eq!(AggrFunc::Pow.call(&[2.0, 3.0, 2.0]), 64.0);
    }

    #[test]
    fn test_stddev_population() {
        let values: Vec<f64> = (0..10).map(|i| 120.0 + 10.0 * i as f64).collect();
        let got = AggrFunc::Stddev.call(&values);
        assert!((got - 28.722813232690143).abs() < 1e-12, "got {}", got);
    }

    #[test]
    fn test_apply_xfilesfactor_boundary() {
        let values = [1.0, NAN, 3.0, NAN];
        // 2 of 4 non-NaN: xff=0.5 is exactly at the boundary and passes.
        assert_eq!(AggrFunc::Sum.apply(0.5, &values), 4.0);
        assert!(AggrFunc::Sum.apply(0.51, &values).is_nan());
        // xff=0: a single non-NaN suffices.
        assert_eq!(AggrFunc::Sum.apply(0.0, &[NAN, 7.0]), 7.0);
        // xff=1: all values must be non-NaN.
        assert!(AggrFunc::Sum.apply(1.0, &values).is_nan());
        assert_eq!(AggrFunc::Sum.apply(1.0, &[1.0, 2.0]), 3.0);
    }

    #[test]
    fn test_by_name_aliases() {
        assert_eq!(AggrFunc::by_name("average").unwrap(), AggrFunc::Avg);
        assert_eq!(AggrFunc::by_name("total").unwrap(), AggrFunc::Sum);
        assert_eq!(AggrFunc::by_name("rangeOf").unwrap(), AggrFunc::Range);
        assert_eq!(AggrFunc::by_name("current").unwrap(), AggrFunc::Last);
        assert!(AggrFunc::by_name("nope").is_err());
    }

    #[test]
    fn test_serial_classification() {
        for name in ["diff", "first", "last", "current", "pow"] {
            assert!(is_serial_func(name), "{}", name);
        }
        for name in ["sum", "avg", "max", "median"] {
            assert!(!is_serial_func(name), "{}", name);
        }
    }
}
