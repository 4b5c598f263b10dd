//! Pointwise and bucketing transforms
//!
//! The workhorse family: per-point math (absolute, scale, logarithm),
//! counter handling (derivative, perSecond, nonNegativeDerivative), gap
//! filling (keepLastValue, interpolate, transformNull) and re-bucketing
//! (summarize, smartSummarize, hitcount).

use std::sync::Arc;

use crate::aggr::AggrFunc;
use crate::error::{Error, Result};
use crate::eval::config::{align_time_unit, parse_interval, EvalConfig};
use crate::eval::series::Series;
use crate::eval::stream::{concurrent_map, drain_all_series, serial_map, SeriesStreamBox};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_number, get_optional_arg, get_optional_bool, get_optional_number,
    get_optional_string, get_string,
};
use crate::functions::{check_arg_count, fetch_normalized_series};
use crate::parser::{format_float, quote_string, Expr, FuncExpr};

// ============================================================================
// Pointwise math
// ============================================================================

pub(crate) fn absolute(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = v.abs();
            }
            s.name = format!("absolute({})", s.name);
            s.tags.insert("absolute".to_string(), "1".to_string());
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn add(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "constant", 1)?;
    let n_str = format_float(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v += n;
            }
            s.tags.insert("add".to_string(), n_str.clone());
            s.name = format!("add({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn exp(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = v.exp();
            }
            s.tags.insert("exp".to_string(), "e".to_string());
            s.name = format!("exp({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn invert(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = 1.0 / *v;
            }
            s.tags.insert("invert".to_string(), "1".to_string());
            s.name = format!("invert({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn logarithm(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let base = get_optional_number(&fe.args, "base", 1, 10.0)?;
    let base_str = format_float(base);
    let base_log = base.ln();
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = v.ln() / base_log;
            }
            s.tags.insert("log".to_string(), base_str.clone());
            s.name = format!("log({},{})", s.name, base_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn logit(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = (*v / (1.0 - *v)).ln();
            }
            s.tags.insert("logit".to_string(), "logit".to_string());
            s.name = format!("logit({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Rescale every series onto `[0, 1]` by its own min and max.
pub(crate) fn min_max(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut min = AggrFunc::Min.call(&s.values);
            if min.is_nan() {
                min = 0.0;
            }
            let mut max = AggrFunc::Max.call(&s.values);
            if max.is_nan() {
                max = 0.0;
            }
            let v_range = max - min;
            for v in s.values.iter_mut() {
                let scaled = (*v - min) / v_range;
                *v = if scaled.is_infinite() { 0.0 } else { scaled };
            }
            s.name = format!("minMax({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Replace every point with the given percentile of the whole series.
pub(crate) fn n_percentile(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let n_str = format_float(n);
    let aggr_func = AggrFunc::Percentile(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let percentile = aggr_func.call(&s.values);
            for v in s.values.iter_mut() {
                *v = percentile;
            }
            s.tags.insert("nPercentile".to_string(), n_str.clone());
            s.name = format!("nPercentile({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn offset(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let factor = get_number(&fe.args, "factor", 1)?;
    let factor_str = format_float(factor);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                if !v.is_nan() {
                    *v += factor;
                }
            }
            s.tags.insert("offset".to_string(), factor_str.clone());
            s.name = format!("offset({},{})", s.name, factor_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn offset_to_zero(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let min = AggrFunc::Min.call(&s.values);
            for v in s.values.iter_mut() {
                *v -= min;
            }
            s.tags
                .insert("offsetToZero".to_string(), format_float(min));
            s.name = format!("offsetToZero({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn pow(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let factor = get_number(&fe.args, "factor", 1)?;
    let factor_str = format_float(factor);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = v.powf(factor);
            }
            s.tags.insert("pow".to_string(), factor_str.clone());
            s.name = format!("pow({},{})", s.name, factor_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn round_function(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let precision = get_optional_number(&fe.args, "precision", 1, 0.0)?;
    let precision_product = 10f64.powi(precision as i32);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = (*v * precision_product).round() / precision_product;
            }
            s.name = if precision == 0.0 {
                format!("round({})", s.name)
            } else {
                format!("round({},{})", s.name, format_float(precision))
            };
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn scale(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let factor = get_number(&fe.args, "factor", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v *= factor;
            }
            s.name = format!("scale({},{})", s.name, format_float(factor));
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Scale every point so it covers `seconds` of wall time instead of its
/// own step.
pub(crate) fn scale_to_seconds(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let seconds = get_number(&fe.args, "seconds", 1)?;
    let seconds_str = format_float(seconds);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let timestamps = &s.timestamps;
            let mut step_secs = if timestamps.len() > 1 {
                (timestamps[1] - timestamps[0]) as f64 / 1000.0
            } else {
                f64::NAN
            };
            let mut values = std::mem::take(&mut s.values);
            for (i, v) in values.iter_mut().enumerate() {
                if i > 0 {
                    step_secs = (timestamps[i] - timestamps[i - 1]) as f64 / 1000.0;
                }
                *v *= seconds / step_secs;
            }
            s.values = values;
            s.tags
                .insert("scaleToSeconds".to_string(), seconds_str.clone());
            s.name = format!("scaleToSeconds({},{})", s.name, seconds_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn sigmoid(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = 1.0 / (1.0 + (-*v).exp());
            }
            s.tags.insert("sigmoid".to_string(), "sigmoid".to_string());
            s.name = format!("sigmoid({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn square_root(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = v.powf(0.5);
            }
            s.tags.insert("squareRoot".to_string(), "1".to_string());
            s.name = format!("squareRoot({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Counters and derivatives
// ============================================================================

pub(crate) fn changed(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut prev_value = f64::NAN;
            for v in s.values.iter_mut() {
                if prev_value.is_nan() {
                    prev_value = *v;
                    *v = 0.0;
                } else if !v.is_nan() && prev_value != *v {
                    prev_value = *v;
                    *v = 1.0;
                } else {
                    *v = 0.0;
                }
            }
            s.name = format!("changed({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn derivative(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut prev_value = f64::NAN;
            for v in s.values.iter_mut() {
                let curr = *v;
                *v = if prev_value.is_nan() || curr.is_nan() {
                    f64::NAN
                } else {
                    curr - prev_value
                };
                prev_value = curr;
            }
            s.tags.insert("derivative".to_string(), "1".to_string());
            s.name = format!("derivative({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn non_negative_derivative(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let max_value = get_optional_number(&fe.args, "maxValue", 1, f64::NAN)?;
    let min_value = get_optional_number(&fe.args, "minValue", 2, f64::NAN)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut prev = f64::NAN;
            for v in s.values.iter_mut() {
                let (delta, next_prev) = non_negative_delta(*v, prev, max_value, min_value);
                *v = delta;
                prev = next_prev;
            }
            s.tags
                .insert("nonNegativeDerivative".to_string(), "1".to_string());
            s.name = format!("nonNegativeDerivative({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn per_second(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let max_value = get_optional_number(&fe.args, "maxValue", 1, f64::NAN)?;
    let min_value = get_optional_number(&fe.args, "minValue", 2, f64::NAN)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let timestamps = &s.timestamps;
            let mut values = std::mem::take(&mut s.values);
            let mut prev = f64::NAN;
            for (i, v) in values.iter_mut().enumerate() {
                let (delta, next_prev) = non_negative_delta(*v, prev, max_value, min_value);
                prev = next_prev;
                let step_secs = if i > 0 {
                    (timestamps[i] - timestamps[i - 1]) as f64 / 1000.0
                } else {
                    f64::NAN
                };
                *v = delta / step_secs;
            }
            s.values = values;
            s.tags.insert("perSecond".to_string(), "1".to_string());
            s.name = format!("perSecond({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Delta between consecutive counter samples, handling counter wraps via
/// the optional max/min bounds. Returns `(delta, next_prev)`.
fn non_negative_delta(curr: f64, prev: f64, max: f64, min: f64) -> (f64, f64) {
    if !max.is_nan() && curr > max {
        return (f64::NAN, f64::NAN);
    }
    if !min.is_nan() && curr < min {
        return (f64::NAN, f64::NAN);
    }
    if curr.is_nan() || prev.is_nan() {
        return (f64::NAN, curr);
    }
    if curr >= prev {
        return (curr - prev, curr);
    }
    if !max.is_nan() {
        let min = if min.is_nan() { 0.0 } else { min };
        return (max + 1.0 + curr - prev - min, curr);
    }
    if !min.is_nan() {
        return (curr - min, curr);
    }
    (f64::NAN, curr)
}

// ============================================================================
// Running sums
// ============================================================================

pub(crate) fn integral(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut sum = 0.0;
            for v in s.values.iter_mut() {
                if v.is_nan() {
                    continue;
                }
                sum += *v;
                *v = sum;
            }
            s.tags.insert("integral".to_string(), "1".to_string());
            s.name = format!("integral({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Running sum that resets at every interval boundary.
pub(crate) fn integral_by_interval(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let interval_unit = get_string(&fe.args, "intervalUnit", 1)?;
    let interval = parse_interval(&interval_unit)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let timestamps = &s.timestamps;
            let mut values = std::mem::take(&mut s.values);
            let mut sum = 0.0;
            let mut dt_prev = 0i64;
            for (i, v) in values.iter_mut().enumerate() {
                if v.is_nan() {
                    continue;
                }
                let dt = timestamps[i] / interval;
                if dt != dt_prev {
                    sum = 0.0;
                    dt_prev = dt;
                }
                sum += *v;
                *v = sum;
            }
            s.values = values;
            s.tags
                .insert("integralByInterval".to_string(), "1".to_string());
            s.name = format!(
                "integralByInterval({},{})",
                s.name,
                quote_string(&interval_unit)
            );
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Gap filling
// ============================================================================

/// Linear interpolation across NaN runs no longer than `limit`.
pub(crate) fn interpolate(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let limit = get_optional_number(&fe.args, "limit", 1, f64::INFINITY)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let values = &mut s.values;
            let mut nans_count = 0f64;
            let mut prev_value = f64::NAN;
            for i in 0..values.len() {
                let v = values[i];
                if v.is_nan() {
                    nans_count += 1.0;
                    continue;
                }
                if nans_count > 0.0 && nans_count <= limit {
                    let delta = (v - prev_value) / (nans_count + 1.0);
                    for j in i - nans_count as usize..i {
                        prev_value += delta;
                        values[j] = prev_value;
                    }
                }
                nans_count = 0.0;
                prev_value = v;
            }
            s.name = format!("interpolate({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn is_non_null(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                *v = if v.is_nan() { 0.0 } else { 1.0 };
            }
            s.tags.insert("isNonNull".to_string(), "1".to_string());
            s.name = format!("isNonNull({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Carry the last seen value across NaN runs no longer than `limit`.
pub(crate) fn keep_last_value(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let limit = get_optional_number(&fe.args, "limit", 1, f64::INFINITY)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut nans_count = 0f64;
            let mut prev_value = f64::NAN;
            for v in s.values.iter_mut() {
                if !v.is_nan() {
                    nans_count = 0.0;
                    prev_value = *v;
                    continue;
                }
                nans_count += 1.0;
                if nans_count <= limit {
                    *v = prev_value;
                }
            }
            s.name = format!("keepLastValue({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn transform_null(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let default_value = get_optional_number(&fe.args, "default", 1, 0.0)?;
    let default_str = format_float(default_value);
    let reference_series = get_optional_arg(&fe.args, "referenceSeries", 2);
    let reference_series = match reference_series {
        Some(arg) => arg,
        None => {
            // No reference: replace every NaN.
            let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
            let fe_copy = fe.clone();
            return Ok(concurrent_map(
                stream,
                Arc::new(move |mut s: Series| {
                    for v in s.values.iter_mut() {
                        if v.is_nan() {
                            *v = default_value;
                        }
                    }
                    s.tags
                        .insert("transformNull".to_string(), default_str.clone());
                    s.name = format!("transformNull({},{})", s.name, default_str);
                    s.expr = Expr::Func(fe_copy.clone());
                    s.path_expression = s.name.clone();
                    Ok(Some(s))
                }),
            ));
        }
    };
    // Replace NaNs only where the reference has data. Both sides must be
    // normalized onto the same grid for the points to match up.
    let ref_stream = ev
        .eval_expr(ec, &reference_series.expr)
        .map_err(|err| Error::Execution(format!("cannot evaluate referenceSeries: {}", err)))?;
    let (ss_ref, step) = fetch_normalized_series(ec, ref_stream, true)?;
    let mut replace_nan = vec![false; ec.points_len(step)];
    for (i, replace) in replace_nan.iter_mut().enumerate() {
        *replace = ss_ref.iter().any(|s_ref| !s_ref.values[i].is_nan());
    }
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let ec_copy = ec.clone();
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            for (v, &replace) in s.values.iter_mut().zip(replace_nan.iter()) {
                if replace && v.is_nan() {
                    *v = default_value;
                }
            }
            s.tags
                .insert("transformNull".to_string(), default_str.clone());
            s.tags
                .insert("referenceSeries".to_string(), "1".to_string());
            s.name = format!("transformNull({},{},referenceSeries)", s.name, default_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Consolidation
// ============================================================================

pub(crate) fn consolidate_by(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let func_name = get_string(&fe.args, "consolidationFunc", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    consolidate_by_generic(fe, stream, &func_name)
}

pub(crate) fn cumulative(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    consolidate_by_generic(fe, stream, "sum")
}

fn consolidate_by_generic(
    fe: &FuncExpr,
    mut stream: SeriesStreamBox,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let consolidate_func = match AggrFunc::by_name(func_name) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    let func_name = func_name.to_string();
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate_func = Some(consolidate_func);
            s.name = format!("consolidateBy({},{})", s.name, quote_string(&func_name));
            s.tags
                .insert("consolidateBy".to_string(), func_name.clone());
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn set_x_files_factor(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let x_files_factor = get_number(&fe.args, "xFilesFactor", 1)?;
    let mut ec_copy = ec.clone();
    ec_copy.x_files_factor = x_files_factor;
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let x_files_factor_str = format_float(x_files_factor);
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.x_files_factor = x_files_factor;
            s.tags
                .insert("xFilesFactor".to_string(), x_files_factor_str.clone());
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Re-bucketing
// ============================================================================

/// Integrate each value over the time it covers and sum per interval:
/// turns rates back into event counts.
pub(crate) fn hitcount(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let interval_string = get_string(&fe.args, "intervalString", 1)?;
    let interval = parse_interval(&interval_string)?;
    if interval <= 0 {
        return Err(Error::Argument(format!(
            "interval must be positive; got {}ms",
            interval
        )));
    }
    let align_to_interval = get_optional_bool(&fe.args, "alignToInterval", 2, false)?;
    let mut ec_copy = ec.clone();
    if align_to_interval {
        let unit = if interval >= 24 * 3600 * 1000 {
            "d"
        } else if interval >= 3600 * 1000 {
            "h"
        } else if interval >= 60 * 1000 {
            "min"
        } else {
            "s"
        };
        ec_copy.start_time = align_time_unit(ec_copy.start_time, unit)?;
    }
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let timestamps = &s.timestamps;
            let values = &s.values;
            let mut dst_timestamps = Vec::new();
            let mut dst_values = Vec::new();
            let mut ts = ec_copy.start_time;
            let mut i = 0;
            let mut v_prev = 0.0f64;
            while ts < ec_copy.end_time {
                let mut ts_prev = ts;
                let mut hitcount = 0.0;
                if i < timestamps.len() && !v_prev.is_nan() {
                    hitcount = v_prev * (timestamps[i] - ts_prev) as f64 / 1000.0;
                }
                let ts_end = ts + interval;
                while i < timestamps.len() {
                    let ts_curr = timestamps[i];
                    if ts_curr >= ts_end {
                        break;
                    }
                    let v = values[i];
                    if !v.is_nan() {
                        hitcount += v * ((ts_curr - ts_prev) as f64 / 1000.0);
                    }
                    ts_prev = ts_curr;
                    v_prev = v;
                    i += 1;
                }
                if hitcount == 0.0 {
                    hitcount = f64::NAN;
                }
                dst_values.push(hitcount);
                dst_timestamps.push(ts);
                ts = ts_end;
            }
            s.timestamps = dst_timestamps;
            s.values = dst_values;
            s.tags
                .insert("hitcount".to_string(), interval_string.clone());
            s.name = if align_to_interval {
                format!(
                    "hitcount({},{},true)",
                    s.name,
                    quote_string(&interval_string)
                )
            } else {
                format!("hitcount({},{})", s.name, quote_string(&interval_string))
            };
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn summarize(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 4)?;
    let interval_string = get_string(&fe.args, "intervalString", 1)?;
    let interval = parse_interval(&interval_string)
        .map_err(|err| Error::Argument(format!("cannot parse intervalString: {}", err)))?;
    if interval <= 0 {
        return Err(Error::Argument(format!(
            "interval must be positive; got {}ms",
            interval
        )));
    }
    let func_name = get_optional_string(&fe.args, "func", 2, "sum")?;
    let aggr_func = AggrFunc::by_name(&func_name)?;
    let align_to_from = get_optional_bool(&fe.args, "alignToFrom", 3, false)?;
    let mut ec_copy = ec.clone();
    if !align_to_from {
        ec_copy.start_time -= ec_copy.start_time % interval;
        ec_copy.end_time += interval - ec_copy.end_time % interval;
    }
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let x_files_factor = s.x_files_factor;
            s.summarize(
                aggr_func,
                ec_copy.start_time,
                ec_copy.end_time,
                interval,
                x_files_factor,
            );
            s.tags
                .insert("summarize".to_string(), interval_string.clone());
            s.tags
                .insert("summarizeFunction".to_string(), func_name.clone());
            s.name = if align_to_from {
                format!(
                    "summarize({},{},{},true)",
                    s.name,
                    quote_string(&interval_string),
                    quote_string(&func_name)
                )
            } else {
                format!(
                    "summarize({},{},{})",
                    s.name,
                    quote_string(&interval_string),
                    quote_string(&func_name)
                )
            };
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// summarize with calendar-aligned buckets instead of query-aligned ones.
pub(crate) fn smart_summarize(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 4)?;
    let interval_string = get_string(&fe.args, "intervalString", 1)?;
    let interval = parse_interval(&interval_string)
        .map_err(|err| Error::Argument(format!("cannot parse intervalString: {}", err)))?;
    if interval <= 0 {
        return Err(Error::Argument(format!(
            "interval must be positive; got {}ms",
            interval
        )));
    }
    let func_name = get_optional_string(&fe.args, "func", 2, "sum")?;
    let aggr_func = AggrFunc::by_name(&func_name)?;
    let align_to = get_optional_string(&fe.args, "alignTo", 3, "")?;
    let mut ec_copy = ec.clone();
    if !align_to.is_empty() {
        ec_copy.start_time = align_time_unit(ec_copy.start_time, &align_to)?;
    }
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let x_files_factor = s.x_files_factor;
            s.summarize(
                aggr_func,
                ec_copy.start_time,
                ec_copy.end_time,
                interval,
                x_files_factor,
            );
            s.tags
                .insert("smartSummarize".to_string(), interval_string.clone());
            s.tags
                .insert("smartSummarizeFunction".to_string(), func_name.clone());
            s.name = format!(
                "smartSummarize({},{},{})",
                s.name,
                quote_string(&interval_string),
                quote_string(&func_name)
            );
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::source::MemorySource;
    use crate::eval::stream::fetch_all_series;

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 0,
            end_time: 300_000,
            storage_step: 60_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    fn source_with(values: &[f64]) -> MemorySource {
        let mut source = MemorySource::new();
        let timestamps: Vec<i64> = (0..values.len() as i64).map(|i| i * 60_000).collect();
        source.add_series("foo.bar", 60_000, timestamps, values.to_vec());
        source
    }

    fn eval(source: MemorySource, query: &str) -> Vec<Series> {
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        let mut stream = ev.exec_expr(&ec, query).unwrap();
        fetch_all_series(stream.as_mut()).unwrap()
    }

    #[test]
    fn test_absolute() {
        let ss = eval(source_with(&[-1.0, 2.0, -3.0]), "absolute(foo.bar)");
        assert_eq!(ss[0].name, "absolute(foo.bar)");
        assert_eq!(ss[0].values, vec![1.0, 2.0, 3.0]);
        assert_eq!(ss[0].tags.get("absolute").unwrap(), "1");
    }

    #[test]
    fn test_add() {
        let ss = eval(source_with(&[1.0, 2.0]), "add(foo.bar,1.5)");
        assert_eq!(ss[0].name, "add(foo.bar,1.5)");
        assert_eq!(ss[0].values, vec![2.5, 3.5]);
    }

    #[test]
    fn test_changed() {
        let ss = eval(
            source_with(&[1.0, 1.0, 2.0, f64::NAN, 3.0]),
            "changed(foo.bar)",
        );
        assert_eq!(ss[0].values, vec![0.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_consolidate_by() {
        let ss = eval(source_with(&[1.0]), "consolidateBy(foo.bar,'max')");
        assert_eq!(ss[0].name, "consolidateBy(foo.bar,'max')");
        assert_eq!(ss[0].consolidate_func, Some(AggrFunc::Max));
        assert_eq!(ss[0].tags.get("consolidateBy").unwrap(), "max");
    }

    #[test]
    fn test_derivative() {
        let ss = eval(source_with(&[1.0, 3.0, 2.0]), "derivative(foo.bar)");
        assert!(ss[0].values[0].is_nan());
        assert_eq!(&ss[0].values[1..], &[2.0, -1.0]);
    }

    #[test]
    fn test_integral_skips_nans() {
        let ss = eval(source_with(&[1.0, f64::NAN, 2.0]), "integral(foo.bar)");
        assert_eq!(ss[0].values[0], 1.0);
        assert!(ss[0].values[1].is_nan());
        assert_eq!(ss[0].values[2], 3.0);
    }

    #[test]
    fn test_integral_by_interval_resets() {
        let ss = eval(
            source_with(&[1.0, 1.0, 1.0, 1.0, 1.0]),
            "integralByInterval(foo.bar,'2min')",
        );
        assert_eq!(ss[0].values, vec![1.0, 2.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_interpolate() {
        let ss = eval(source_with(&[1.0, f64::NAN, 3.0]), "interpolate(foo.bar)");
        assert_eq!(ss[0].values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_is_non_null() {
        let ss = eval(source_with(&[1.0, f64::NAN]), "isNonNull(foo.bar)");
        assert_eq!(ss[0].values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_keep_last_value_respects_limit() {
        let ss = eval(
            source_with(&[1.0, f64::NAN, f64::NAN, f64::NAN, 5.0]),
            "keepLastValue(foo.bar,2)",
        );
        assert_eq!(ss[0].name, "keepLastValue(foo.bar)");
        assert_eq!(&ss[0].values[..3], &[1.0, 1.0, 1.0]);
        assert!(ss[0].values[3].is_nan());
        assert_eq!(ss[0].values[4], 5.0);
    }

    #[test]
    fn test_logarithm() {
        let ss = eval(source_with(&[100.0]), "logarithm(foo.bar)");
        assert_eq!(ss[0].name, "log(foo.bar,10)");
        assert!((ss[0].values[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_min_max() {
        let ss = eval(source_with(&[1.0, 3.0, 5.0]), "minMax(foo.bar)");
        assert_eq!(ss[0].values, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_n_percentile() {
        let ss = eval(
            source_with(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            "nPercentile(foo.bar,50)",
        );
        assert_eq!(ss[0].name, "nPercentile(foo.bar,50)");
        assert_eq!(ss[0].values, vec![3.0; 5]);
    }

    #[test]
    fn test_non_negative_derivative_counter_wrap() {
        let ss = eval(
            source_with(&[1.0, 2.0, 0.0, 1.0]),
            "nonNegativeDerivative(foo.bar,3)",
        );
        assert!(ss[0].values[0].is_nan());
        assert_eq!(&ss[0].values[1..], &[1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_offset_keeps_nans() {
        let ss = eval(source_with(&[1.0, f64::NAN]), "offset(foo.bar,10)");
        assert_eq!(ss[0].values[0], 11.0);
        assert!(ss[0].values[1].is_nan());
    }

    #[test]
    fn test_offset_to_zero() {
        let ss = eval(source_with(&[2.0, 5.0, 3.0]), "offsetToZero(foo.bar)");
        assert_eq!(ss[0].values, vec![0.0, 3.0, 1.0]);
        assert_eq!(ss[0].tags.get("offsetToZero").unwrap(), "2");
    }

    #[test]
    fn test_per_second() {
        let ss = eval(source_with(&[0.0, 60.0, 120.0]), "perSecond(foo.bar)");
        assert!(ss[0].values[0].is_nan());
        assert_eq!(&ss[0].values[1..], &[1.0, 1.0]);
    }

    #[test]
    fn test_round_with_precision() {
        let ss = eval(source_with(&[1.234, 2.567]), "round(foo.bar,1)");
        assert_eq!(ss[0].name, "round(foo.bar,1)");
        assert_eq!(ss[0].values, vec![1.2, 2.6]);
    }

    #[test]
    fn test_scale_to_seconds() {
        let ss = eval(source_with(&[60.0, 60.0]), "scaleToSeconds(foo.bar,1)");
        assert_eq!(ss[0].name, "scaleToSeconds(foo.bar,1)");
        assert_eq!(ss[0].values, vec![1.0, 1.0]);
    }

    #[test]
    fn test_set_x_files_factor() {
        let ss = eval(source_with(&[1.0]), "setXFilesFactor(foo.bar,0.5)");
        assert_eq!(ss[0].x_files_factor, 0.5);
        assert_eq!(ss[0].tags.get("xFilesFactor").unwrap(), "0.5");
        assert_eq!(ss[0].name, "foo.bar");
    }

    #[test]
    fn test_summarize_extends_range() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[1.0]);
        let ss = eval(source, "summarize(foo.bar,'2min')");
        assert_eq!(ss[0].name, "summarize(foo.bar,'2min','sum')");
        assert_eq!(ss[0].timestamps, vec![0, 120_000, 240_000]);
        assert_eq!(ss[0].values, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_smart_summarize_keeps_range() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[1.0]);
        let ss = eval(source, "smartSummarize(foo.bar,'2min')");
        assert_eq!(ss[0].name, "smartSummarize(foo.bar,'2min','sum')");
        assert_eq!(ss[0].timestamps, vec![0, 120_000, 240_000]);
        assert_eq!(ss[0].values, vec![2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_hitcount() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[1.0]);
        let ss = eval(source, "hitcount(foo.bar,'2min')");
        assert_eq!(ss[0].name, "hitcount(foo.bar,'2min')");
        assert_eq!(ss[0].timestamps, vec![0, 120_000, 240_000]);
        assert_eq!(ss[0].values[0], 60.0);
        assert_eq!(ss[0].values[1], 60.0);
        assert!(ss[0].values[2].is_nan());
    }

    #[test]
    fn test_transform_null_default() {
        let ss = eval(
            source_with(&[1.0, f64::NAN, 3.0]),
            "transformNull(foo.bar)",
        );
        assert_eq!(ss[0].name, "transformNull(foo.bar,0)");
        assert_eq!(ss[0].values, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_transform_null_with_reference() {
        let mut source = MemorySource::new();
        source.add_series(
            "foo.bar",
            60_000,
            vec![0, 60_000, 120_000, 180_000, 240_000],
            vec![f64::NAN; 5],
        );
        source.add_series(
            "ref.a",
            60_000,
            vec![0, 60_000, 120_000, 180_000, 240_000],
            vec![1.0, f64::NAN, 1.0, f64::NAN, 1.0],
        );
        let ss = eval(source, "transformNull(foo.bar,0,ref.a)");
        assert_eq!(ss[0].name, "transformNull(foo.bar,0,referenceSeries)");
        assert_eq!(ss[0].values[0], 0.0);
        assert!(ss[0].values[1].is_nan());
        assert_eq!(ss[0].values[2], 0.0);
        assert!(ss[0].values[3].is_nan());
        assert_eq!(ss[0].values[4], 0.0);
    }
}
