//! Time-warping transforms
//!
//! Functions that look at data outside the requested range: moving windows
//! and EMA bootstrap their window before the range start, timeShift and
//! friends re-evaluate the inner expression on a shifted range, and the
//! Holt-Winters family fits a forecast on a long bootstrap interval.

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggr::{AggrFunc, AGGR_AVG};
use crate::error::{Error, Result};
use crate::eval::config::{get_window_size, parse_interval, parse_time, EvalConfig};
use crate::eval::series::Series;
use crate::eval::stream::{
    concurrent_map, drain_all_series, multi_series, peek_step, serial_map, series_group,
    SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_arg, get_number, get_optional_arg, get_optional_bool,
    get_optional_number, get_optional_string, get_string,
};
use crate::functions::{check_arg_count, fetch_normalized_series, shared, title_case};
use crate::parser::{format_float, quote_string, ArgExpr, Expr, FuncExpr};

// ============================================================================
// Point shifting
// ============================================================================

/// Shift every series by a whole number of steps, padding with NaN.
pub(crate) fn delay(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let steps = get_number(&fe.args, "steps", 1)? as i64;
    let steps_str = format!("{}", steps);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            let n = s.values.len();
            if steps < 0 {
                let k = ((-steps) as usize).min(n);
                s.values.copy_within(k.., 0);
                for v in &mut s.values[n - k..] {
                    *v = f64::NAN;
                }
            } else {
                let k = (steps as usize).min(n);
                s.values.copy_within(..n - k, k);
                for v in &mut s.values[..k] {
                    *v = f64::NAN;
                }
            }
            s.tags.insert("delay".to_string(), steps_str.clone());
            s.name = format!("delay({},{})", s.name, steps);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Moving windows
// ============================================================================

pub(crate) fn exponential_moving_average(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let window_arg = get_arg(&fe.args, "windowSize", 1)?;
    let window_size_str = window_arg.expr.to_query_string();
    let (c, window_size) = match &window_arg.expr {
        Expr::Str(se) => {
            let ws = parse_interval(&se.s)
                .map_err(|err| Error::Argument(format!("cannot parse windowSize: {}", err)))?;
            (2.0 / (ws as f64 / 1000.0 + 1.0), ws)
        }
        Expr::Number(ne) => (2.0 / (ne.n + 1.0), (ne.n * ec.storage_step as f64) as i64),
        other => {
            return Err(Error::Argument(format!(
                "windowSize must be either string or number; got {}",
                other.to_query_string()
            )));
        }
    };
    let window_size = window_size.abs();
    let mut ec_copy = ec.clone();
    ec_copy.start_time -= window_size;
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let start_time = ec.start_time;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut i = 0;
            while i < s.timestamps.len() && s.timestamps[i] < start_time {
                i += 1;
            }
            // Seed the average from the bootstrap window before the range.
            let mut ema = AGGR_AVG.call(&s.values[..i]);
            if ema.is_nan() {
                ema = 0.0;
            }
            s.timestamps.drain(..i);
            s.values.drain(..i);
            for v in s.values.iter_mut() {
                ema = c * *v + (1.0 - c) * ema;
                *v = ema;
            }
            s.tags
                .insert("exponentialMovingAverage".to_string(), window_size_str.clone());
            s.name = format!("exponentialMovingAverage({},{})", s.name, window_size_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// movingAverage, movingMax, movingMedian, movingMin and movingSum.
pub(crate) fn moving_window_generic(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let window_arg = get_arg(&fe.args, "windowSize", 1)?.clone();
    let x_files_factor = get_optional_number(&fe.args, "xFilesFactor", 2, ec.x_files_factor)?;
    let series_arg = get_arg(&fe.args, "seriesList", 0)?.clone();
    moving_window(ev, ec, fe, &series_arg, &window_arg, func_name, x_files_factor)
}

pub(crate) fn moving_window_func(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 4)?;
    let window_arg = get_arg(&fe.args, "windowSize", 1)?.clone();
    let func_name = get_optional_string(&fe.args, "func", 2, "avg")?;
    let x_files_factor = get_optional_number(&fe.args, "xFilesFactor", 3, ec.x_files_factor)?;
    let series_arg = get_arg(&fe.args, "seriesList", 0)?.clone();
    moving_window(ev, ec, fe, &series_arg, &window_arg, &func_name, x_files_factor)
}

fn moving_window(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    series_arg: &ArgExpr,
    window_arg: &ArgExpr,
    func_name: &str,
    x_files_factor: f64,
) -> Result<SeriesStreamBox> {
    let (mut window_size, steps_count) = get_window_size(ec, window_arg)?;
    let window_size_str = window_arg.expr.to_query_string();
    let aggr_func = AggrFunc::by_name(func_name)?;
    let mut ec_copy = ec.clone();
    ec_copy.start_time -= window_size;
    let mut stream = ev.eval_expr(&ec_copy, &series_arg.expr)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    if steps_count > 0.0 && step != ec.storage_step {
        // The inner call changed the step and the numeric window counts its
        // steps. Re-evaluate on the adjusted range.
        drain_all_series(stream.as_mut())?;
        window_size = (steps_count * step as f64) as i64;
        ec_copy = ec.clone();
        ec_copy.start_time -= window_size;
        stream = ev.eval_expr(&ec_copy, &series_arg.expr)?;
    }
    let tag_name = format!("moving{}", title_case(func_name));
    let start_time = ec_copy.start_time;
    let end_time = ec_copy.end_time;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let timestamps = &s.timestamps;
            let values = &s.values;
            let mut dst_timestamps = Vec::new();
            let mut dst_values = Vec::new();
            let mut ts_end = start_time + window_size;
            let mut i = 0;
            let mut j = 0;
            while ts_end <= end_time {
                let ts_start = ts_end - window_size;
                while i < timestamps.len() && timestamps[i] < ts_start {
                    i += 1;
                }
                if i > j {
                    j = i;
                }
                while j < timestamps.len() && timestamps[j] < ts_end {
                    j += 1;
                }
                dst_timestamps.push(ts_end);
                dst_values.push(aggr_func.apply(x_files_factor, &values[i..j]));
                ts_end += step;
            }
            s.timestamps = dst_timestamps;
            s.values = dst_values;
            s.tags.insert(tag_name.clone(), window_size_str.clone());
            s.name = format!("{}({},{})", tag_name, s.name, window_size_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Sliding-window standard deviation over the last `points` points.
pub(crate) fn stdev(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let points_f = get_number(&fe.args, "points", 1)?;
    let points = points_f as usize;
    let points_str = format!("{}", points);
    let window_tolerance = get_optional_number(&fe.args, "windowTolerance", 2, 0.1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let values = &s.values;
            let mut dst_values = Vec::with_capacity(values.len());
            let mut sum = 0.0;
            let mut sum2 = 0.0;
            let mut n = 0usize;
            for (i, &v) in values.iter().enumerate() {
                if !v.is_nan() {
                    n += 1;
                    sum += v;
                    sum2 += v * v;
                }
                if i >= points {
                    let old = values[i - points];
                    if !old.is_nan() {
                        n -= 1;
                        sum -= old;
                        sum2 -= old * old;
                    }
                }
                let stddev = if n > 0 && n as f64 / points_f >= window_tolerance {
                    (n as f64 * sum2 - sum * sum).sqrt() / n as f64
                } else {
                    f64::NAN
                };
                dst_values.push(stddev);
            }
            s.values = dst_values;
            s.tags.insert("stdev".to_string(), points_str.clone());
            s.name = format!("stdev({},{})", s.name, points_str);
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

// ============================================================================
// Time shifting
// ============================================================================

pub(crate) fn time_shift(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 4)?;
    let time_shift_str = get_string(&fe.args, "timeShift", 1)?;
    let mut shift = parse_interval(&time_shift_str)?;
    // A bare interval shifts into the past; an explicit `+` into the future.
    if shift > 0 && !time_shift_str.starts_with('+') {
        shift = -shift;
    }
    let reset_end = get_optional_bool(&fe.args, "resetEnd", 2, true)?;
    // alignDST is accepted for request compatibility but not applied.
    get_optional_bool(&fe.args, "alignDST", 3, false)?;
    let mut ec_copy = ec.clone();
    ec_copy.start_time += shift;
    ec_copy.end_time += shift;
    let stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let end_time = ec.end_time;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            if reset_end {
                if let Some(pos) = s.timestamps.iter().position(|&ts| ts > end_time) {
                    s.timestamps.truncate(pos);
                    s.values.truncate(pos);
                }
            }
            for ts in s.timestamps.iter_mut() {
                *ts -= shift;
            }
            s.tags.insert("timeShift".to_string(), time_shift_str.clone());
            s.name = format!("timeShift({},{})", s.name, quote_string(&time_shift_str));
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// NaN out every point outside `[startSliceAt, endSliceAt]`.
pub(crate) fn time_slice(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let start_str = get_string(&fe.args, "startSliceAt", 1)?;
    let start = parse_time(ec.current_time, &start_str)?;
    let end_str = get_optional_string(&fe.args, "endSliceAt", 2, "now")?;
    let end = parse_time(ec.current_time, &end_str)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let start_secs_str = format!("{}", start / 1000);
    let end_secs_str = format!("{}", end / 1000);
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for (ts, v) in s.timestamps.iter().zip(s.values.iter_mut()) {
                if *ts < start || *ts > end {
                    *v = f64::NAN;
                }
            }
            s.tags
                .insert("timeSliceStart".to_string(), start_secs_str.clone());
            s.tags.insert("timeSliceEnd".to_string(), end_secs_str.clone());
            s.name = format!("timeSlice({},{},{})", s.name, start_secs_str, end_secs_str);
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// One shifted copy of the inner expression per step in
/// `[timeShiftStart, timeShiftEnd]`.
pub(crate) fn time_stack(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 4)?;
    let time_shift_unit = get_optional_string(&fe.args, "timeShiftUnit", 1, "1d")?;
    let mut delta = parse_interval(&time_shift_unit)?;
    if delta > 0 && !time_shift_unit.starts_with('+') {
        delta = -delta;
    }
    let start = get_optional_number(&fe.args, "timeShiftStart", 2, 0.0)?;
    let end = get_optional_number(&fe.args, "timeShiftEnd", 3, 7.0)?;
    if end < start {
        return Err(Error::Argument(format!(
            "timeShiftEnd={} cannot be smaller than timeShiftStart={}",
            format_float(end),
            format_float(start)
        )));
    }
    let mut streams: Vec<SeriesStreamBox> = Vec::new();
    for shift in start as i64..=end as i64 {
        let inner_delta = delta * shift;
        let mut ec_copy = ec.clone();
        ec_copy.start_time += inner_delta;
        ec_copy.end_time += inner_delta;
        let stream = match eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0) {
            Ok(stream) => stream,
            Err(err) => {
                for mut earlier in streams {
                    let _ = drain_all_series(earlier.as_mut());
                }
                return Err(err);
            }
        };
        let shift_str = format!("{}", shift);
        let unit = time_shift_unit.clone();
        let fe_copy = fe.clone();
        streams.push(concurrent_map(
            stream,
            Arc::new(move |mut s: Series| {
                for ts in s.timestamps.iter_mut() {
                    *ts -= inner_delta;
                }
                s.tags.insert("timeShiftUnit".to_string(), unit.clone());
                s.tags.insert("timeShift".to_string(), shift_str.clone());
                s.name = format!("timeShift({},{},{})", s.name, unit, shift_str);
                s.expr = Expr::Func(fe_copy.clone());
                s.path_expression = s.name.clone();
                Ok(Some(s))
            }),
        ));
    }
    Ok(series_group(streams, Some(Expr::Func(fe.clone()))))
}

// ============================================================================
// Linear regression
// ============================================================================

pub(crate) fn linear_regression(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let (ss, _) = fetch_normalized_series(ec, stream, false)?;
    let start_arg = get_optional_arg(&fe.args, "startSourceAt", 1);
    let end_arg = get_optional_arg(&fe.args, "endSourceAt", 2);
    if start_arg.is_none() && end_arg.is_none() {
        // Fast path: fit each series over the requested range itself.
        return linear_regression_for_series(ec, fe, ss, None);
    }
    let mut ec_copy = ec.clone();
    ec_copy.start_time = get_time_from_arg_expr(ec_copy.start_time, ec.current_time, start_arg)?;
    ec_copy.end_time = get_time_from_arg_expr(ec_copy.end_time, ec.current_time, end_arg)?;
    let source_stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let (source_series, _) = fetch_normalized_series(&ec_copy, source_stream, false)?;
    linear_regression_for_series(&ec_copy, fe, ss, Some(source_series))
}

fn linear_regression_for_series(
    ec: &EvalConfig,
    fe: &FuncExpr,
    ss: Vec<Series>,
    source_series: Option<Vec<Series>>,
) -> Result<SeriesStreamBox> {
    let start_secs = ec.start_time / 1000;
    let end_secs = ec.end_time / 1000;
    let mut resp = Vec::with_capacity(ss.len());
    for (i, mut s) in ss.into_iter().enumerate() {
        let fit = match &source_series {
            Some(sources) => sources
                .get(i)
                .and_then(|source| linear_regression_analysis(source, s.step as f64)),
            None => linear_regression_analysis(&s, s.step as f64),
        };
        let (factor, offset) = match fit {
            Some(fit) => fit,
            None => continue,
        };
        s.tags.insert(
            "linearRegressions".to_string(),
            format!("{}, {}", start_secs, end_secs),
        );
        s.tags.insert("name".to_string(), s.name.clone());
        s.name = format!("linearRegression({}, {}, {})", s.name, start_secs, end_secs);
        s.expr = Expr::Func(fe.clone());
        s.path_expression = s.name.clone();
        let ts0 = s.timestamps.first().copied().unwrap_or_default();
        for (j, v) in s.values.iter_mut().enumerate() {
            *v = offset + (ts0 + j as i64 * s.step) as f64 * factor;
        }
        resp.push(s);
    }
    Ok(multi_series(resp))
}

fn get_time_from_arg_expr(
    origin: i64,
    current_time: i64,
    arg: Option<&ArgExpr>,
) -> Result<i64> {
    let arg = match arg {
        Some(arg) => arg,
        None => return Ok(origin),
    };
    match &arg.expr {
        Expr::Str(se) => parse_time(current_time, &se.s),
        Expr::Number(ne) => Ok((ne.n * 1000.0) as i64),
        _ => Ok(origin),
    }
}

/// Least-squares fit over the point indexes. Returns `(factor, offset)`
/// such that `v(ts) = offset + ts * factor`, or `None` when the series has
/// too few points to fit.
fn linear_regression_analysis(source: &Series, step: f64) -> Option<(f64, f64)> {
    if step == 0.0 {
        return None;
    }
    let mut sum_i = 0i64;
    let mut sum_ii = 0i64;
    let mut sum_v = 0.0;
    let mut sum_iv = 0.0;
    let values = &source.values;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        sum_i += i as i64;
        sum_ii += (i * i) as i64;
        sum_iv += i as f64 * v;
        sum_v += v;
    }
    let denominator = (values.len() as i64 * sum_ii - sum_i * sum_i) as f64;
    if denominator == 0.0 {
        return None;
    }
    let factor = (values.len() as f64 * sum_iv - sum_i as f64 * sum_v) / denominator / step;
    let ts0 = source.timestamps.first().copied().unwrap_or_default();
    let offset =
        (sum_ii as f64 * sum_v - sum_iv * sum_i as f64) / denominator - factor * ts0 as f64;
    Some((factor, offset))
}

// ============================================================================
// Holt-Winters
// ============================================================================

pub(crate) fn holt_winters_forecast(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let bootstrap_interval = get_optional_string(&fe.args, "bootstrapInterval", 1, "7d")?;
    let bootstrap_msecs = parse_interval(&bootstrap_interval)?;
    let seasonality = get_optional_string(&fe.args, "seasonality", 2, "1d")?;
    let seasonality_msecs = parse_interval(&seasonality)?;
    let mut ec_copy = ec.clone();
    ec_copy.start_time -= bootstrap_msecs;
    let mut stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    let trim_window_points = ec_copy.points_len(step) - ec.points_len(step);
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let analysis = holt_winters_analysis(&s, seasonality_msecs);
            s.tags
                .insert("holtWintersForecast".to_string(), "1".to_string());
            s.values = analysis.predictions[trim_window_points..].to_vec();
            s.timestamps.drain(..trim_window_points);
            let new_name = format!("holtWintersForecast({})", s.name);
            s.tags.insert("name".to_string(), new_name.clone());
            s.name = new_name;
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn holt_winters_confidence_bands(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 4)?;
    let bands = holt_winters_bands(ev, ec, fe)?;
    Ok(multi_series(bands))
}

pub(crate) fn holt_winters_confidence_area(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 4)?;
    let mut bands = holt_winters_bands(ev, ec, fe)?;
    if bands.len() != 2 {
        return Err(Error::Execution(
            "expecting exactly two series; got more series".to_string(),
        ));
    }
    for s in bands.iter_mut() {
        s.name = format!("areaBetween({})", s.name);
        s.tags.insert("areaBetween".to_string(), "1".to_string());
    }
    Ok(multi_series(bands))
}

/// Deviation of each series from its Holt-Winters confidence bands; zero
/// while the series stays inside them.
pub(crate) fn holt_winters_aberration(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 4)?;
    let bands = holt_winters_bands(ev, ec, fe)?;
    let mut confidence_bands: HashMap<String, Vec<f64>> = HashMap::new();
    for s in bands {
        confidence_bands.insert(s.name, s.values);
    }
    let mut stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    let ec_copy = ec.clone();
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let empty: &[f64] = &[];
            let lower_band = confidence_bands
                .get(&format!("holtWintersConfidenceLower({})", s.name))
                .map_or(empty, |v| v.as_slice());
            let upper_band = confidence_bands
                .get(&format!("holtWintersConfidenceUpper({})", s.name))
                .map_or(empty, |v| v.as_slice());
            let values = &s.values;
            if values.len() != lower_band.len() || values.len() != upper_band.len() {
                return Err(Error::Execution(format!(
                    "bug, len mismatch for series: {} and upperBand values: {} or lowerBand values: {}",
                    values.len(),
                    upper_band.len(),
                    lower_band.len()
                )));
            }
            let mut aberration = Vec::with_capacity(values.len());
            for (i, &v) in values.iter().enumerate() {
                if v.is_nan() {
                    aberration.push(0.0);
                } else if !upper_band[i].is_nan() && v > upper_band[i] {
                    aberration.push(v - upper_band[i]);
                } else if !lower_band[i].is_nan() && v < lower_band[i] {
                    aberration.push(v - lower_band[i]);
                } else {
                    aberration.push(0.0);
                }
            }
            s.tags
                .insert("holtWintersAberration".to_string(), "1".to_string());
            s.name = format!("holtWintersAberration({})", s.name);
            s.values = aberration;
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Upper and lower confidence band series for every input series.
fn holt_winters_bands(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<Vec<Series>> {
    let delta = get_optional_number(&fe.args, "delta", 1, 3.0)?;
    let bootstrap_interval = get_optional_string(&fe.args, "bootstrapInterval", 2, "7d")?;
    let bootstrap_msecs = parse_interval(&bootstrap_interval)?;
    let seasonality = get_optional_string(&fe.args, "seasonality", 3, "1d")?;
    let seasonality_msecs = parse_interval(&seasonality)?;
    let mut ec_copy = ec.clone();
    ec_copy.start_time -= bootstrap_msecs;
    let mut stream = eval_series_list(ev, &ec_copy, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    let trim_window_points = ec_copy.points_len(step) - ec.points_len(step);
    let result = shared(Vec::new());
    let result_copy = Arc::clone(&result);
    let fe_copy = fe.clone();
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let analysis = holt_winters_analysis(&s, seasonality_msecs);
            let timestamps = &s.timestamps[trim_window_points..];
            let forecast = &analysis.predictions[trim_window_points..];
            let deviations = &analysis.deviations[trim_window_points..];
            let mut upper_band = Vec::with_capacity(forecast.len());
            let mut lower_band = Vec::with_capacity(forecast.len());
            for (&f, &d) in forecast.iter().zip(deviations.iter()) {
                if f.is_nan() || d.is_nan() {
                    upper_band.push(f64::NAN);
                    lower_band.push(f64::NAN);
                } else {
                    let scaled_deviation = delta * d;
                    upper_band.push(f + scaled_deviation);
                    lower_band.push(f - scaled_deviation);
                }
            }
            let mut band_series = Vec::with_capacity(2);
            for (kind, values) in [
                ("holtWintersConfidenceUpper", upper_band),
                ("holtWintersConfidenceLower", lower_band),
            ] {
                let name = format!("{}({})", kind, s.name);
                let mut tags = HashMap::new();
                tags.insert(kind.to_string(), "1".to_string());
                tags.insert("name".to_string(), s.name.clone());
                band_series.push(Series {
                    name: name.clone(),
                    tags,
                    timestamps: timestamps.to_vec(),
                    values,
                    step,
                    consolidate_func: None,
                    x_files_factor: 0.0,
                    path_expression: name,
                    expr: Expr::Func(fe_copy.clone()),
                });
            }
            result_copy.lock().extend(band_series);
            Ok(Some(s))
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let bands = std::mem::take(&mut *result.lock());
    Ok(bands)
}

struct HoltWintersAnalysis {
    predictions: Vec<f64>,
    deviations: Vec<f64>,
}

/// Triple exponential smoothing with the classic Graphite constants.
fn holt_winters_analysis(s: &Series, seasonality: i64) -> HoltWintersAnalysis {
    const ALPHA: f64 = 0.1;
    const BETA: f64 = 0.0035;
    let gamma = ALPHA;
    let season_length = seasonality / s.step.max(1);

    let n = s.values.len();
    let mut intercepts: Vec<f64> = Vec::with_capacity(n);
    let mut slopes: Vec<f64> = Vec::with_capacity(n);
    let mut seasonals: Vec<f64> = Vec::with_capacity(n);
    let mut predictions = Vec::with_capacity(n);
    let mut deviations: Vec<f64> = Vec::with_capacity(n);

    let season_ago = |history: &[f64], i: i64| -> f64 {
        let j = i - season_length;
        if j >= 0 {
            history.get(j as usize).copied().unwrap_or(0.0)
        } else {
            0.0
        }
    };

    let mut next_pred = f64::NAN;
    for (i, &v) in s.values.iter().enumerate() {
        if v.is_nan() {
            intercepts.push(0.0);
            slopes.push(0.0);
            seasonals.push(0.0);
            predictions.push(next_pred);
            deviations.push(0.0);
            next_pred = f64::NAN;
            continue;
        }

        let (last_intercept, last_slope, prediction) = if i == 0 {
            (v, 0.0, v)
        } else {
            let mut last_intercept = intercepts[i - 1];
            if last_intercept.is_nan() {
                last_intercept = v;
            }
            (last_intercept, slopes[i - 1], next_pred)
        };

        let last_seasonal = season_ago(&seasonals, i as i64);
        let next_last_seasonal = season_ago(&seasonals, i as i64 + 1);
        let last_seasonal_dev = season_ago(&deviations, i as i64);

        let intercept = ALPHA * (v - last_seasonal) + (1.0 - ALPHA) * (last_intercept + last_slope);
        let slope = BETA * (intercept - last_intercept) + (1.0 - BETA) * last_slope;
        let seasonal = gamma * (v - intercept) + (1.0 - gamma) * last_seasonal;

        next_pred = intercept + slope + next_last_seasonal;
        let baseline = if prediction.is_nan() { 0.0 } else { prediction };
        let deviation = gamma * (v - baseline).abs() + (1.0 - gamma) * last_seasonal_dev;

        intercepts.push(intercept);
        slopes.push(slope);
        seasonals.push(seasonal);
        predictions.push(prediction);
        deviations.push(deviation);
    }
    HoltWintersAnalysis {
        predictions,
        deviations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::source::MemorySource;
    use crate::eval::stream::fetch_all_series;

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 120_000,
            end_time: 420_000,
            storage_step: 60_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    fn ramp_source() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_series_over(
            "foo.bar",
            0,
            600_000,
            60_000,
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        );
        source
    }

    fn eval(source: MemorySource, query: &str) -> Vec<Series> {
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        let mut stream = ev.exec_expr(&ec, query).unwrap();
        fetch_all_series(stream.as_mut()).unwrap()
    }

    #[test]
    fn test_delay_positive_and_negative() {
        let ss = eval(ramp_source(), "delay(foo.bar,2)");
        assert_eq!(ss[0].name, "delay(foo.bar,2)");
        assert_eq!(ss[0].tags.get("delay").unwrap(), "2");
        assert!(ss[0].values[0].is_nan());
        assert!(ss[0].values[1].is_nan());
        assert_eq!(&ss[0].values[2..], &[2.0, 3.0, 4.0]);

        let ss = eval(ramp_source(), "delay(foo.bar,-2)");
        assert_eq!(&ss[0].values[..3], &[4.0, 5.0, 6.0]);
        assert!(ss[0].values[3].is_nan());
        assert!(ss[0].values[4].is_nan());
    }

    #[test]
    fn test_exponential_moving_average_constant() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[2.0]);
        let ss = eval(source, "exponentialMovingAverage(foo.bar,2)");
        assert_eq!(ss[0].name, "exponentialMovingAverage(foo.bar,2)");
        // Bootstrap average equals the constant, so the EMA never moves.
        assert_eq!(ss[0].values, vec![2.0, 2.0, 2.0, 2.0, 2.0]);
        assert_eq!(ss[0].timestamps[0], 120_000);
    }

    #[test]
    fn test_moving_average_interval_window() {
        let ss = eval(ramp_source(), "movingAverage(foo.bar,'2min')");
        assert_eq!(ss[0].name, "movingAverage(foo.bar,'2min')");
        assert_eq!(ss[0].tags.get("movingAverage").unwrap(), "'2min'");
        assert_eq!(ss[0].values, vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5]);
        assert_eq!(ss[0].timestamps[0], 120_000);
        assert_eq!(*ss[0].timestamps.last().unwrap(), 420_000);
    }

    #[test]
    fn test_moving_sum_numeric_window() {
        let ss = eval(ramp_source(), "movingSum(foo.bar,2)");
        assert_eq!(ss[0].name, "movingSum(foo.bar,2)");
        assert_eq!(ss[0].values, vec![1.0, 3.0, 5.0, 7.0, 9.0, 11.0]);
    }

    #[test]
    fn test_moving_window_explicit_func() {
        let ss = eval(ramp_source(), "movingWindow(foo.bar,2,'max')");
        assert_eq!(ss[0].name, "movingMax(foo.bar,2)");
        assert_eq!(ss[0].values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_stdev_constant_is_zero() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[4.0]);
        let ss = eval(source, "stdev(foo.bar,2)");
        assert_eq!(ss[0].name, "stdev(foo.bar,2)");
        assert!(ss[0].values.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_time_shift_pulls_from_the_past() {
        let ss = eval(ramp_source(), "timeShift(foo.bar,'1min')");
        assert_eq!(ss[0].name, "timeShift(foo.bar,'1min')");
        assert_eq!(ss[0].tags.get("timeShift").unwrap(), "1min");
        // Values from one step earlier land on the requested grid.
        assert_eq!(ss[0].timestamps[0], 120_000);
        assert_eq!(ss[0].values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_time_slice_nans_outside_window() {
        let ss = eval(ramp_source(), "timeSlice(foo.bar,'180','300')");
        assert_eq!(ss[0].name, "timeSlice(foo.bar,180,300)");
        assert!(ss[0].values[0].is_nan());
        assert_eq!(&ss[0].values[1..4], &[3.0, 4.0, 5.0]);
        assert!(ss[0].values[4].is_nan());
    }

    #[test]
    fn test_time_stack_produces_one_series_per_shift() {
        let ss = eval(ramp_source(), "timeStack(foo.bar,'1min',0,1)");
        assert_eq!(ss.len(), 2);
        let names: Vec<&str> = ss.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"timeShift(foo.bar,1min,0)"));
        assert!(names.contains(&"timeShift(foo.bar,1min,1)"));
        for s in &ss {
            assert_eq!(s.timestamps[0], 120_000);
        }
    }

    #[test]
    fn test_time_stack_rejects_inverted_range() {
        let ev = Evaluator::new(Arc::new(ramp_source()));
        let err = ev
            .exec_expr(&test_config(), "timeStack(foo.bar,'1min',3,1)")
            .err()
            .unwrap();
        assert!(err.to_string().contains("cannot be smaller"));
    }

    #[test]
    fn test_linear_regression_reproduces_a_line() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 120_000, 420_000, 60_000, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let ss = eval(source, "linearRegression(foo.bar)");
        assert_eq!(ss[0].name, "linearRegression(foo.bar, 120, 420)");
        assert_eq!(ss[0].tags.get("linearRegressions").unwrap(), "120, 420");
        for (got, want) in ss[0].values.iter().zip([1.0, 2.0, 3.0, 4.0, 5.0]) {
            assert!((got - want).abs() < 1e-9, "got {}, want {}", got, want);
        }
    }

    #[test]
    fn test_holt_winters_forecast_constant() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[5.0]);
        let ss = eval(source, "holtWintersForecast(foo.bar,'2min','2min')");
        assert_eq!(ss[0].name, "holtWintersForecast(foo.bar)");
        assert_eq!(ss[0].tags.get("holtWintersForecast").unwrap(), "1");
        assert_eq!(ss[0].timestamps.len(), 5);
        assert_eq!(ss[0].timestamps[0], 120_000);
        for v in &ss[0].values {
            assert!((v - 5.0).abs() < 1e-9, "got {}", v);
        }
    }

    #[test]
    fn test_holt_winters_confidence_bands_constant() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[5.0]);
        let ss = eval(source, "holtWintersConfidenceBands(foo.bar,3,'2min','2min')");
        assert_eq!(ss.len(), 2);
        let mut names: Vec<&str> = ss.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "holtWintersConfidenceLower(foo.bar)",
                "holtWintersConfidenceUpper(foo.bar)"
            ]
        );
        // Zero deviation on a constant series collapses both bands onto it.
        for s in &ss {
            for v in &s.values {
                assert!((v - 5.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_holt_winters_aberration_inside_bands_is_zero() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[5.0]);
        let ss = eval(source, "holtWintersAberration(foo.bar,3,'2min','2min')");
        assert_eq!(ss[0].name, "holtWintersAberration(foo.bar)");
        assert!(ss[0].values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_holt_winters_confidence_area_requires_one_series() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[5.0]);
        source.add_series_over("foo.baz", 0, 600_000, 60_000, &[7.0]);
        let ev = Evaluator::new(Arc::new(source));
        assert!(ev
            .exec_expr(&test_config(), "holtWintersConfidenceArea(foo.*,3,'2min','2min')")
            .is_err());
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[5.0]);
        let ss = eval(source, "holtWintersConfidenceArea(foo.bar,3,'2min','2min')");
        assert_eq!(ss.len(), 2);
        assert!(ss[0].name.starts_with("areaBetween(holtWintersConfidence"));
    }
}
