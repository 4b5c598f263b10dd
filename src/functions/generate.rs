//! Synthetic series generators
//!
//! These functions fabricate series from the evaluation range instead of
//! transforming fetched data: constant lines, ramps, random walks and the
//! tag-driven seriesByTag selector.

use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::eval::config::{parse_time, EvalConfig};
use crate::eval::series::{unmarshal_tags, Series};
use crate::eval::source::TagFilter;
use crate::eval::stream::{serial_map, single_series, SeriesStreamBox};
use crate::eval::Evaluator;
use crate::functions::args::{get_number, get_optional_number, get_optional_string, get_string};
use crate::functions::{check_arg_count, new_nan_series};
use crate::parser::{format_float, quote_string, Expr, FuncExpr};

pub(crate) fn constant_line_func(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let n = get_number(&fe.args, "value", 0)?;
    Ok(constant_line(ec, Expr::Func(fe.clone()), n))
}

/// A horizontal line across the whole range: three points so renderers can
/// draw it with any consolidation.
pub(crate) fn constant_line(ec: &EvalConfig, expr: Expr, n: f64) -> SeriesStreamBox {
    let name = format_float(n);
    let step = (ec.end_time - ec.start_time) / 2;
    let path_expression = expr.to_query_string();
    single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps: vec![ec.start_time, ec.start_time + step, ec.start_time + 2 * step],
        values: vec![n, n, n],
        step,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression,
        expr,
    })
}

pub(crate) fn threshold(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let value = get_number(&fe.args, "value", 0)?;
    let label = get_optional_string(&fe.args, "label", 1, "")?;
    get_optional_string(&fe.args, "color", 2, "")?;
    let stream = constant_line(ec, Expr::Func(fe.clone()), value);
    if label.is_empty() {
        return Ok(stream);
    }
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.name = label.clone();
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// A placeholder NaN series named after the requested event tags.
pub(crate) fn events(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    let mut tags = Vec::with_capacity(fe.args.len());
    for arg in &fe.args {
        match &arg.expr {
            Expr::Str(se) => tags.push(quote_string(&se.s)),
            other => {
                return Err(Error::Argument(format!(
                    "expecting string tag; got {}",
                    other.to_query_string()
                )));
            }
        }
    }
    let mut s = new_nan_series(ec, ec.storage_step);
    let name = format!("events({})", tags.join(","));
    s.tags.insert("name".to_string(), name.clone());
    s.path_expression = name.clone();
    s.name = name;
    s.expr = Expr::Func(fe.clone());
    Ok(single_series(s))
}

/// Seconds-since-epoch ramp at a fixed one-minute step.
pub(crate) fn identity(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let name = get_string(&fe.args, "name", 0)?;
    const STEP: i64 = 60_000;
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    let mut ts = ec.start_time;
    while ts < ec.end_time {
        timestamps.push(ts);
        values.push(ts as f64 / 1000.0);
        ts += STEP;
    }
    Ok(single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps,
        values,
        step: STEP,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    }))
}

pub(crate) fn random_walk(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let name = get_string(&fe.args, "name", 0)?;
    let step = get_optional_number(&fe.args, "step", 1, 60.0)?;
    if step <= 0.0 {
        return Err(Error::Argument(format!(
            "step must be positive; got {}",
            format_float(step)
        )));
    }
    let step_msecs = (step * 1000.0) as i64;
    let mut rng = rand::thread_rng();
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    let mut ts = ec.start_time;
    let mut v = 0.0f64;
    while ts < ec.end_time {
        values.push(v);
        timestamps.push(ts);
        v += rng.gen::<f64>() - 0.5;
        ts += step_msecs;
    }
    Ok(single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps,
        values,
        step: step_msecs,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    }))
}

pub(crate) fn sin_function(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let name = get_string(&fe.args, "name", 0)?;
    let amplitude = get_optional_number(&fe.args, "amplitude", 1, 1.0)?;
    let step = get_optional_number(&fe.args, "step", 2, 60.0)?;
    if step <= 0.0 {
        return Err(Error::Argument(format!(
            "step must be positive; got {}",
            format_float(step)
        )));
    }
    let step_msecs = (step * 1000.0) as i64;
    let mut timestamps = Vec::with_capacity(ec.points_len(step_msecs));
    let mut values = Vec::with_capacity(ec.points_len(step_msecs));
    let mut ts = ec.start_time;
    while ts < ec.end_time {
        values.push(amplitude * (ts as f64 / 1000.0).sin());
        timestamps.push(ts);
        ts += step_msecs;
    }
    Ok(single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps,
        values,
        step: step_msecs,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    }))
}

/// Seconds-since-epoch at each step. Unlike [`identity`] the end of the
/// range is inclusive and the step is configurable.
pub(crate) fn time_function(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let name = get_string(&fe.args, "name", 0)?;
    let step = get_optional_number(&fe.args, "step", 1, 60.0)?;
    let step_msecs = (step * 1000.0) as i64;
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    let mut ts = ec.start_time;
    while ts <= ec.end_time {
        timestamps.push(ts);
        values.push((ts / 1000) as f64);
        ts += step_msecs;
    }
    Ok(single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps,
        values,
        step: step_msecs,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    }))
}

/// A two-point marker at the given timestamp, which must fall inside the
/// evaluation range.
pub(crate) fn vertical_line(
    _ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let ts_arg = get_string(&fe.args, "ts", 0)?;
    let ts = parse_time(ec.current_time, &ts_arg)?;
    let name = get_optional_string(&fe.args, "label", 1, "")?;
    if ts < ec.start_time {
        return Err(Error::Argument(format!(
            "verticalLine(): timestamp {} exists before start of range: {}",
            ts, ec.start_time
        )));
    }
    if ts > ec.end_time {
        return Err(Error::Argument(format!(
            "verticalLine(): timestamp {} exists after end of range: {}",
            ts, ec.end_time
        )));
    }
    Ok(single_series(Series {
        name: name.clone(),
        tags: unmarshal_tags(&name),
        timestamps: vec![ts, ts],
        values: vec![1.0, 1.0],
        step: ec.end_time - ec.start_time,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    }))
}

/// Select series by tag expressions, with the config's enforced tag
/// filters applied on top.
pub(crate) fn series_by_tag(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    if fe.args.is_empty() {
        return Err(Error::Argument(
            "at least one tagExpression must be passed to seriesByTag".to_string(),
        ));
    }
    let mut filters = Vec::with_capacity(fe.args.len() + ec.etfs.len());
    for i in 0..fe.args.len() {
        let te = get_string(&fe.args, "tagExpressions", i)?;
        filters.push(TagFilter::parse(&te)?);
    }
    for (key, value) in &ec.etfs {
        filters.push(TagFilter::exact(key, value));
    }
    let stream = ev.search_by_tags(ec, &filters)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.expr = Expr::Func(fe_copy.clone());
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
            end_time: 180_000,
            storage_step: 60_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    fn eval(source: MemorySource, query: &str) -> Vec<Series> {
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        let mut stream = ev.exec_expr(&ec, query).unwrap();
        fetch_all_series(stream.as_mut()).unwrap()
    }

    #[test]
    fn test_constant_line() {
        let ss = eval(MemorySource::new(), "constantLine(7.5)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "7.5");
        assert_eq!(ss[0].values, vec![7.5, 7.5, 7.5]);
        assert_eq!(ss[0].timestamps, vec![0, 90_000, 180_000]);
        assert_eq!(ss[0].step, 90_000);
    }

    #[test]
    fn test_threshold_label() {
        let ss = eval(MemorySource::new(), "threshold(3,'limit')");
        assert_eq!(ss[0].name, "limit");
        assert_eq!(ss[0].values, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_identity_ramp() {
        let ss = eval(MemorySource::new(), "identity('t')");
        assert_eq!(ss[0].values, vec![0.0, 60.0, 120.0]);
        assert_eq!(ss[0].step, 60_000);
    }

    #[test]
    fn test_time_function_includes_end() {
        let ss = eval(MemorySource::new(), "time('t')");
        assert_eq!(ss[0].values, vec![0.0, 60.0, 120.0, 180.0]);
    }

    #[test]
    fn test_random_walk_shape() {
        let ss = eval(MemorySource::new(), "randomWalk('rw',30)");
        assert_eq!(ss[0].values.len(), 6);
        assert_eq!(ss[0].values[0], 0.0);
        assert_eq!(ss[0].step, 30_000);
        let ev = Evaluator::new(Arc::new(MemorySource::new()));
        assert!(ev.exec_expr(&test_config(), "randomWalk('rw',0)").is_err());
    }

    #[test]
    fn test_events_is_nan_series() {
        let ss = eval(MemorySource::new(), "events('tag1','tag2')");
        assert_eq!(ss[0].name, "events('tag1','tag2')");
        assert!(ss[0].values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_vertical_line_bounds() {
        let ss = eval(MemorySource::new(), "verticalLine('60','mark')");
        assert_eq!(ss[0].name, "mark");
        assert_eq!(ss[0].timestamps, vec![60_000, 60_000]);
        assert_eq!(ss[0].values, vec![1.0, 1.0]);
        let ev = Evaluator::new(Arc::new(MemorySource::new()));
        assert!(ev
            .exec_expr(&test_config(), "verticalLine('1000','late')")
            .is_err());
    }

    #[test]
    fn test_series_by_tag() {
        let mut source = MemorySource::new();
        source.add_series_over("cpu;host=a;dc=east", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("cpu;host=b;dc=west", 0, 180_000, 60_000, &[2.0]);
        source.add_series_over("mem;host=a;dc=east", 0, 180_000, 60_000, &[3.0]);
        let ss = eval(source, "seriesByTag('name=cpu','dc=east')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].tags.get("host").unwrap(), "a");
        let mut source = MemorySource::new();
        source.add_series_over("cpu;host=a", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("cpu;host=b", 0, 180_000, 60_000, &[2.0]);
        let ss = eval(source, "seriesByTag('name=cpu','host=~a|b')");
        assert_eq!(ss.len(), 2);
    }
}
