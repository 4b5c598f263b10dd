//! Series filtering and top-N selection
//!
//! Two families: threshold filters built on [`filter_series_generic`]
//! (averageAbove, maximumBelow, ...) and top-N selectors built on the
//! bounded heaps in [`highest_generic`] / [`lowest_generic`]. The heap
//! variants materialize only the kept series, so `highest(huge.*, 3)`
//! never holds more than three series at once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::aggr::state::new_aggr_state_percentile;
use crate::aggr::AggrFunc;
use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::Series;
use crate::eval::stream::{
    concurrent_map, drain_all_series, map_series_for_aggr_func, multi_series, peek_step,
    serial_map, series_group, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_number, get_optional_number, get_optional_string, get_regexp,
    get_regexp_replacement, get_string,
};
use crate::functions::{check_arg_count, shared};
use crate::parser::{format_float, Expr, FuncExpr};

// ============================================================================
// threshold filters
// ============================================================================

pub(crate) fn filter_series(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 4, 4)?;
    let func_name = get_string(&fe.args, "func", 1)?;
    let operator = get_string(&fe.args, "operator", 2)?;
    let threshold = get_number(&fe.args, "threshold", 3)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    filter_series_generic(Expr::Func(fe.clone()), stream, &func_name, &operator, threshold)
}

fn filter_series_generic(
    expr: Expr,
    mut stream: SeriesStreamBox,
    func_name: &str,
    operator: &str,
    threshold: f64,
) -> Result<SeriesStreamBox> {
    let aggr_func = match AggrFunc::by_name(func_name) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    let operator_func = match get_operator_func(operator) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let v = aggr_func.call(&s.values);
            if !operator_func(v, threshold) {
                return Ok(None);
            }
            s.expr = expr.clone();
            Ok(Some(s))
        }),
    ))
}

fn get_operator_func(operator: &str) -> Result<fn(f64, f64) -> bool> {
    let f: fn(f64, f64) -> bool = match operator {
        "=" => |v, threshold| v == threshold,
        "!=" => |v, threshold| v != threshold,
        ">" => |v, threshold| v > threshold,
        ">=" => |v, threshold| v >= threshold,
        "<" => |v, threshold| v < threshold,
        "<=" => |v, threshold| v <= threshold,
        _ => {
            return Err(Error::Argument(format!("unknown operator {:?}", operator)));
        }
    };
    Ok(f)
}

fn filter_by_threshold(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
    operator: &str,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    filter_series_generic(Expr::Func(fe.clone()), stream, func_name, operator, n)
}

pub(crate) fn average_above(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "average", ">")
}

pub(crate) fn average_below(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "average", "<")
}

pub(crate) fn current_above(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "current", ">")
}

pub(crate) fn current_below(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "current", "<")
}

pub(crate) fn maximum_above(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "max", ">")
}

pub(crate) fn maximum_below(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "max", "<")
}

pub(crate) fn minimum_above(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "min", ">")
}

pub(crate) fn minimum_below(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    filter_by_threshold(ev, ec, fe, "min", "<")
}

// ============================================================================
// top-N selection
// ============================================================================

struct SeriesWithWeight {
    v: f64,
    s: Series,
}

impl PartialEq for SeriesWithWeight {
    fn eq(&self, other: &Self) -> bool {
        self.v.total_cmp(&other.v).is_eq()
    }
}

impl Eq for SeriesWithWeight {}

impl PartialOrd for SeriesWithWeight {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeriesWithWeight {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.v.total_cmp(&other.v)
    }
}

pub(crate) fn highest(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let n = get_optional_number(&fe.args, "n", 1, 1.0)?;
    let func_name = get_optional_string(&fe.args, "func", 2, "average")?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    highest_generic(Expr::Func(fe.clone()), stream, n, &func_name)
}

/// Keeps the `n` series with the largest aggregated value, returned in
/// ascending weight order.
fn highest_generic(
    expr: Expr,
    mut stream: SeriesStreamBox,
    n: f64,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let aggr_func = match AggrFunc::by_name(func_name) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    // The heap peek is the smallest kept weight, so a new series evicts
    // it only when strictly heavier.
    let top = shared(BinaryHeap::<Reverse<SeriesWithWeight>>::new());
    let top_update = Arc::clone(&top);
    let mut wrapped = map_series_for_aggr_func(
        func_name,
        stream,
        Arc::new(move |s: Series| {
            let v = aggr_func.call(&s.values);
            let mut top = top_update.lock();
            if top.len() < n as usize {
                top.push(Reverse(SeriesWithWeight { v, s }));
            } else if top.peek().map_or(false, |min| v > min.0.v) {
                top.pop();
                top.push(Reverse(SeriesWithWeight { v, s }));
            }
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let top = std::mem::take(&mut *top.lock());
    let mut sws: Vec<SeriesWithWeight> = top.into_iter().map(|x| x.0).collect();
    sws.sort_by(|a, b| a.v.total_cmp(&b.v));
    let ss = sws
        .into_iter()
        .map(|sw| {
            let mut s = sw.s;
            s.expr = expr.clone();
            s
        })
        .collect();
    Ok(multi_series(ss))
}

pub(crate) fn highest_average(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    highest_fixed(ev, ec, fe, "average")
}

pub(crate) fn highest_current(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    highest_fixed(ev, ec, fe, "current")
}

pub(crate) fn highest_max(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    highest_fixed(ev, ec, fe, "max")
}

pub(crate) fn most_deviant(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    highest_fixed(ev, ec, fe, "stddev")
}

fn highest_fixed(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    highest_generic(Expr::Func(fe.clone()), stream, n, func_name)
}

pub(crate) fn lowest(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let n = get_optional_number(&fe.args, "n", 1, 1.0)?;
    let func_name = get_optional_string(&fe.args, "func", 2, "average")?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    lowest_generic(Expr::Func(fe.clone()), stream, n, &func_name)
}

/// Keeps the `n` series with the smallest aggregated value, returned in
/// descending weight order.
fn lowest_generic(
    expr: Expr,
    mut stream: SeriesStreamBox,
    n: f64,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let aggr_func = match AggrFunc::by_name(func_name) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    let top = shared(BinaryHeap::<SeriesWithWeight>::new());
    let top_update = Arc::clone(&top);
    let mut wrapped = map_series_for_aggr_func(
        func_name,
        stream,
        Arc::new(move |s: Series| {
            let v = aggr_func.call(&s.values);
            let mut top = top_update.lock();
            if top.len() < n as usize {
                top.push(SeriesWithWeight { v, s });
            } else if top.peek().map_or(false, |max| v < max.v) {
                top.pop();
                top.push(SeriesWithWeight { v, s });
            }
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let top = std::mem::take(&mut *top.lock());
    let mut sws: Vec<SeriesWithWeight> = top.into_vec();
    sws.sort_by(|a, b| b.v.total_cmp(&a.v));
    let ss = sws
        .into_iter()
        .map(|sw| {
            let mut s = sw.s;
            s.expr = expr.clone();
            s
        })
        .collect();
    Ok(multi_series(ss))
}

pub(crate) fn lowest_average(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    lowest_generic(Expr::Func(fe.clone()), stream, n, "average")
}

pub(crate) fn lowest_current(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    lowest_generic(Expr::Func(fe.clone()), stream, n, "current")
}

/// Keeps series whose average falls outside the n-th..(100-n)-th
/// percentile band of all averages.
pub(crate) fn average_outside_percentile(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let mut n = get_number(&fe.args, "n", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let sws = shared(Vec::<SeriesWithWeight>::new());
    let sws_update = Arc::clone(&sws);
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |s: Series| {
            let avg = AggrFunc::Avg.call(&s.values);
            sws_update.lock().push(SeriesWithWeight { v: avg, s });
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let sws = std::mem::take(&mut *sws.lock());
    let avgs: Vec<f64> = sws.iter().map(|sw| sw.v).collect();
    if n > 50.0 {
        n = 100.0 - n;
    }
    let low_value = AggrFunc::Percentile(n).call(&avgs);
    let high_value = AggrFunc::Percentile(100.0 - n).call(&avgs);
    let expr = Expr::Func(fe.clone());
    let mut ss = Vec::new();
    for sw in sws {
        if sw.v < low_value || sw.v > high_value {
            let mut s = sw.s;
            s.expr = expr.clone();
            ss.push(s);
        }
    }
    Ok(multi_series(ss))
}

// ============================================================================
// name and value filters
// ============================================================================

pub(crate) fn exclude(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let pattern = get_regexp(&fe.args, "pattern", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            if pattern.is_match(&s.name) {
                return Ok(None);
            }
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn grep(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let pattern = get_regexp(&fe.args, "pattern", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            if !pattern.is_match(&s.name) {
                return Ok(None);
            }
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn limit(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)? as usize;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    let series_fetched = shared(0usize);
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut fetched = series_fetched.lock();
            if *fetched >= n {
                return Ok(None);
            }
            *fetched += 1;
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn remove_above_percentile(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let n_str = format_float(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let max = AggrFunc::Percentile(n).call(&s.values);
            for v in s.values.iter_mut() {
                if *v > max {
                    *v = f64::NAN;
                }
            }
            s.name = format!("removeAbovePercentile({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn remove_above_value(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let n_str = format_float(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                if *v > n {
                    *v = f64::NAN;
                }
            }
            s.name = format!("removeAboveValue({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn remove_below_percentile(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let n_str = format_float(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let min = AggrFunc::Percentile(n).call(&s.values);
            for v in s.values.iter_mut() {
                if *v < min {
                    *v = f64::NAN;
                }
            }
            s.name = format!("removeBelowPercentile({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn remove_below_value(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let n = get_number(&fe.args, "n", 1)?;
    let n_str = format_float(n);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            for v in s.values.iter_mut() {
                if *v < n {
                    *v = f64::NAN;
                }
            }
            s.name = format!("removeBelowValue({},{})", s.name, n_str);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Keeps series with at least one point outside the pointwise
/// n-th..(100-n)-th percentile band across all series.
pub(crate) fn remove_between_percentile(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let mut n = get_number(&fe.args, "n", 1)?;
    if n > 50.0 {
        n = 100.0 - n;
    }
    let mut stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    let points_len = ec.points_len(step);
    struct Acc {
        as_low: Box<dyn crate::aggr::AggrState>,
        as_high: Box<dyn crate::aggr::AggrState>,
        ss: Vec<Series>,
    }
    let acc = shared(Acc {
        as_low: new_aggr_state_percentile(points_len, n),
        as_high: new_aggr_state_percentile(points_len, 100.0 - n),
        ss: Vec::new(),
    });
    let acc_update = Arc::clone(&acc);
    let ec_copy = ec.clone();
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let mut acc = acc_update.lock();
            acc.as_low.update(&s.values);
            acc.as_high.update(&s.values);
            acc.ss.push(s);
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let mut acc = acc.lock();
    let lows = acc.as_low.finalize(ec.x_files_factor);
    let highs = acc.as_high.finalize(ec.x_files_factor);
    let expr = Expr::Func(fe.clone());
    let mut ss_dst = Vec::new();
    for mut s in std::mem::take(&mut acc.ss) {
        let outlier = s
            .values
            .iter()
            .enumerate()
            .any(|(i, v)| *v < lows[i] || *v > highs[i]);
        if outlier {
            s.expr = expr.clone();
            ss_dst.push(s);
        }
    }
    Ok(multi_series(ss_dst))
}

pub(crate) fn remove_empty_series(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let x_files_factor = get_optional_number(&fe.args, "xFilesFactor", 1, ec.x_files_factor)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut xff = s.x_files_factor;
            if xff == 0.0 {
                xff = x_files_factor;
            }
            let n = AggrFunc::Count.call(&s.values);
            if n / (s.values.len() as f64) < xff {
                return Ok(None);
            }
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// Deduplicates series by name across all args. The first occurrence wins,
/// so each arg stream stays serial.
pub(crate) fn unique(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    let seen = shared(HashSet::<String>::new());
    let mut streams: Vec<SeriesStreamBox> = Vec::with_capacity(fe.args.len());
    for i in 0..fe.args.len() {
        let stream = match eval_series_list(ev, ec, &fe.args, "seriesList", i) {
            Ok(stream) => stream,
            Err(err) => {
                for mut stream in streams {
                    let _ = drain_all_series(stream.as_mut());
                }
                return Err(err);
            }
        };
        let seen_copy = Arc::clone(&seen);
        streams.push(serial_map(
            stream,
            Arc::new(move |s: Series| {
                if seen_copy.lock().insert(s.name.clone()) {
                    return Ok(Some(s));
                }
                Ok(None)
            }),
        ));
    }
    Ok(series_group(streams, Some(Expr::Func(fe.clone()))))
}

/// Collects renamed names of series with any value above the threshold,
/// then evaluates them as a fresh `group(...)` query.
pub(crate) fn use_series_above(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 4, 4)?;
    let value = get_number(&fe.args, "value", 1)?;
    let search_re = get_regexp(&fe.args, "search", 2)?;
    let replace = get_regexp_replacement(&fe.args, "replace", 3)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let series_names = shared(Vec::<String>::new());
    let names_update = Arc::clone(&series_names);
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |s: Series| {
            if s.values.iter().any(|v| *v > value) {
                let new_name = search_re.replace_all(&s.name, replace.as_str()).into_owned();
                names_update.lock().push(new_name);
            }
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let names = std::mem::take(&mut *series_names.lock());
    let query = format!("group({})", names.join(","));
    ev.exec_expr(ec, &query)
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

    fn load_source() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_series_over("host.a.load", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("host.b.load", 0, 180_000, 60_000, &[5.0]);
        source.add_series_over("host.c.load", 0, 180_000, 60_000, &[9.0]);
        source
    }

    #[test]
    fn test_filter_series_operators() {
        let ss = eval(load_source(), "filterSeries(host.*.load,'max','>',4)");
        assert_eq!(ss.len(), 2);
        let ss = eval(load_source(), "filterSeries(host.*.load,'average','<=',5)");
        assert_eq!(ss.len(), 2);
        let ss = eval(load_source(), "filterSeries(host.*.load,'min','=',9)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "host.c.load");
    }

    #[test]
    fn test_filter_series_unknown_operator() {
        let ev = Evaluator::new(Arc::new(load_source()));
        let ec = test_config();
        assert!(ev
            .exec_expr(&ec, "filterSeries(host.*.load,'max','~',4)")
            .is_err());
    }

    #[test]
    fn test_maximum_above() {
        let ss = eval(load_source(), "maximumAbove(host.*.load,5)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "host.c.load");
    }

    #[test]
    fn test_highest_sorts_ascending() {
        let ss = eval(load_source(), "highest(host.*.load,2,'max')");
        let names: Vec<_> = ss.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["host.b.load", "host.c.load"]);
    }

    #[test]
    fn test_highest_default_is_single_series() {
        let ss = eval(load_source(), "highest(host.*.load)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "host.c.load");
    }

    #[test]
    fn test_lowest_sorts_descending() {
        let ss = eval(load_source(), "lowest(host.*.load,2)");
        let names: Vec<_> = ss.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["host.b.load", "host.a.load"]);
    }

    #[test]
    fn test_limit() {
        let ss = eval(load_source(), "limit(host.*.load,2)");
        assert_eq!(ss.len(), 2);
    }

    #[test]
    fn test_exclude_and_grep() {
        let ss = eval(load_source(), "exclude(host.*.load,'\\\\.b\\\\.')");
        assert_eq!(ss.len(), 2);
        let ss = eval(load_source(), "grep(host.*.load,'\\\\.b\\\\.')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "host.b.load");
    }

    #[test]
    fn test_remove_above_value() {
        let ss = eval(load_source(), "removeAboveValue(host.b.load,4)");
        assert_eq!(ss[0].name, "removeAboveValue(host.b.load,4)");
        assert!(ss[0].values.iter().all(|v| v.is_nan()));
        let ss = eval(load_source(), "removeBelowValue(host.b.load,4)");
        assert_eq!(ss[0].values, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_remove_empty_series() {
        let mut source = load_source();
        source.add_series_over("host.d.load", 0, 180_000, 60_000, &[f64::NAN]);
        let ss = eval(source, "removeEmptySeries(host.*.load,0.5)");
        assert_eq!(ss.len(), 3);
    }

    #[test]
    fn test_unique() {
        let ss = eval(load_source(), "unique(host.a.load,host.*.load)");
        assert_eq!(ss.len(), 3);
        assert_eq!(ss[0].name, "host.a.load");
    }

    #[test]
    fn test_use_series_above() {
        let mut source = load_source();
        source.add_series_over("host.c.procs", 0, 180_000, 60_000, &[42.0]);
        let ss = eval(source, "useSeriesAbove(host.*.load,7,'load','procs')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "host.c.procs");
        assert_eq!(ss[0].values, vec![42.0, 42.0, 42.0]);
    }

    #[test]
    fn test_average_outside_percentile() {
        let mut source = MemorySource::new();
        source.add_series_over("m.low", 0, 180_000, 60_000, &[1.0]);
        for name in ["m.b", "m.c", "m.d", "m.e", "m.f", "m.g", "m.h", "m.i"] {
            source.add_series_over(name, 0, 180_000, 60_000, &[5.0]);
        }
        source.add_series_over("m.top", 0, 180_000, 60_000, &[100.0]);
        let mut ss = eval(source, "averageOutsidePercentile(m.*,10)");
        ss.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = ss.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["m.low", "m.top"]);
    }
}
