//! Series-combining aggregations
//!
//! Everything here folds N input series into fewer output series through an
//! [`AggrState`] accumulator. The common path: peek the step, consolidate
//! every series onto it, feed the accumulator under a mutex, finalize with
//! the xFilesFactor gate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggr::state::{new_aggr_state_percentile, AggrState};
use crate::aggr::{new_aggr_state, AggrFunc};
use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::Series;
use crate::eval::stream::{
    concurrent_map, drain_all_series, map_series_for_aggr_func, multi_series, peek_step,
    serial_map, single_series, zero_series, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_nodes, get_number, get_optional_arg, get_optional_bool,
    get_optional_number, get_optional_string, get_string,
};
use crate::functions::group::group_series_lists;
use crate::functions::{
    check_arg_count, check_at_least_args, fetch_normalized_series,
    fetch_normalized_series_by_nodes, format_aggr_func_for_percent_series_names,
    format_aggr_func_for_series_names, format_paths_from_series, group_series_by_nodes,
    new_nan_series, shared,
};
use crate::parser::{format_float, Expr, FuncExpr};

pub(crate) fn aggregate(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let func_name = get_string(&fe.args, "func", 1)?;
    let func_name = func_name.strip_suffix("Series").unwrap_or(&func_name);
    let x_files_factor = get_optional_number(&fe.args, "xFilesFactor", 2, ec.x_files_factor)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    aggregate_series(ec, Expr::Func(fe.clone()), stream, func_name, x_files_factor)
}

/// Fold every series from `stream` into a single output series using the
/// named aggregate function.
pub(crate) fn aggregate_series(
    ec: &EvalConfig,
    expr: Expr,
    mut stream: SeriesStreamBox,
    func_name: &str,
    x_files_factor: f64,
) -> Result<SeriesStreamBox> {
    let step = peek_step(&mut stream, ec.storage_step)?;
    let state = match new_aggr_state(ec.points_len(step), func_name) {
        Ok(state) => state,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    struct Acc {
        state: Box<dyn AggrState>,
        series_tags: Vec<HashMap<String, String>>,
        series_expressions: Vec<String>,
    }
    let acc = shared(Acc {
        state,
        series_tags: Vec::new(),
        series_expressions: Vec::new(),
    });
    let acc_update = Arc::clone(&acc);
    let ec_copy = ec.clone();
    let mut wrapped = map_series_for_aggr_func(
        func_name,
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let mut acc = acc_update.lock();
            acc.state.update(&s.values);
            acc.series_tags.push(std::mem::take(&mut s.tags));
            acc.series_expressions
                .push(std::mem::take(&mut s.path_expression));
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let mut acc = acc.lock();
    if acc.series_tags.is_empty() {
        return Ok(zero_series());
    }
    let mut tags = acc.series_tags[0].clone();
    for m in &acc.series_tags[1..] {
        tags.retain(|k, v| m.get(k) == Some(v));
    }
    let name = format_aggr_func_for_series_names(func_name, &acc.series_expressions);
    tags.insert("aggregatedBy".to_string(), func_name.to_string());
    if tags.get("name").map_or(true, |v| v.is_empty()) {
        tags.insert("name".to_string(), name.clone());
    }
    let s = Series {
        name: name.clone(),
        tags,
        timestamps: ec.new_timestamps(step),
        values: acc.state.finalize(x_files_factor),
        step,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr,
    };
    Ok(single_series(s))
}

/// Shared body of `sumSeries`, `averageSeries` and friends: every arg is a
/// series list; they all feed one accumulator.
pub(crate) fn aggregate_generic(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let stream = group_series_lists(ev, ec, &fe.args, Expr::Func(fe.clone()))?;
    aggregate_series(ec, Expr::Func(fe.clone()), stream, func_name, ec.x_files_factor)
}

pub(crate) fn aggregate_line(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let func_name = get_optional_string(&fe.args, "func", 1, "avg")?;
    let aggr_func = AggrFunc::by_name(&func_name)?;
    let keep_step = get_optional_bool(&fe.args, "keepStep", 2, false)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe = fe.clone();
    let ec_copy = ec.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let v = aggr_func.call(&s.values);
            if keep_step {
                for value in s.values.iter_mut() {
                    *value = v;
                }
            } else {
                s.timestamps = vec![
                    ec_copy.start_time,
                    (ec_copy.end_time + ec_copy.start_time) / 2,
                    ec_copy.end_time,
                ];
                s.values = vec![v, v, v];
            }
            let v_string = if v.is_nan() {
                "None".to_string()
            } else {
                format_float(v)
            };
            s.name = format!("aggregateLine({},{})", s.name, v_string);
            s.expr = Expr::Func(fe.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn aggregate_with_wildcards(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 2)?;
    let func_name = get_string(&fe.args, "func", 1)?;
    let positions = crate::functions::args::get_ints(&fe.args[2..], "positions")?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    aggregate_series_with_wildcards(ec, Expr::Func(fe.clone()), stream, &func_name, positions)
}

pub(crate) fn aggregate_with_wildcards_generic(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 1)?;
    let positions = crate::functions::args::get_ints(&fe.args[1..], "position")?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    aggregate_series_with_wildcards(ec, Expr::Func(fe.clone()), stream, func_name, positions)
}

fn aggregate_series_with_wildcards(
    ec: &EvalConfig,
    expr: Expr,
    stream: SeriesStreamBox,
    func_name: &str,
    positions: Vec<i64>,
) -> Result<SeriesStreamBox> {
    let positions: std::collections::HashSet<i64> = positions.into_iter().collect();
    let key_func = move |name: &str, _tags: &HashMap<String, String>| -> String {
        let path = crate::eval::series::get_path_from_name(name);
        path.split('.')
            .enumerate()
            .filter(|(i, _)| !positions.contains(&(*i as i64)))
            .map(|(_, part)| part)
            .collect::<Vec<_>>()
            .join(".")
    };
    crate::functions::group::group_by_key_func(ec, expr, stream, func_name, Arc::new(key_func))
}

// ============================================================================
// Pairwise list aggregation
// ============================================================================

pub(crate) fn aggregate_series_lists(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 3, 4)?;
    let func_name = get_string(&fe.args, "func", 2)?;
    aggregate_series_lists_generic(ev, ec, fe, &func_name)
}

pub(crate) fn aggregate_series_lists_generic(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let aggr_func = AggrFunc::by_name(func_name)?;
    let first = eval_series_list(ev, ec, &fe.args, "seriesListFirstPos", 0)?;
    let second = match eval_series_list(ev, ec, &fe.args, "seriesListSecondPos", 1) {
        Ok(second) => second,
        Err(err) => {
            let mut first = first;
            let _ = drain_all_series(first.as_mut());
            return Err(err);
        }
    };
    aggregate_series_list(ec, fe, first, second, move |pair| aggr_func.call(pair), func_name)
}

pub(crate) fn divide_series_lists(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let dividend = eval_series_list(ev, ec, &fe.args, "dividendSeriesList", 0)?;
    let divisor = match eval_series_list(ev, ec, &fe.args, "divisorSeriesList", 1) {
        Ok(divisor) => divisor,
        Err(err) => {
            let mut dividend = dividend;
            let _ = drain_all_series(dividend.as_mut());
            return Err(err);
        }
    };
    aggregate_series_list(ec, fe, dividend, divisor, |pair| pair[0] / pair[1], "divide")
}

/// Elementwise combination of two equally-sized series lists: the i-th
/// series of the first list is merged with the i-th series of the second.
fn aggregate_series_list(
    ec: &EvalConfig,
    fe: &FuncExpr,
    first: SeriesStreamBox,
    mut second: SeriesStreamBox,
    agg: impl Fn(&[f64]) -> f64,
    func_name: &str,
) -> Result<SeriesStreamBox> {
    let (ss_first, step_first) = match fetch_normalized_series(ec, first, false) {
        Ok(x) => x,
        Err(err) => {
            let _ = drain_all_series(second.as_mut());
            return Err(err);
        }
    };
    let (ss_second, step_second) = fetch_normalized_series(ec, second, false)?;
    if ss_first.len() != ss_second.len() {
        return Err(Error::Execution(format!(
            "First and second lists must have equal number of series; got {} vs {} series",
            ss_first.len(),
            ss_second.len()
        )));
    }
    if step_first != step_second {
        return Err(Error::Execution(format!(
            "step mismatch for first and second: {} vs {}",
            step_first, step_second
        )));
    }
    let mut pair = [0.0f64; 2];
    let mut ss_first = ss_first;
    for (s, s_second) in ss_first.iter_mut().zip(ss_second.iter()) {
        for (v, &v_second) in s.values.iter_mut().zip(s_second.values.iter()) {
            pair[0] = *v;
            pair[1] = v_second;
            *v = agg(&pair);
        }
        s.name = format!("{}Series({},{})", func_name, s.name, s_second.name);
        s.expr = Expr::Func(fe.clone());
        s.path_expression = s.name.clone();
    }
    Ok(multi_series(ss_first))
}

// ============================================================================
// divideSeries / asPercent / weightedAverage
// ============================================================================

pub(crate) fn divide_series(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let divisor_stream = eval_series_list(ev, ec, &fe.args, "divisorSeries", 1)?;
    let (ss_divisors, step_divisor) = fetch_normalized_series(ec, divisor_stream, false)?;
    if ss_divisors.len() > 1 {
        return Err(Error::Execution(format!(
            "unexpected number of divisorSeries; got {}; want 1",
            ss_divisors.len()
        )));
    }
    let dividend = eval_series_list(ev, ec, &fe.args, "dividendSeriesList", 0)?;
    let fe = fe.clone();
    if ss_divisors.is_empty() {
        return Ok(concurrent_map(
            dividend,
            Arc::new(move |mut s: Series| {
                for v in s.values.iter_mut() {
                    *v = f64::NAN;
                }
                s.name = format!("divideSeries({},MISSING)", s.name);
                s.expr = Expr::Func(fe.clone());
                s.path_expression = s.name.clone();
                Ok(Some(s))
            }),
        ));
    }
    let divisor = ss_divisors.into_iter().next().unwrap_or_else(|| Series::from_name(""));
    let ec_copy = ec.clone();
    Ok(serial_map(
        dividend,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step_divisor);
            for (v, &dv) in s.values.iter_mut().zip(divisor.values.iter()) {
                *v /= dv;
            }
            s.name = format!("divideSeries({},{})", s.name, divisor.name);
            s.expr = Expr::Func(fe.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn as_percent(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 1)?;
    let total_expr = get_optional_arg(&fe.args, "total", 1)
        .map(|arg| arg.expr.clone())
        .unwrap_or(Expr::None(crate::parser::NoneExpr));
    let nodes = if fe.args.len() > 2 {
        get_nodes(&fe.args[2..])?
    } else {
        Vec::new()
    };
    let mut stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    match &total_expr {
        Expr::None(_) => {
            if nodes.is_empty() {
                let (mut ss, step) = fetch_normalized_series(ec, stream, true)?;
                inplace_percent_for_multi_series(ec, fe, &mut ss, step);
                return Ok(multi_series(ss));
            }
            let (m, step) = fetch_normalized_series_by_nodes(ec, stream, &nodes)?;
            let mut ss_all = Vec::new();
            for (_, mut ss) in m {
                inplace_percent_for_multi_series(ec, fe, &mut ss, step);
                ss_all.extend(ss);
            }
            Ok(multi_series(ss_all))
        }
        Expr::Number(ne) => {
            if !nodes.is_empty() {
                let _ = drain_all_series(stream.as_mut());
                return Err(Error::Argument(
                    "unexpected non-empty nodes for numeric total".to_string(),
                ));
            }
            let total = ne.n;
            let fe = fe.clone();
            Ok(concurrent_map(
                stream,
                Arc::new(move |mut s: Series| {
                    for v in s.values.iter_mut() {
                        *v = *v / total * 100.0;
                    }
                    s.name = format!("asPercent({},{})", s.name, format_float(total));
                    s.expr = Expr::Func(fe.clone());
                    s.path_expression = s.name.clone();
                    Ok(Some(s))
                }),
            ))
        }
        total => {
            let mut next_total = match ev.eval_expr(ec, total) {
                Ok(next_total) => next_total,
                Err(err) => {
                    let _ = drain_all_series(stream.as_mut());
                    return Err(err);
                }
            };
            if nodes.is_empty() {
                // Serial fetch keeps the total series in their original
                // order so they can be paired with the input series.
                let (ss_total, step_total) = match fetch_normalized_series(ec, next_total, false) {
                    Ok(x) => x,
                    Err(err) => {
                        let _ = drain_all_series(stream.as_mut());
                        return Err(err);
                    }
                };
                if ss_total.is_empty() {
                    let _ = drain_all_series(stream.as_mut());
                    return Ok(zero_series());
                }
                if ss_total.len() == 1 {
                    let s_total = ss_total.into_iter().next().unwrap_or_else(|| Series::from_name(""));
                    let fe = fe.clone();
                    let ec_copy = ec.clone();
                    return Ok(concurrent_map(
                        stream,
                        Arc::new(move |mut s: Series| {
                            s.consolidate(&ec_copy, step_total);
                            inplace_percent_for_single_series(&fe, &mut s, &s_total);
                            Ok(Some(s))
                        }),
                    ));
                }
                let (mut ss, step) = fetch_normalized_series(ec, stream, false)?;
                if ss.len() != ss_total.len() {
                    return Err(Error::Execution(format!(
                        "unexpected number of series returned by total expression; got {}; want {}",
                        ss_total.len(),
                        ss.len()
                    )));
                }
                if step != step_total {
                    return Err(Error::Execution(format!(
                        "step mismatch for series and total series: {} vs {}",
                        step, step_total
                    )));
                }
                for (s, s_total) in ss.iter_mut().zip(ss_total.iter()) {
                    inplace_percent_for_single_series(fe, s, s_total);
                }
                return Ok(multi_series(ss));
            }
            let (mut m, step) = match fetch_normalized_series_by_nodes(ec, stream, &nodes) {
                Ok(x) => x,
                Err(err) => {
                    let _ = drain_all_series(next_total.as_mut());
                    return Err(err);
                }
            };
            let (m_total, step_total) = fetch_normalized_series_by_nodes(ec, next_total, &nodes)?;
            if step != step_total {
                return Err(Error::Execution(format!(
                    "step mismatch for series and total series: {} vs {}",
                    step, step_total
                )));
            }
            let mut ss_all = Vec::new();
            for (key, ss_total) in &m_total {
                let mut series_expressions = Vec::with_capacity(ss_total.len());
                let mut state = new_aggr_state(ec.points_len(step), "sum")?;
                for s in ss_total {
                    series_expressions.push(s.path_expression.clone());
                    state.update(&s.values);
                }
                let total_values = state.finalize(ec.x_files_factor);
                let total_name =
                    format_aggr_func_for_percent_series_names("sum", &series_expressions);
                match m.remove(key) {
                    None => {
                        let mut s = new_nan_series(ec, step);
                        let new_name = format!("asPercent(MISSING,{})", total_name);
                        s.name = new_name.clone();
                        s.tags.insert("name".to_string(), new_name);
                        s.expr = Expr::Func(fe.clone());
                        s.path_expression = s.name.clone();
                        ss_all.push(s);
                    }
                    Some(ss) => {
                        for mut s in ss {
                            for (v, &tv) in s.values.iter_mut().zip(total_values.iter()) {
                                *v = *v / tv * 100.0;
                            }
                            let new_name = format!("asPercent({},{})", s.name, total_name);
                            s.name = new_name.clone();
                            s.tags.insert("name".to_string(), new_name);
                            s.expr = Expr::Func(fe.clone());
                            s.path_expression = s.name.clone();
                            ss_all.push(s);
                        }
                    }
                }
            }
            // Series without a matching total group become all-NaN.
            for (_, ss) in m {
                for mut s in ss {
                    for v in s.values.iter_mut() {
                        *v = f64::NAN;
                    }
                    let new_name = format!("asPercent({},MISSING)", s.name);
                    s.name = new_name.clone();
                    s.tags.insert("name".to_string(), new_name);
                    s.expr = Expr::Func(fe.clone());
                    s.path_expression = s.name.clone();
                    ss_all.push(s);
                }
            }
            Ok(multi_series(ss_all))
        }
    }
}

fn inplace_percent_for_single_series(fe: &FuncExpr, s: &mut Series, s_total: &Series) {
    for (v, &tv) in s.values.iter_mut().zip(s_total.values.iter()) {
        *v = *v / tv * 100.0;
    }
    let new_name = format!("asPercent({},{})", s.name, s_total.name);
    s.name = new_name.clone();
    s.tags.insert("name".to_string(), new_name);
    s.expr = Expr::Func(fe.clone());
    s.path_expression = s.name.clone();
}

fn inplace_percent_for_multi_series(
    ec: &EvalConfig,
    fe: &FuncExpr,
    ss: &mut [Series],
    step: i64,
) {
    let mut series_expressions = Vec::with_capacity(ss.len());
    let mut state = match new_aggr_state(ec.points_len(step), "sum") {
        Ok(state) => state,
        Err(_) => return,
    };
    for s in ss.iter() {
        series_expressions.push(s.path_expression.clone());
        state.update(&s.values);
    }
    let total_values = state.finalize(ec.x_files_factor);
    let total_name = format_aggr_func_for_percent_series_names("sum", &series_expressions);
    for s in ss.iter_mut() {
        for (v, &tv) in s.values.iter_mut().zip(total_values.iter()) {
            *v = *v / tv * 100.0;
        }
        let new_name = format!("asPercent({},{})", s.name, total_name);
        s.name = new_name.clone();
        s.tags.insert("name".to_string(), new_name);
        s.expr = Expr::Func(fe.clone());
        s.path_expression = s.name.clone();
    }
}

pub(crate) fn percentile_of_series(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let n = get_number(&fe.args, "n", 1)?;
    // TODO: interpolate the percentile between neighboring points when the
    // interpolate arg is set.
    get_optional_bool(&fe.args, "interpolate", 2, false)?;
    let mut stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    struct Acc {
        state: Box<dyn AggrState>,
        series_expressions: Vec<String>,
    }
    let acc = shared(Acc {
        state: new_aggr_state_percentile(ec.points_len(step), n),
        series_expressions: Vec::new(),
    });
    let acc_update = Arc::clone(&acc);
    let ec_copy = ec.clone();
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let mut acc = acc_update.lock();
            acc.state.update(&s.values);
            acc.series_expressions
                .push(std::mem::take(&mut s.path_expression));
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let mut acc = acc.lock();
    if acc.series_expressions.is_empty() {
        return Ok(zero_series());
    }
    acc.series_expressions.sort_unstable();
    let name = format!(
        "percentileOfSeries({},{})",
        acc.series_expressions[0],
        format_float(n)
    );
    let mut tags = HashMap::new();
    tags.insert("name".to_string(), name.clone());
    let s = Series {
        name: name.clone(),
        tags,
        timestamps: ec.new_timestamps(step),
        values: acc.state.finalize(ec.x_files_factor),
        step,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    };
    Ok(single_series(s))
}

pub(crate) fn weighted_average(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 2)?;
    let nodes = get_nodes(&fe.args[2..])?;
    let avg_stream = eval_series_list(ev, ec, &fe.args, "seriesListAvg", 0)?;
    let (ss, step_avg) = fetch_normalized_series(ec, avg_stream, false)?;
    let weight_stream = eval_series_list(ev, ec, &fe.args, "seriesListWeight", 1)?;
    let (ss_weight, step_weight) = fetch_normalized_series(ec, weight_stream, false)?;
    if ss.len() != ss_weight.len() {
        return Err(Error::Execution(format!(
            "series len mismatch, got seriesListAvg: {},seriesListWeight: {} ",
            ss.len(),
            ss_weight.len()
        )));
    }
    if step_avg != step_weight {
        return Err(Error::Execution(format!(
            "step mismatch for seriesListAvg and seriesListWeight: {} vs {}",
            step_avg, step_weight
        )));
    }
    let name = format!(
        "weightedAverage({},{},{})",
        format_paths_from_series(&ss),
        format_paths_from_series(&ss_weight),
        nodes
            .iter()
            .map(|node| node.to_query_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    let m_avg = group_series_by_nodes(ss, &nodes);
    let m_weight = group_series_by_nodes(ss_weight.clone(), &nodes);
    let mut ss_product = Vec::new();
    for (key, ss) in m_avg {
        let wss = match m_weight.get(&key) {
            Some(wss) if !wss.is_empty() => wss,
            _ => continue,
        };
        let mut s = match ss.into_iter().last() {
            Some(s) => s,
            None => continue,
        };
        let ws = &wss[wss.len() - 1];
        for (v, &w) in s.values.iter_mut().zip(ws.values.iter()) {
            *v *= w;
        }
        ss_product.push(s);
    }
    if ss_product.is_empty() {
        return Ok(zero_series());
    }
    let step = step_avg;
    let mut state = new_aggr_state(ec.points_len(step), "sum")?;
    for s in &ss_product {
        state.update(&s.values);
    }
    let mut values = state.finalize(ec.x_files_factor);
    let mut state_weight = new_aggr_state(ec.points_len(step), "sum")?;
    for s in &ss_weight {
        state_weight.update(&s.values);
    }
    let values_weight = state_weight.finalize(ec.x_files_factor);
    for (v, &w) in values.iter_mut().zip(values_weight.iter()) {
        *v /= w;
    }
    let mut tags = HashMap::new();
    tags.insert("name".to_string(), name.clone());
    let s = Series {
        name: name.clone(),
        tags,
        timestamps: ec.new_timestamps(step),
        values,
        step,
        consolidate_func: None,
        x_files_factor: 0.0,
        path_expression: name,
        expr: Expr::Func(fe.clone()),
    };
    Ok(single_series(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::source::MemorySource;
    use crate::eval::stream::fetch_all_series;
    use crate::parser;

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

    fn two_series_source() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_series_over("foo.a", 0, 180_000, 60_000, &[1.0, 2.0, 3.0]);
        source.add_series_over("foo.b", 0, 180_000, 60_000, &[10.0, 20.0, 30.0]);
        source
    }

    #[test]
    fn test_sum_series() {
        let ss = eval(two_series_source(), "sumSeries(foo.*)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "sumSeries(foo.*)");
        assert_eq!(ss[0].values, vec![11.0, 22.0, 33.0]);
        assert_eq!(ss[0].tags.get("aggregatedBy").unwrap(), "sum");
    }

    #[test]
    fn test_aggregate_with_explicit_func() {
        let ss = eval(two_series_source(), "aggregate(foo.*,'maxSeries')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "maxSeries(foo.*)");
        assert_eq!(ss[0].values, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_aggregate_unknown_func_is_error() {
        let ev = Evaluator::new(Arc::new(two_series_source()));
        let ec = test_config();
        assert!(ev.exec_expr(&ec, "aggregate(foo.*,'bogus')").is_err());
    }

    #[test]
    fn test_aggregate_empty_input_yields_no_series() {
        let ss = eval(MemorySource::new(), "sumSeries(nope.*)");
        assert!(ss.is_empty());
    }

    #[test]
    fn test_divide_series() {
        let mut source = two_series_source();
        source.add_series_over("div.one", 0, 180_000, 60_000, &[2.0]);
        let mut ss = eval(source, "divideSeries(foo.*,div.one)");
        ss.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(ss.len(), 2);
        assert_eq!(ss[0].name, "divideSeries(foo.a,div.one)");
        assert_eq!(ss[0].values, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_divide_series_missing_divisor() {
        let ss = eval(two_series_source(), "divideSeries(foo.a,nope.*)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "divideSeries(foo.a,MISSING)");
        assert!(ss[0].values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_divide_series_rejects_multiple_divisors() {
        let ev = Evaluator::new(Arc::new(two_series_source()));
        let ec = test_config();
        assert!(ev.exec_expr(&ec, "divideSeries(foo.a,foo.*)").is_err());
    }

    #[test]
    fn test_as_percent_no_total() {
        let mut ss = eval(two_series_source(), "asPercent(foo.*)");
        ss.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(ss.len(), 2);
        assert_eq!(ss[0].name, "asPercent(foo.a,sumSeries(foo.*))");
        let want = [100.0 / 11.0, 100.0 * 2.0 / 22.0, 100.0 * 3.0 / 33.0];
        for (got, want) in ss[0].values.iter().zip(want.iter()) {
            assert!((got - want).abs() < 1e-12, "got {:?}", ss[0].values);
        }
    }

    #[test]
    fn test_as_percent_numeric_total() {
        let mut ss = eval(two_series_source(), "asPercent(foo.*,200)");
        ss.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(ss[0].name, "asPercent(foo.a,200)");
        assert_eq!(ss[0].values, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_aggregate_series_lists() {
        let mut source = MemorySource::new();
        source.add_series_over("a.x", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("b.x", 0, 180_000, 60_000, &[2.0]);
        let ss = eval(source, "sumSeriesLists(a.x,b.x)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "sumSeries(a.x,b.x)");
        assert_eq!(ss[0].values, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_aggregate_series_lists_len_mismatch() {
        let mut source = MemorySource::new();
        source.add_series_over("a.x", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("b.x", 0, 180_000, 60_000, &[2.0]);
        source.add_series_over("b.y", 0, 180_000, 60_000, &[3.0]);
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        assert!(ev.exec_expr(&ec, "sumSeriesLists(a.x,b.*)").is_err());
    }

    #[test]
    fn test_percentile_of_series() {
        let mut source = MemorySource::new();
        for i in 0..10 {
            source.add_series_over(
                &format!("p.s{}", i),
                0,
                180_000,
                60_000,
                &[i as f64],
            );
        }
        let ss = eval(source, "percentileOfSeries(p.*,50)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "percentileOfSeries(p.*,50)");
        // Median of 0..=9 with the (phi*(n-1)+0.5) index rule.
        assert_eq!(ss[0].values, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_aggregate_line() {
        let ss = eval(two_series_source(), "aggregateLine(foo.a,'avg')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "aggregateLine(foo.a,2)");
        assert_eq!(ss[0].values, vec![2.0, 2.0, 2.0]);
        assert_eq!(ss[0].timestamps, vec![0, 90_000, 180_000]);
    }

    #[test]
    fn test_aggregate_with_wildcards() {
        let mut source = MemorySource::new();
        source.add_series_over("a.x.c", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("a.y.c", 0, 180_000, 60_000, &[2.0]);
        let ss = eval(source, "aggregateWithWildcards(a.*.c,'sum',1)");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "a.c");
        assert_eq!(ss[0].values, vec![3.0, 3.0, 3.0]);
    }
}
