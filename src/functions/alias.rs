//! Renaming and presentation transforms
//!
//! The alias family rewrites series names; the rest (alpha, color,
//! lineWidth, dashed, stacked and friends) only annotate series for the
//! renderer. Presentation-only transforms still re-point the originating
//! expression so downstream name generation stays correct.

use std::sync::Arc;

use crate::aggr::AggrFunc;
use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::{get_name_from_nodes, get_path_from_name, Series};
use crate::eval::stream::{
    concurrent_map, fetch_all_series, peek_step, serial_map, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_nodes, get_number, get_optional_number, get_optional_string, get_regexp,
    get_regexp_replacement, get_string,
};
use crate::functions::{check_arg_count, check_at_least_args, shared};
use crate::parser::{format_float, Expr, FuncExpr};

pub(crate) fn alias(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let new_name = get_string(&fe.args, "newName", 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.name = new_name.clone();
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// Strips everything up to the last path node.
pub(crate) fn alias_by_metric(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut path = get_path_from_name(&s.name);
            if let Some(n) = path.rfind('.') {
                if n > 0 {
                    path = path[n + 1..].to_string();
                }
            }
            s.name = path;
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// Rebuilds the name from the given path nodes and tag names. Also serves
/// aliasByTags, which is just the tags-only form.
pub(crate) fn alias_by_node(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 1)?;
    let nodes = get_nodes(&fe.args[1..])?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.name = get_name_from_nodes(&s.name, &s.tags, &nodes);
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// Renames each series from the last value of a lookup query derived from
/// its name.
pub(crate) fn alias_query(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 4, 4)?;
    let re = get_regexp(&fe.args, "search", 1)?;
    let replace = get_regexp_replacement(&fe.args, "replace", 2)?;
    let new_name = get_string(&fe.args, "newName", 3)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let ev_copy = Arc::clone(ev);
    let ec_copy = ec.clone();
    let fe_copy = fe.clone();
    Ok(concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let query = re.replace_all(&s.name, replace.as_str()).into_owned();
            let mut next = ev_copy.exec_expr(&ec_copy, &query).map_err(|err| {
                Error::Execution(format!("cannot evaluate query {:?}: {}", query, err))
            })?;
            let ss = fetch_all_series(next.as_mut()).map_err(|err| {
                Error::Execution(format!(
                    "cannot fetch series for query {:?}: {}",
                    query, err
                ))
            })?;
            if ss.is_empty() {
                return Err(Error::Execution(format!(
                    "cannot find series for query {:?}",
                    query
                )));
            }
            let v = AggrFunc::Last.call(&ss[0].values);
            if v.is_nan() {
                return Err(Error::Execution(format!(
                    "cannot find values for query {:?}",
                    query
                )));
            }
            let name = new_name
                .replace("%d", &format!("{}", v as i64))
                .replace("%g", &format_float(v))
                .replace("%f", &format!("{:.6}", v));
            s.name = name;
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn alias_sub(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 3, 3)?;
    let re = get_regexp(&fe.args, "search", 1)?;
    let replace = get_regexp_replacement(&fe.args, "replace", 2)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.name = re.replace_all(&s.name, replace.as_str()).into_owned();
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn alpha(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    get_number(&fe.args, "alpha", 1)?;
    passthrough(ev, ec, fe)
}

pub(crate) fn color(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    get_string(&fe.args, "theColor", 1)?;
    passthrough(ev, ec, fe)
}

pub(crate) fn line_width(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    get_number(&fe.args, "width", 1)?;
    passthrough(ev, ec, fe)
}

// Rendering hints are carried only in the originating expression.
fn passthrough(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn dashed(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let dash_length = get_optional_number(&fe.args, "dashLength", 1, 5.0)?;
    let dash_length_str = format_float(dash_length);
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.name = format!("dashed({},{})", s.name, dash_length_str);
            s.tags.insert("dashed".to_string(), dash_length_str.clone());
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn draw_as_infinite(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.tags.insert("drawAsInfinite".to_string(), "1".to_string());
            s.name = format!("drawAsInfinite({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

pub(crate) fn second_y_axis(
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
            s.tags.insert("secondYAxis".to_string(), "1".to_string());
            s.name = format!("secondYAxis({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            Ok(Some(s))
        }),
    ))
}

/// Marks the two series forming a filled band. More than two input series
/// is an error; the check happens while streaming, so it can surface only
/// on the third pull.
pub(crate) fn area_between(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    let series_found = shared(0usize);
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut found = series_found.lock();
            *found += 1;
            if *found > 2 {
                return Err(Error::Execution(
                    "expecting exactly two series; got more series".to_string(),
                ));
            }
            s.tags.insert("areaBetween".to_string(), "1".to_string());
            s.name = format!("areaBetween({})", s.name);
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Cumulative stacking in input order. Must stay serial so each series is
/// stacked on top of everything yielded before it.
pub(crate) fn stacked(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 2)?;
    let stack_name = get_optional_string(&fe.args, "stackName", 1, "__DEFAULT__")?;
    let mut stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let step = peek_step(&mut stream, ec.storage_step)?;
    let total_stack = shared(vec![0.0f64; ec.points_len(step)]);
    let ec_copy = ec.clone();
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            // Points must be aligned in time before stacking.
            s.consolidate(&ec_copy, step);
            let mut total = total_stack.lock();
            for (i, v) in s.values.iter_mut().enumerate() {
                if !v.is_nan() {
                    total[i] += *v;
                    *v = total[i];
                }
            }
            if stack_name == "__DEFAULT__" {
                s.tags.insert("stacked".to_string(), stack_name.clone());
                s.name = format!("stacked({})", s.name);
            }
            s.expr = Expr::Func(fe_copy.clone());
            s.path_expression = s.name.clone();
            Ok(Some(s))
        }),
    ))
}

/// Keeps only the path nodes in `[start, stop)`, with Python-style
/// negative indexing.
pub(crate) fn substr(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let start_arg = get_optional_number(&fe.args, "start", 1, 0.0)?;
    let stop_arg = get_optional_number(&fe.args, "stop", 2, 0.0)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let fe_copy = fe.clone();
    Ok(serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            let path = get_path_from_name(&s.name);
            let split: Vec<&str> = path.split('.').collect();
            let n = split.len() as i64;
            let mut start = start_arg as i64;
            let mut stop = stop_arg as i64;
            if start > n {
                start = n;
            } else if start < 0 {
                start = (n + start).max(0);
            }
            if stop == 0 || stop > n {
                stop = n;
            } else if stop < 0 {
                stop = (n + stop).max(0);
            }
            if stop < start {
                stop = start;
            }
            s.name = split[start as usize..stop as usize].join(".");
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

    fn cpu_source() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_series_over("east.web.cpu", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("west.web.cpu", 0, 180_000, 60_000, &[4.0]);
        source
    }

    #[test]
    fn test_alias() {
        let ss = eval(cpu_source(), "alias(east.web.cpu,'cpu load')");
        assert_eq!(ss.len(), 1);
        assert_eq!(ss[0].name, "cpu load");
        assert_eq!(ss[0].expr.to_query_string(), "alias(east.web.cpu,'cpu load')");
    }

    #[test]
    fn test_alias_by_metric() {
        let ss = eval(cpu_source(), "aliasByMetric(east.web.cpu)");
        assert_eq!(ss[0].name, "cpu");
    }

    #[test]
    fn test_alias_by_node() {
        let mut ss = eval(cpu_source(), "aliasByNode(*.web.cpu,0,2)");
        ss.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(ss[0].name, "east.cpu");
        assert_eq!(ss[1].name, "west.cpu");
    }

    #[test]
    fn test_alias_sub() {
        let ss = eval(cpu_source(), "aliasSub(east.web.cpu,'web','api')");
        assert_eq!(ss[0].name, "east.api.cpu");
    }

    #[test]
    fn test_alias_query() {
        let mut source = cpu_source();
        source.add_series_over("east.web.id", 0, 180_000, 60_000, &[7.0]);
        let ss = eval(source, "aliasQuery(east.web.cpu,'cpu','id','server %d')");
        assert_eq!(ss[0].name, "server 7");
    }

    #[test]
    fn test_substr_negative_indexes() {
        let ss = eval(cpu_source(), "substr(east.web.cpu,-2)");
        assert_eq!(ss[0].name, "web.cpu");
        let ss = eval(cpu_source(), "substr(east.web.cpu,0,-1)");
        assert_eq!(ss[0].name, "east.web");
    }

    #[test]
    fn test_dashed_default_length() {
        let ss = eval(cpu_source(), "dashed(east.web.cpu)");
        assert_eq!(ss[0].name, "dashed(east.web.cpu,5)");
        assert_eq!(ss[0].tags.get("dashed").unwrap(), "5");
    }

    #[test]
    fn test_draw_as_infinite() {
        let ss = eval(cpu_source(), "drawAsInfinite(east.web.cpu)");
        assert_eq!(ss[0].name, "drawAsInfinite(east.web.cpu)");
        assert_eq!(ss[0].tags.get("drawAsInfinite").unwrap(), "1");
    }

    #[test]
    fn test_area_between_rejects_extra_series() {
        let mut source = cpu_source();
        source.add_series_over("north.web.cpu", 0, 180_000, 60_000, &[2.0]);
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        let mut stream = ev.exec_expr(&ec, "areaBetween(*.web.cpu)").unwrap();
        assert!(fetch_all_series(stream.as_mut()).is_err());
    }

    #[test]
    fn test_stacked_accumulates_in_order() {
        let mut source = MemorySource::new();
        source.add_series_over("a.cpu", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("b.cpu", 0, 180_000, 60_000, &[2.0]);
        let ss = eval(source, "stacked(group(a.cpu,b.cpu))");
        assert_eq!(ss.len(), 2);
        assert_eq!(ss[0].values, vec![1.0, 1.0, 1.0]);
        assert_eq!(ss[1].values, vec![3.0, 3.0, 3.0]);
        assert_eq!(ss[1].name, "stacked(b.cpu)");
    }

    #[test]
    fn test_alpha_keeps_name() {
        let ss = eval(cpu_source(), "alpha(east.web.cpu,0.5)");
        assert_eq!(ss[0].name, "east.web.cpu");
        assert_eq!(ss[0].expr.to_query_string(), "alpha(east.web.cpu,0.5)");
    }
}
