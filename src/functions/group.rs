//! Grouping and regrouping of series
//!
//! The workhorse is [`group_by_key_func`]: it buckets incoming series by a
//! computed key and folds each bucket through its own aggregation state.
//! aggregateWithWildcards, groupByNode(s) and groupByTags all reduce to it
//! with different key functions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::aggr::{new_aggr_state, AggrState};
use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::{format_key_from_tags, get_name_from_nodes, get_path_from_name, Series};
use crate::eval::stream::{
    drain_all_series, map_series_for_aggr_func, multi_series, peek_step, series_group,
    zero_series, SeriesStream, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{
    eval_series_list, get_nodes, get_number, get_optional_string, get_string,
};
use crate::functions::{
    check_arg_count, check_at_least_args, format_paths_from_series_expressions, shared,
};
use crate::parser::{ArgExpr, Expr, FuncExpr};

/// Key derivation for [`group_by_key_func`], from a series name and tags.
pub(crate) type KeyFn = Arc<dyn Fn(&str, &HashMap<String, String>) -> String + Send + Sync>;

pub(crate) fn group(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    group_series_lists(ev, ec, &fe.args, Expr::Func(fe.clone()))
}

/// Evaluate every arg as a series list and concatenate the streams. `expr`
/// becomes the originating expression of every produced series.
pub(crate) fn group_series_lists(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    args: &[ArgExpr],
    expr: Expr,
) -> Result<SeriesStreamBox> {
    let mut streams: Vec<SeriesStreamBox> = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        match eval_series_list(ev, ec, args, "seriesList", i) {
            Ok(stream) => streams.push(stream),
            Err(err) => {
                for mut stream in streams {
                    let _ = drain_all_series(stream.as_mut());
                }
                return Err(err);
            }
        }
    }
    Ok(series_group(streams, Some(expr)))
}

pub(crate) fn group_by_node(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 3)?;
    let nodes = get_nodes(&fe.args[1..2])?;
    let callback = get_optional_string(&fe.args, "callback", 2, "average")?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    group_by_nodes_generic(ec, Expr::Func(fe.clone()), stream, nodes, &callback)
}

pub(crate) fn group_by_nodes(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 2)?;
    let callback = get_string(&fe.args, "callback", 1)?;
    let nodes = get_nodes(&fe.args[2..])?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    group_by_nodes_generic(ec, Expr::Func(fe.clone()), stream, nodes, &callback)
}

fn group_by_nodes_generic(
    ec: &EvalConfig,
    expr: Expr,
    stream: SeriesStreamBox,
    nodes: Vec<Expr>,
    callback: &str,
) -> Result<SeriesStreamBox> {
    let key_func: KeyFn = Arc::new(move |name, tags| get_name_from_nodes(name, tags, &nodes));
    group_by_key_func(ec, expr, stream, callback, key_func)
}

pub(crate) fn group_by_tags(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_at_least_args(fe, 2)?;
    let callback = get_string(&fe.args, "callback", 1)?;
    let mut tag_keys = Vec::with_capacity(fe.args.len().saturating_sub(2));
    for arg in &fe.args[2..] {
        match &arg.expr {
            Expr::Str(se) => tag_keys.push(se.s.clone()),
            other => {
                return Err(Error::Argument(format!(
                    "unexpected tag type: {}; expecting string",
                    other.to_query_string()
                )));
            }
        }
    }
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let callback_copy = callback.clone();
    let key_func: KeyFn =
        Arc::new(move |_name, tags| format_key_from_tags(tags, &tag_keys, &callback_copy));
    group_by_key_func(ec, Expr::Func(fe.clone()), stream, &callback, key_func)
}

/// Bucket series by `key_func` and fold each bucket through its own
/// aggregation state. Tags common to a whole bucket survive on its output
/// series.
pub(crate) fn group_by_key_func(
    ec: &EvalConfig,
    expr: Expr,
    mut stream: SeriesStreamBox,
    aggr_func_name: &str,
    key_func: KeyFn,
) -> Result<SeriesStreamBox> {
    let step = peek_step(&mut stream, ec.storage_step)?;
    struct Entry {
        state: Box<dyn AggrState>,
        tags: HashMap<String, String>,
        series_expressions: Vec<String>,
    }
    let m = shared(HashMap::<String, Entry>::new());
    let m_update = Arc::clone(&m);
    let ec_copy = ec.clone();
    let points_len = ec.points_len(step);
    let func_name = aggr_func_name.to_string();
    let mut wrapped = map_series_for_aggr_func(
        aggr_func_name,
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            let key = key_func(&s.name, &s.tags);
            let mut m = m_update.lock();
            let entry = match m.entry(key) {
                std::collections::hash_map::Entry::Occupied(e) => {
                    let e = e.into_mut();
                    e.tags.retain(|k, v| s.tags.get(k) == Some(v));
                    e
                }
                std::collections::hash_map::Entry::Vacant(slot) => slot.insert(Entry {
                    state: new_aggr_state(points_len, &func_name)?,
                    tags: std::mem::take(&mut s.tags),
                    series_expressions: Vec::new(),
                }),
            };
            entry.state.update(&s.values);
            entry
                .series_expressions
                .push(std::mem::take(&mut s.path_expression));
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let m = std::mem::take(&mut *m.lock());
    let mut ss = Vec::with_capacity(m.len());
    for (key, mut entry) in m {
        if entry.tags.get("name").map_or(true, |v| v.is_empty()) {
            let base = aggr_func_name.strip_suffix("Series").unwrap_or(aggr_func_name);
            entry.tags.insert(
                "name".to_string(),
                format!(
                    "{}Series({})",
                    base,
                    format_paths_from_series_expressions(&entry.series_expressions, true)
                ),
            );
        }
        entry
            .tags
            .insert("aggregatedBy".to_string(), aggr_func_name.to_string());
        let path_expression = entry.tags.get("name").cloned().unwrap_or_default();
        ss.push(Series {
            name: key,
            tags: entry.tags,
            timestamps: ec.new_timestamps(step),
            values: entry.state.finalize(ec.x_files_factor),
            step,
            consolidate_func: None,
            x_files_factor: 0.0,
            path_expression,
            expr: expr.clone(),
        });
    }
    Ok(multi_series(ss))
}

// ============================================================================
// applyByNode
// ============================================================================

pub(crate) fn apply_by_node(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 3, 4)?;
    let node_num = get_number(&fe.args, "nodeNum", 1)? as i64;
    let template = get_string(&fe.args, "templateFunction", 2)?;
    let new_name = get_optional_string(&fe.args, "newName", 3, "")?;
    let inner = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    Ok(Box::new(ApplyByNode {
        ev: Arc::clone(ev),
        ec: ec.clone(),
        fe: fe.clone(),
        node_num,
        template,
        new_name,
        inner,
        template_stream: zero_series(),
        prefix: String::new(),
        visited_prefixes: HashSet::new(),
    }))
}

/// For every distinct series-name prefix of `node_num + 1` path nodes, runs
/// the template query with `%` replaced by the prefix and yields its series.
struct ApplyByNode {
    ev: Arc<Evaluator>,
    ec: EvalConfig,
    fe: FuncExpr,
    node_num: i64,
    template: String,
    new_name: String,
    inner: SeriesStreamBox,
    template_stream: SeriesStreamBox,
    prefix: String,
    visited_prefixes: HashSet<String>,
}

impl SeriesStream for ApplyByNode {
    fn next(&mut self) -> Result<Option<Series>> {
        loop {
            match self.template_stream.next() {
                Ok(Some(mut ts)) => {
                    if !self.new_name.is_empty() {
                        ts.name = self.new_name.replace('%', &self.prefix);
                    }
                    ts.expr = Expr::Func(self.fe.clone());
                    ts.path_expression = self.prefix.clone();
                    return Ok(Some(ts));
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = drain_all_series(self.inner.as_mut());
                    return Err(err);
                }
            }
            loop {
                let s = match self.inner.next()? {
                    Some(s) => s,
                    None => return Ok(None),
                };
                let path = get_path_from_name(&s.name);
                let prefix = {
                    let nodes: Vec<&str> = path.split('.').collect();
                    if self.node_num >= 0 && (self.node_num as usize) < nodes.len() {
                        nodes[..self.node_num as usize + 1].join(".")
                    } else {
                        path
                    }
                };
                if self.visited_prefixes.insert(prefix.clone()) {
                    self.prefix = prefix;
                    break;
                }
            }
            let query = self.template.replace('%', &self.prefix);
            match self.ev.exec_expr(&self.ec, &query) {
                Ok(next) => self.template_stream = next,
                Err(err) => {
                    let _ = drain_all_series(self.inner.as_mut());
                    return Err(err);
                }
            }
        }
    }
}

// ============================================================================
// fallbackSeries
// ============================================================================

pub(crate) fn fallback_series(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 2, 2)?;
    let inner = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    Ok(Box::new(FallbackSeries {
        ev: Arc::clone(ev),
        ec: ec.clone(),
        fe: fe.clone(),
        inner,
        series_fetched: 0,
        fallback_used: false,
    }))
}

/// Yields the primary series list; only when it turns out to be empty is
/// the fallback expression evaluated.
struct FallbackSeries {
    ev: Arc<Evaluator>,
    ec: EvalConfig,
    fe: FuncExpr,
    inner: SeriesStreamBox,
    series_fetched: usize,
    fallback_used: bool,
}

impl SeriesStream for FallbackSeries {
    fn next(&mut self) -> Result<Option<Series>> {
        loop {
            if let Some(mut s) = self.inner.next()? {
                self.series_fetched += 1;
                s.expr = Expr::Func(self.fe.clone());
                return Ok(Some(s));
            }
            if self.fallback_used || self.series_fetched > 0 {
                return Ok(None);
            }
            self.inner = eval_series_list(&self.ev, &self.ec, &self.fe.args, "fallback", 1)?;
            self.fallback_used = true;
        }
    }
}
