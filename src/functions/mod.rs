//! Graphite render-API function library
//!
//! Each function takes the evaluator, the evaluation config and the parsed
//! call expression, and returns a lazy series stream. Dispatch is a plain
//! match on the exact (case-sensitive) function name.

pub mod aggregate;
pub mod alias;
pub mod args;
pub mod filter;
pub mod generate;
pub mod group;
pub mod metadata;
pub mod moving;
pub mod sort;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::{get_name_from_nodes, Series};
use crate::eval::stream::{
    concurrent_map, fetch_all_series, peek_step, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::parser::{Expr, FuncExpr};

/// Dispatch a function call to its implementation.
pub fn transform(ev: &Arc<Evaluator>, ec: &EvalConfig, fe: &FuncExpr) -> Result<SeriesStreamBox> {
    match fe.func_name.as_str() {
        "absolute" => transform::absolute(ev, ec, fe),
        "add" => transform::add(ev, ec, fe),
        "aggregate" => aggregate::aggregate(ev, ec, fe),
        "aggregateLine" => aggregate::aggregate_line(ev, ec, fe),
        "aggregateSeriesLists" => aggregate::aggregate_series_lists(ev, ec, fe),
        "aggregateWithWildcards" => aggregate::aggregate_with_wildcards(ev, ec, fe),
        "alias" => alias::alias(ev, ec, fe),
        "aliasByMetric" => alias::alias_by_metric(ev, ec, fe),
        "aliasByNode" | "aliasByTags" => alias::alias_by_node(ev, ec, fe),
        "aliasQuery" => alias::alias_query(ev, ec, fe),
        "aliasSub" => alias::alias_sub(ev, ec, fe),
        "alpha" => alias::alpha(ev, ec, fe),
        "applyByNode" => group::apply_by_node(ev, ec, fe),
        "areaBetween" => alias::area_between(ev, ec, fe),
        "asPercent" => aggregate::as_percent(ev, ec, fe),
        "averageAbove" => filter::average_above(ev, ec, fe),
        "averageBelow" => filter::average_below(ev, ec, fe),
        "averageOutsidePercentile" => filter::average_outside_percentile(ev, ec, fe),
        "averageSeries" | "avg" => aggregate::aggregate_generic(ev, ec, fe, "average"),
        "averageSeriesWithWildcards" => {
            aggregate::aggregate_with_wildcards_generic(ev, ec, fe, "average")
        }
        "changed" => transform::changed(ev, ec, fe),
        "color" => alias::color(ev, ec, fe),
        "consolidateBy" => transform::consolidate_by(ev, ec, fe),
        "constantLine" => generate::constant_line_func(ev, ec, fe),
        "countSeries" => aggregate::aggregate_generic(ev, ec, fe, "count"),
        "cumulative" => transform::cumulative(ev, ec, fe),
        "currentAbove" => filter::current_above(ev, ec, fe),
        "currentBelow" => filter::current_below(ev, ec, fe),
        "dashed" => alias::dashed(ev, ec, fe),
        "delay" => moving::delay(ev, ec, fe),
        "derivative" => transform::derivative(ev, ec, fe),
        "diffSeries" => aggregate::aggregate_generic(ev, ec, fe, "diff"),
        "diffSeriesLists" => aggregate::aggregate_series_lists_generic(ev, ec, fe, "diff"),
        "divideSeries" => aggregate::divide_series(ev, ec, fe),
        "divideSeriesLists" => aggregate::divide_series_lists(ev, ec, fe),
        "drawAsInfinite" => alias::draw_as_infinite(ev, ec, fe),
        "events" => generate::events(ev, ec, fe),
        "exclude" => filter::exclude(ev, ec, fe),
        "exp" => transform::exp(ev, ec, fe),
        "exponentialMovingAverage" => moving::exponential_moving_average(ev, ec, fe),
        "fallbackSeries" => group::fallback_series(ev, ec, fe),
        "filterSeries" => filter::filter_series(ev, ec, fe),
        "grep" => filter::grep(ev, ec, fe),
        "group" => group::group(ev, ec, fe),
        "groupByNode" => group::group_by_node(ev, ec, fe),
        "groupByNodes" => group::group_by_nodes(ev, ec, fe),
        "groupByTags" => group::group_by_tags(ev, ec, fe),
        "highest" => filter::highest(ev, ec, fe),
        "highestAverage" => filter::highest_average(ev, ec, fe),
        "highestCurrent" => filter::highest_current(ev, ec, fe),
        "highestMax" => filter::highest_max(ev, ec, fe),
        "hitcount" => transform::hitcount(ev, ec, fe),
        "holtWintersAberration" => moving::holt_winters_aberration(ev, ec, fe),
        "holtWintersConfidenceArea" => moving::holt_winters_confidence_area(ev, ec, fe),
        "holtWintersConfidenceBands" => moving::holt_winters_confidence_bands(ev, ec, fe),
        "holtWintersForecast" => moving::holt_winters_forecast(ev, ec, fe),
        "identity" => generate::identity(ev, ec, fe),
        "integral" => transform::integral(ev, ec, fe),
        "integralByInterval" => transform::integral_by_interval(ev, ec, fe),
        "interpolate" => transform::interpolate(ev, ec, fe),
        "invert" => transform::invert(ev, ec, fe),
        "isNonNull" => transform::is_non_null(ev, ec, fe),
        "keepLastValue" => transform::keep_last_value(ev, ec, fe),
        "limit" => filter::limit(ev, ec, fe),
        "lineWidth" => alias::line_width(ev, ec, fe),
        "linearRegression" => moving::linear_regression(ev, ec, fe),
        "log" | "logarithm" => transform::logarithm(ev, ec, fe),
        "logit" => transform::logit(ev, ec, fe),
        "lowest" => filter::lowest(ev, ec, fe),
        "lowestAverage" => filter::lowest_average(ev, ec, fe),
        "lowestCurrent" => filter::lowest_current(ev, ec, fe),
        "max" | "maxSeries" => aggregate::aggregate_generic(ev, ec, fe, "max"),
        "maximumAbove" => filter::maximum_above(ev, ec, fe),
        "maximumBelow" => filter::maximum_below(ev, ec, fe),
        "minMax" => transform::min_max(ev, ec, fe),
        "min" | "minSeries" => aggregate::aggregate_generic(ev, ec, fe, "min"),
        "minimumAbove" => filter::minimum_above(ev, ec, fe),
        "minimumBelow" => filter::minimum_below(ev, ec, fe),
        "mostDeviant" => filter::most_deviant(ev, ec, fe),
        "movingAverage" => moving::moving_window_generic(ev, ec, fe, "average"),
        "movingMax" => moving::moving_window_generic(ev, ec, fe, "max"),
        "movingMedian" => moving::moving_window_generic(ev, ec, fe, "median"),
        "movingMin" => moving::moving_window_generic(ev, ec, fe, "min"),
        "movingSum" => moving::moving_window_generic(ev, ec, fe, "sum"),
        "movingWindow" => moving::moving_window_func(ev, ec, fe),
        "multiplySeries" => aggregate::aggregate_generic(ev, ec, fe, "multiply"),
        "multiplySeriesLists" => {
            aggregate::aggregate_series_lists_generic(ev, ec, fe, "multiply")
        }
        "multiplySeriesWithWildcards" => {
            aggregate::aggregate_with_wildcards_generic(ev, ec, fe, "multiply")
        }
        "nPercentile" => transform::n_percentile(ev, ec, fe),
        "nonNegativeDerivative" => transform::non_negative_derivative(ev, ec, fe),
        "offset" => transform::offset(ev, ec, fe),
        "offsetToZero" => transform::offset_to_zero(ev, ec, fe),
        "perSecond" => transform::per_second(ev, ec, fe),
        "percentileOfSeries" => aggregate::percentile_of_series(ev, ec, fe),
        "pow" => transform::pow(ev, ec, fe),
        "powSeries" => aggregate::aggregate_generic(ev, ec, fe, "pow"),
        "randomWalk" | "randomWalkFunction" => generate::random_walk(ev, ec, fe),
        "rangeOfSeries" => aggregate::aggregate_generic(ev, ec, fe, "rangeOf"),
        "removeAbovePercentile" => filter::remove_above_percentile(ev, ec, fe),
        "removeAboveValue" => filter::remove_above_value(ev, ec, fe),
        "removeBelowPercentile" => filter::remove_below_percentile(ev, ec, fe),
        "removeBelowValue" => filter::remove_below_value(ev, ec, fe),
        "removeBetweenPercentile" => filter::remove_between_percentile(ev, ec, fe),
        "removeEmptySeries" => filter::remove_empty_series(ev, ec, fe),
        "round" | "roundFunction" => transform::round_function(ev, ec, fe),
        "scale" => transform::scale(ev, ec, fe),
        "scaleToSeconds" => transform::scale_to_seconds(ev, ec, fe),
        "secondYAxis" => alias::second_y_axis(ev, ec, fe),
        "seriesByTag" => generate::series_by_tag(ev, ec, fe),
        "setXFilesFactor" | "xFilesFactor" => transform::set_x_files_factor(ev, ec, fe),
        "sigmoid" => transform::sigmoid(ev, ec, fe),
        "sin" | "sinFunction" => generate::sin_function(ev, ec, fe),
        "smartSummarize" => transform::smart_summarize(ev, ec, fe),
        "sortBy" => sort::sort_by(ev, ec, fe),
        "sortByMaxima" => sort::sort_by_maxima(ev, ec, fe),
        "sortByMinima" => sort::sort_by_minima(ev, ec, fe),
        "sortByName" => sort::sort_by_name(ev, ec, fe),
        "sortByTotal" => sort::sort_by_total(ev, ec, fe),
        "squareRoot" => transform::square_root(ev, ec, fe),
        "stacked" => alias::stacked(ev, ec, fe),
        "stddevSeries" => aggregate::aggregate_generic(ev, ec, fe, "stddev"),
        "stdev" => moving::stdev(ev, ec, fe),
        "substr" => alias::substr(ev, ec, fe),
        "sum" | "sumSeries" => aggregate::aggregate_generic(ev, ec, fe, "sum"),
        "sumSeriesLists" => aggregate::aggregate_series_lists_generic(ev, ec, fe, "sum"),
        "sumSeriesWithWildcards" => {
            aggregate::aggregate_with_wildcards_generic(ev, ec, fe, "sum")
        }
        "summarize" => transform::summarize(ev, ec, fe),
        "threshold" => generate::threshold(ev, ec, fe),
        "time" | "timeFunction" => generate::time_function(ev, ec, fe),
        "timeShift" => moving::time_shift(ev, ec, fe),
        "timeSlice" => moving::time_slice(ev, ec, fe),
        "timeStack" => moving::time_stack(ev, ec, fe),
        "transformNull" => transform::transform_null(ev, ec, fe),
        "unique" => filter::unique(ev, ec, fe),
        "useSeriesAbove" => filter::use_series_above(ev, ec, fe),
        "verticalLine" => generate::vertical_line(ev, ec, fe),
        "weightedAverage" => aggregate::weighted_average(ev, ec, fe),
        "cactiStyle" | "legendValue" | "map" | "mapSeries" | "reduce" | "reduceSeries" => Err(
            Error::Unsupported(format!("function {:?} is not supported yet", fe.func_name)),
        ),
        name => Err(Error::Unsupported(format!("unknown function {:?}", name))),
    }
}

// ============================================================================
// Shared plumbing
// ============================================================================

/// Validate the argument count against an inclusive `[min, max]` range,
/// producing the canonical error text.
pub(crate) fn check_arg_count(fe: &FuncExpr, min: usize, max: usize) -> Result<()> {
    let got = fe.args.len();
    if got >= min && got <= max {
        return Ok(());
    }
    let want = if min == max {
        format!("{}", min)
    } else if max == min + 1 {
        format!("{} or {}", min, max)
    } else {
        format!("from {} to {}", min, max)
    };
    Err(Error::Argument(format!(
        "unexpected number of args; got {}; want {}",
        got, want
    )))
}

/// Validate a lower bound on the argument count.
pub(crate) fn check_at_least_args(fe: &FuncExpr, min: usize) -> Result<()> {
    if fe.args.len() >= min {
        return Ok(());
    }
    Err(Error::Argument(format!(
        "unexpected number of args; got {}; want at least {}",
        fe.args.len(),
        min
    )))
}

/// Consolidate every series from `stream` onto its peeked step and collect
/// them. Serial collection preserves the upstream order.
pub(crate) fn fetch_normalized_series(
    ec: &EvalConfig,
    mut stream: SeriesStreamBox,
    is_concurrent: bool,
) -> Result<(Vec<Series>, i64)> {
    let step = peek_step(&mut stream, ec.storage_step)?;
    let ec = ec.clone();
    let mut normalized = crate::eval::stream::map_series(
        is_concurrent,
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec, step);
            Ok(Some(s))
        }),
    );
    let ss = fetch_all_series(normalized.as_mut())?;
    Ok((ss, step))
}

/// Consolidate and bucket all series by their node key.
pub(crate) fn fetch_normalized_series_by_nodes(
    ec: &EvalConfig,
    mut stream: SeriesStreamBox,
    nodes: &[Expr],
) -> Result<(HashMap<String, Vec<Series>>, i64)> {
    let step = peek_step(&mut stream, ec.storage_step)?;
    let ec_copy = ec.clone();
    let mut normalized = concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.consolidate(&ec_copy, step);
            Ok(Some(s))
        }),
    );
    let ss = fetch_all_series(normalized.as_mut())?;
    Ok((group_series_by_nodes(ss, nodes), step))
}

pub(crate) fn group_series_by_nodes(
    ss: Vec<Series>,
    nodes: &[Expr],
) -> HashMap<String, Vec<Series>> {
    let mut m: HashMap<String, Vec<Series>> = HashMap::new();
    for s in ss {
        let key = get_name_from_nodes(&s.name, &s.tags, nodes);
        m.entry(key).or_default().push(s);
    }
    m
}

/// Format the display name of an aggregation over the given path
/// expressions: `<func>Series(<paths>)` with duplicates removed and paths
/// sorted unless the function is order-sensitive.
pub(crate) fn format_aggr_func_for_series_names(func_name: &str, series_names: &[String]) -> String {
    if series_names.is_empty() {
        return "None".to_string();
    }
    let sort_paths = !crate::aggr::is_serial_func(func_name);
    format!(
        "{}Series({})",
        func_name,
        format_paths_from_series_expressions(series_names, sort_paths)
    )
}

/// Like [`format_aggr_func_for_series_names`], but a single input path is
/// used verbatim (asPercent naming).
pub(crate) fn format_aggr_func_for_percent_series_names(
    func_name: &str,
    series_names: &[String],
) -> String {
    match series_names.len() {
        0 => "None".to_string(),
        1 => series_names[0].clone(),
        _ => format_aggr_func_for_series_names(func_name, series_names),
    }
}

pub(crate) fn format_paths_from_series_expressions(
    series_expressions: &[String],
    sort_paths: bool,
) -> String {
    if series_expressions.is_empty() {
        return String::new();
    }
    let mut paths: Vec<&str> = Vec::with_capacity(series_expressions.len());
    let mut visited: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for path in series_expressions {
        if visited.insert(path.as_str()) {
            paths.push(path.as_str());
        }
    }
    if sort_paths {
        paths.sort_unstable();
    }
    paths.join(",")
}

pub(crate) fn format_paths_from_series(ss: &[Series]) -> String {
    let exprs: Vec<String> = ss.iter().map(|s| s.path_expression.clone()).collect();
    format_paths_from_series_expressions(&exprs, true)
}

/// An all-NaN series covering the config range at `step`.
pub(crate) fn new_nan_series(ec: &EvalConfig, step: i64) -> Series {
    let mut s = Series::from_name("");
    s.tags.clear();
    s.timestamps = ec.new_timestamps(step);
    s.values = vec![f64::NAN; ec.points_len(step)];
    s.step = step;
    s
}

/// Uppercase the first ASCII letter (`average` -> `Average`).
pub(crate) fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Shared accumulator handed to concurrent per-series closures.
pub(crate) type Shared<T> = Arc<Mutex<T>>;

pub(crate) fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
