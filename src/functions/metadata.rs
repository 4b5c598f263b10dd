//! Function metadata registry
//!
//! Static descriptions for every dispatchable function name, serialized
//! for the `/functions` introspection payload. Param lists are derived
//! from the signature strings, so the table stays one line per function.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::Serialize;

/// Introspection record for a single function name.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDescription {
    /// Dispatch name, exactly as written in queries.
    pub name: String,
    /// One-line summary of what the function does.
    pub description: String,
    /// Full call signature, e.g. `summarize(seriesList, intervalString, func='sum', alignToFrom=false)`.
    pub function: String,
    /// Display group in the function browser.
    pub group: String,
    /// Module path reported to clients.
    pub module: String,
    /// Parameter records derived from the signature.
    pub params: Vec<FunctionParam>,
}

/// One parameter of a function signature.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionParam {
    /// Parameter name.
    pub name: String,
    /// Whether the parameter has no default.
    pub required: bool,
    /// Whether the parameter is variadic.
    pub multiple: bool,
    /// Default value text, verbatim from the signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, FunctionDescription> = build_registry();
}

/// Look up the description for a function name.
pub fn describe(name: &str) -> Option<&'static FunctionDescription> {
    FUNCTIONS.get(name)
}

/// All registered descriptions, for serializing the full payload.
pub fn function_descriptions() -> &'static HashMap<&'static str, FunctionDescription> {
    &FUNCTIONS
}

fn build_registry() -> HashMap<&'static str, FunctionDescription> {
    let mut m = HashMap::with_capacity(FUNCS.len());
    for &(name, group, function, description) in FUNCS {
        m.insert(
            name,
            FunctionDescription {
                name: name.to_string(),
                description: description.to_string(),
                function: function.to_string(),
                group: group.to_string(),
                module: "graphite.render.functions".to_string(),
                params: params_from_signature(function),
            },
        );
    }
    m
}

/// Split `name(a, b='x', *rest)` into param records. A leading `*` marks
/// a variadic param; an `=` marks an optional one with a default.
fn params_from_signature(signature: &str) -> Vec<FunctionParam> {
    let inner = match (signature.find('('), signature.rfind(')')) {
        (Some(open), Some(close)) if close > open => &signature[open + 1..close],
        _ => return Vec::new(),
    };
    inner
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (p, multiple) = match p.strip_prefix('*') {
                Some(rest) => (rest, true),
                None => (p, false),
            };
            match p.split_once('=') {
                Some((name, default)) => FunctionParam {
                    name: name.to_string(),
                    required: false,
                    multiple,
                    default: Some(default.to_string()),
                },
                None => FunctionParam {
                    name: p.to_string(),
                    required: true,
                    multiple,
                    default: None,
                },
            }
        })
        .collect()
}

// name, group, signature, description. One entry per dispatchable name;
// alias names get their own row.
#[rustfmt::skip]
const FUNCS: &[(&str, &str, &str, &str)] = &[
    ("absolute", "Transform", "absolute(seriesList)", "Takes the absolute value of each point."),
    ("add", "Transform", "add(seriesList, constant)", "Adds a constant to each point."),
    ("aggregate", "Combine", "aggregate(seriesList, func, xFilesFactor=None)", "Aggregates all series pointwise with the given function."),
    ("aggregateLine", "Calculate", "aggregateLine(seriesList, func='average', keepStep=false)", "Draws a horizontal line at the aggregated value of each series."),
    ("aggregateSeriesLists", "Combine", "aggregateSeriesLists(seriesListFirstPos, seriesListSecondPos, func, xFilesFactor=None)", "Aggregates series from two lists pairwise."),
    ("aggregateWithWildcards", "Combine", "aggregateWithWildcards(seriesList, func, *positions)", "Aggregates series after removing the given name nodes."),
    ("alias", "Alias", "alias(seriesList, newName)", "Renames every series to the given name."),
    ("aliasByMetric", "Alias", "aliasByMetric(seriesList)", "Renames every series to its last name node."),
    ("aliasByNode", "Alias", "aliasByNode(seriesList, *nodes)", "Renames every series from the given name nodes and tags."),
    ("aliasByTags", "Alias", "aliasByTags(seriesList, *tags)", "Renames every series from the given tags."),
    ("aliasQuery", "Alias", "aliasQuery(seriesList, search, replace, newName)", "Renames series from the last value of a derived query."),
    ("aliasSub", "Alias", "aliasSub(seriesList, search, replace)", "Renames series by regexp substitution."),
    ("alpha", "Graph", "alpha(seriesList, alpha)", "Sets the opacity used when rendering."),
    ("applyByNode", "Combine", "applyByNode(seriesList, nodeNum, templateFunction, newName=None)", "Applies a query template to each node prefix."),
    ("areaBetween", "Graph", "areaBetween(seriesList)", "Draws the area between two series."),
    ("asPercent", "Combine", "asPercent(seriesList, total=None, *nodes)", "Expresses each series as a percentage of a total."),
    ("averageAbove", "Filter Series", "averageAbove(seriesList, n)", "Keeps series whose average is above n."),
    ("averageBelow", "Filter Series", "averageBelow(seriesList, n)", "Keeps series whose average is below n."),
    ("averageOutsidePercentile", "Filter Series", "averageOutsidePercentile(seriesList, n)", "Keeps series whose average lies outside the n-th percentile band."),
    ("averageSeries", "Combine", "averageSeries(*seriesLists)", "Pointwise average of all series."),
    ("avg", "Combine", "avg(*seriesLists)", "Pointwise average of all series."),
    ("averageSeriesWithWildcards", "Combine", "averageSeriesWithWildcards(seriesList, *positions)", "Averages series after removing the given name nodes."),
    ("cactiStyle", "Special", "cactiStyle(seriesList, system=None, units=None)", "Appends Cacti-style legend values to series names."),
    ("changed", "Transform", "changed(seriesList)", "Emits 1 when the value changes, 0 otherwise."),
    ("color", "Graph", "color(seriesList, theColor)", "Sets the color used when rendering."),
    ("consolidateBy", "Special", "consolidateBy(seriesList, consolidationFunc)", "Sets the consolidation function used when reducing resolution."),
    ("constantLine", "Special", "constantLine(value)", "Draws a horizontal line at the given value."),
    ("countSeries", "Combine", "countSeries(*seriesLists)", "Pointwise count of non-empty values across series."),
    ("cumulative", "Special", "cumulative(seriesList)", "Shorthand for consolidateBy(seriesList, 'sum')."),
    ("currentAbove", "Filter Series", "currentAbove(seriesList, n)", "Keeps series whose last value is above n."),
    ("currentBelow", "Filter Series", "currentBelow(seriesList, n)", "Keeps series whose last value is below n."),
    ("dashed", "Graph", "dashed(seriesList, dashLength=5)", "Renders series with a dashed line."),
    ("delay", "Transform", "delay(seriesList, steps)", "Shifts values by the given number of steps."),
    ("derivative", "Transform", "derivative(seriesList)", "Delta between consecutive points."),
    ("diffSeries", "Combine", "diffSeries(*seriesLists)", "Subtracts all subsequent series from the first."),
    ("diffSeriesLists", "Combine", "diffSeriesLists(seriesListFirstPos, seriesListSecondPos)", "Subtracts series from two lists pairwise."),
    ("divideSeries", "Combine", "divideSeries(dividendSeriesList, divisorSeries)", "Divides each series by a divisor series."),
    ("divideSeriesLists", "Combine", "divideSeriesLists(dividendSeriesList, divisorSeriesList)", "Divides series from two lists pairwise."),
    ("drawAsInfinite", "Graph", "drawAsInfinite(seriesList)", "Renders non-zero values as vertical lines."),
    ("events", "Special", "events(*tags)", "Returns events matching the given tags."),
    ("exclude", "Filter Series", "exclude(seriesList, pattern)", "Drops series whose name matches the regexp."),
    ("exp", "Transform", "exp(seriesList)", "Raises e to the power of each point."),
    ("exponentialMovingAverage", "Calculate", "exponentialMovingAverage(seriesList, windowSize)", "Exponential moving average over the given window."),
    ("fallbackSeries", "Special", "fallbackSeries(seriesList, fallback)", "Substitutes the fallback when the series list is empty."),
    ("filterSeries", "Filter Series", "filterSeries(seriesList, func, operator, threshold)", "Keeps series whose aggregate passes the comparison."),
    ("grep", "Filter Series", "grep(seriesList, pattern)", "Keeps series whose name matches the regexp."),
    ("group", "Combine", "group(*seriesLists)", "Concatenates multiple series lists."),
    ("groupByNode", "Combine", "groupByNode(seriesList, nodeNum, callback='average')", "Aggregates series sharing the given name node."),
    ("groupByNodes", "Combine", "groupByNodes(seriesList, callback, *nodes)", "Aggregates series sharing the given name nodes."),
    ("groupByTags", "Combine", "groupByTags(seriesList, callback, *tags)", "Aggregates series sharing the given tag values."),
    ("highest", "Filter Series", "highest(seriesList, n=1, func='average')", "Keeps the n series with the highest aggregate."),
    ("highestAverage", "Filter Series", "highestAverage(seriesList, n)", "Keeps the n series with the highest average."),
    ("highestCurrent", "Filter Series", "highestCurrent(seriesList, n)", "Keeps the n series with the highest last value."),
    ("highestMax", "Filter Series", "highestMax(seriesList, n)", "Keeps the n series with the highest maximum."),
    ("hitcount", "Transform", "hitcount(seriesList, intervalString, alignToInterval=false)", "Integrates values per interval, turning rates into counts."),
    ("holtWintersAberration", "Calculate", "holtWintersAberration(seriesList, delta=3, bootstrapInterval='7d', seasonality='1d')", "Deviation outside the Holt-Winters confidence bands."),
    ("holtWintersConfidenceArea", "Calculate", "holtWintersConfidenceArea(seriesList, delta=3, bootstrapInterval='7d', seasonality='1d')", "Area between the Holt-Winters confidence bands."),
    ("holtWintersConfidenceBands", "Calculate", "holtWintersConfidenceBands(seriesList, delta=3, bootstrapInterval='7d', seasonality='1d')", "Upper and lower Holt-Winters confidence bands."),
    ("holtWintersForecast", "Calculate", "holtWintersForecast(seriesList, bootstrapInterval='7d', seasonality='1d')", "Holt-Winters triple exponential smoothing forecast."),
    ("identity", "Calculate", "identity(name)", "Series whose values equal their timestamps in seconds."),
    ("integral", "Transform", "integral(seriesList)", "Running sum of each series."),
    ("integralByInterval", "Transform", "integralByInterval(seriesList, intervalUnit)", "Running sum resetting at every interval boundary."),
    ("interpolate", "Transform", "interpolate(seriesList, limit=inf)", "Linearly interpolates across gaps no longer than limit."),
    ("invert", "Transform", "invert(seriesList)", "Pointwise 1/x."),
    ("isNonNull", "Transform", "isNonNull(seriesList)", "Emits 1 where a value exists, 0 where it is null."),
    ("keepLastValue", "Transform", "keepLastValue(seriesList, limit=inf)", "Carries the last value across gaps no longer than limit."),
    ("limit", "Filter Series", "limit(seriesList, n)", "Keeps only the first n series."),
    ("lineWidth", "Graph", "lineWidth(seriesList, width)", "Sets the line width used when rendering."),
    ("linearRegression", "Calculate", "linearRegression(seriesList, startSourceAt=None, endSourceAt=None)", "Least-squares line fitted over the source range."),
    ("log", "Transform", "log(seriesList, base=10)", "Logarithm of each point in the given base."),
    ("logarithm", "Transform", "logarithm(seriesList, base=10)", "Logarithm of each point in the given base."),
    ("logit", "Transform", "logit(seriesList)", "Pointwise log(x / (1 - x))."),
    ("lowest", "Filter Series", "lowest(seriesList, n=1, func='average')", "Keeps the n series with the lowest aggregate."),
    ("lowestAverage", "Filter Series", "lowestAverage(seriesList, n)", "Keeps the n series with the lowest average."),
    ("lowestCurrent", "Filter Series", "lowestCurrent(seriesList, n)", "Keeps the n series with the lowest last value."),
    ("map", "Combine", "map(seriesList, *mapNodes)", "Splits a series list for use with reduceSeries."),
    ("mapSeries", "Combine", "mapSeries(seriesList, *mapNodes)", "Splits a series list for use with reduceSeries."),
    ("max", "Combine", "max(*seriesLists)", "Pointwise maximum across series."),
    ("maxSeries", "Combine", "maxSeries(*seriesLists)", "Pointwise maximum across series."),
    ("maximumAbove", "Filter Series", "maximumAbove(seriesList, n)", "Keeps series whose maximum is above n."),
    ("maximumBelow", "Filter Series", "maximumBelow(seriesList, n)", "Keeps series whose maximum is below n."),
    ("minMax", "Transform", "minMax(seriesList)", "Rescales each series onto [0, 1] by its own min and max."),
    ("min", "Combine", "min(*seriesLists)", "Pointwise minimum across series."),
    ("minSeries", "Combine", "minSeries(*seriesLists)", "Pointwise minimum across series."),
    ("minimumAbove", "Filter Series", "minimumAbove(seriesList, n)", "Keeps series whose minimum is above n."),
    ("minimumBelow", "Filter Series", "minimumBelow(seriesList, n)", "Keeps series whose minimum is below n."),
    ("mostDeviant", "Filter Series", "mostDeviant(seriesList, n)", "Keeps the n series with the highest variance."),
    ("movingAverage", "Calculate", "movingAverage(seriesList, windowSize, xFilesFactor=None)", "Moving average over the given window."),
    ("movingMax", "Calculate", "movingMax(seriesList, windowSize, xFilesFactor=None)", "Moving maximum over the given window."),
    ("movingMedian", "Calculate", "movingMedian(seriesList, windowSize, xFilesFactor=None)", "Moving median over the given window."),
    ("movingMin", "Calculate", "movingMin(seriesList, windowSize, xFilesFactor=None)", "Moving minimum over the given window."),
    ("movingSum", "Calculate", "movingSum(seriesList, windowSize, xFilesFactor=None)", "Moving sum over the given window."),
    ("movingWindow", "Calculate", "movingWindow(seriesList, windowSize, func='average', xFilesFactor=None)", "Moving aggregate over the given window."),
    ("multiplySeries", "Combine", "multiplySeries(*seriesLists)", "Pointwise product across series."),
    ("multiplySeriesLists", "Combine", "multiplySeriesLists(seriesListFirstPos, seriesListSecondPos)", "Multiplies series from two lists pairwise."),
    ("multiplySeriesWithWildcards", "Combine", "multiplySeriesWithWildcards(seriesList, *positions)", "Multiplies series after removing the given name nodes."),
    ("nPercentile", "Calculate", "nPercentile(seriesList, n)", "Flattens each series to its n-th percentile value."),
    ("nonNegativeDerivative", "Transform", "nonNegativeDerivative(seriesList, maxValue=None, minValue=None)", "Counter-safe delta between consecutive points."),
    ("offset", "Transform", "offset(seriesList, factor)", "Adds a constant to each non-null point."),
    ("offsetToZero", "Transform", "offsetToZero(seriesList)", "Subtracts each series' minimum so it touches zero."),
    ("perSecond", "Transform", "perSecond(seriesList, maxValue=None, minValue=None)", "Counter-safe per-second rate."),
    ("percentileOfSeries", "Combine", "percentileOfSeries(seriesList, n, interpolate=false)", "Pointwise n-th percentile across series."),
    ("pow", "Transform", "pow(seriesList, factor)", "Raises each point to the given power."),
    ("powSeries", "Combine", "powSeries(*seriesLists)", "Pointwise exponentiation left to right across series."),
    ("randomWalk", "Special", "randomWalk(name, step=60)", "Generates a random walk series."),
    ("randomWalkFunction", "Special", "randomWalkFunction(name, step=60)", "Generates a random walk series."),
    ("rangeOfSeries", "Combine", "rangeOfSeries(*seriesLists)", "Pointwise max minus min across series."),
    ("reduce", "Combine", "reduce(seriesLists, reduceFunction, reduceNode, *reduceMatchers)", "Aggregates mapped series lists by matcher node."),
    ("reduceSeries", "Combine", "reduceSeries(seriesLists, reduceFunction, reduceNode, *reduceMatchers)", "Aggregates mapped series lists by matcher node."),
    ("removeAbovePercentile", "Filter Data", "removeAbovePercentile(seriesList, n)", "Nulls values above the series' n-th percentile."),
    ("removeAboveValue", "Filter Data", "removeAboveValue(seriesList, n)", "Nulls values above n."),
    ("removeBelowPercentile", "Filter Data", "removeBelowPercentile(seriesList, n)", "Nulls values below the series' n-th percentile."),
    ("removeBelowValue", "Filter Data", "removeBelowValue(seriesList, n)", "Nulls values below n."),
    ("removeBetweenPercentile", "Filter Series", "removeBetweenPercentile(seriesList, n)", "Keeps series straying outside the n-th percentile band."),
    ("removeEmptySeries", "Filter Series", "removeEmptySeries(seriesList, xFilesFactor=None)", "Drops series with too few non-null points."),
    ("round", "Transform", "round(seriesList, precision=0)", "Rounds each point to the given precision."),
    ("roundFunction", "Transform", "roundFunction(seriesList, precision=0)", "Rounds each point to the given precision."),
    ("scale", "Transform", "scale(seriesList, factor)", "Multiplies each point by a constant."),
    ("scaleToSeconds", "Transform", "scaleToSeconds(seriesList, seconds)", "Rescales each point to cover the given number of seconds."),
    ("secondYAxis", "Graph", "secondYAxis(seriesList)", "Renders series against the right-hand axis."),
    ("seriesByTag", "Special", "seriesByTag(*tagExpressions)", "Fetches series matching the given tag expressions."),
    ("setXFilesFactor", "Special", "setXFilesFactor(seriesList, xFilesFactor)", "Sets the xFilesFactor used by downstream consolidation."),
    ("sigmoid", "Transform", "sigmoid(seriesList)", "Pointwise 1 / (1 + exp(-x))."),
    ("sin", "Special", "sin(name, amplitude=1, step=60)", "Generates a sine wave series."),
    ("sinFunction", "Special", "sinFunction(name, amplitude=1, step=60)", "Generates a sine wave series."),
    ("smartSummarize", "Transform", "smartSummarize(seriesList, intervalString, func='sum', alignTo=None)", "Summarizes into calendar-aligned buckets."),
    ("sortBy", "Sorting", "sortBy(seriesList, func='average', reverse=false)", "Sorts series by an aggregate of their values."),
    ("sortByMaxima", "Sorting", "sortByMaxima(seriesList)", "Sorts series by maximum, descending."),
    ("sortByMinima", "Sorting", "sortByMinima(seriesList)", "Sorts positive series by minimum, ascending."),
    ("sortByName", "Sorting", "sortByName(seriesList, natural=false, reverse=false)", "Sorts series by name."),
    ("sortByTotal", "Sorting", "sortByTotal(seriesList)", "Sorts series by sum, descending."),
    ("squareRoot", "Transform", "squareRoot(seriesList)", "Square root of each point."),
    ("stacked", "Graph", "stacked(seriesLists, stackName='__DEFAULT__')", "Renders series stacked on top of each other."),
    ("stddevSeries", "Combine", "stddevSeries(*seriesLists)", "Pointwise standard deviation across series."),
    ("stdev", "Calculate", "stdev(seriesList, points, windowTolerance=0.1)", "Moving standard deviation over the given number of points."),
    ("substr", "Special", "substr(seriesList, start=0, stop=0)", "Keeps only the given name node range."),
    ("sum", "Combine", "sum(*seriesLists)", "Pointwise sum across series."),
    ("sumSeries", "Combine", "sumSeries(*seriesLists)", "Pointwise sum across series."),
    ("sumSeriesLists", "Combine", "sumSeriesLists(seriesListFirstPos, seriesListSecondPos)", "Sums series from two lists pairwise."),
    ("sumSeriesWithWildcards", "Combine", "sumSeriesWithWildcards(seriesList, *positions)", "Sums series after removing the given name nodes."),
    ("summarize", "Transform", "summarize(seriesList, intervalString, func='sum', alignToFrom=false)", "Summarizes each series into fixed-size buckets."),
    ("threshold", "Graph", "threshold(value, label=None, color=None)", "Draws a labeled horizontal line at the given value."),
    ("time", "Special", "time(name, step=60)", "Series whose values equal their timestamps in seconds."),
    ("timeFunction", "Special", "timeFunction(name, step=60)", "Series whose values equal their timestamps in seconds."),
    ("timeShift", "Transform", "timeShift(seriesList, timeShift, resetEnd=true, alignDST=false)", "Fetches data shifted in time and realigns it."),
    ("timeSlice", "Transform", "timeSlice(seriesList, startSliceAt, endSliceAt='now')", "Nulls values outside the given time window."),
    ("timeStack", "Transform", "timeStack(seriesList, timeShiftUnit='1d', timeShiftStart=0, timeShiftEnd=7)", "Fetches multiple time-shifted copies of each series."),
    ("transformNull", "Transform", "transformNull(seriesList, default=0, referenceSeries=None)", "Replaces nulls with a default value."),
    ("unique", "Filter Series", "unique(*seriesLists)", "Drops duplicate series by name."),
    ("useSeriesAbove", "Filter Series", "useSeriesAbove(seriesList, value, search, replace)", "Substitutes names for series whose maximum is above value."),
    ("verticalLine", "Graph", "verticalLine(ts, label=None, color=None)", "Draws a vertical line at the given timestamp."),
    ("weightedAverage", "Combine", "weightedAverage(seriesListAvg, seriesListWeight, *nodes)", "Weighted average of node-matched series pairs."),
    ("legendValue", "Alias", "legendValue(seriesList, *valueTypes)", "Appends aggregate values to series legends."),
    ("xFilesFactor", "Special", "xFilesFactor(seriesList, xFilesFactor)", "Sets the xFilesFactor used by downstream consolidation."),
];
