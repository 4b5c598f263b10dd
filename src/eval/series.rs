//! Series value type and consolidation
//!
//! A [`Series`] is the unit flowing through the evaluation pipeline. Its
//! backing arrays are exclusively owned by whichever stage currently holds
//! it, so transforms may mutate values and timestamps in place.

use std::collections::HashMap;

use crate::aggr::{AggrFunc, AGGR_AVG};
use crate::eval::config::EvalConfig;
use crate::parser::{self, Expr, NoneExpr};

/// Maximum ingestion jitter tolerated when resampling: an empty interval
/// pulls in the immediately preceding sample if it lies within this many
/// milliseconds before the interval start.
const MAX_JITTER_MSECS: i64 = 2_000;

/// One named, tagged, time-aligned sequence of samples.
#[derive(Debug, Clone)]
pub struct Series {
    /// Display name, derived by each transform.
    pub name: String,

    /// Tag mapping; always contains the `name` tag.
    pub tags: HashMap<String, String>,

    /// Sample timestamps in unix milliseconds, ascending.
    pub timestamps: Vec<i64>,

    /// Sample values parallel to `timestamps`; NaN means "no sample".
    pub values: Vec<f64>,

    /// Nominal spacing between timestamps, milliseconds.
    pub step: i64,

    /// Per-series consolidation override; falls back to average.
    pub consolidate_func: Option<AggrFunc>,

    /// Per-series xFilesFactor override; falls back to the config value
    /// when not positive.
    pub x_files_factor: f64,

    /// Canonical query text this series originates from.
    pub path_expression: String,

    /// The expression node that produced this series.
    pub expr: Expr,
}

impl Series {
    /// Build a series directly from a Graphite name of the form
    /// `name;tag1=value1;tag2=value2`.
    pub fn from_name(name: &str) -> Self {
        Series {
            name: name.to_string(),
            tags: unmarshal_tags(name),
            timestamps: Vec::new(),
            values: Vec::new(),
            step: 0,
            consolidate_func: None,
            x_files_factor: 0.0,
            path_expression: name.to_string(),
            expr: Expr::None(NoneExpr),
        }
    }

    /// Resample onto the `[ec.start_time, ec.end_time)` grid with the given
    /// step, using the per-series consolidation function and xFilesFactor.
    pub fn consolidate(&mut self, ec: &EvalConfig, step: i64) {
        let aggr_func = self.consolidate_func.unwrap_or(AGGR_AVG);
        let mut x_files_factor = self.x_files_factor;
        if x_files_factor <= 0.0 {
            x_files_factor = ec.x_files_factor;
        }
        self.summarize(aggr_func, ec.start_time, ec.end_time, step, x_files_factor);
    }

    /// Reduce samples into fixed-step intervals over `[start_time, end_time)`
    /// with a two-cursor scan. An interval without samples pulls in the
    /// preceding sample when it lies within [`MAX_JITTER_MSECS`] of the
    /// interval start.
    pub fn summarize(
        &mut self,
        aggr_func: AggrFunc,
        start_time: i64,
        end_time: i64,
        step: i64,
        x_files_factor: f64,
    ) {
        assert!(step > 0, "BUG: summarize step must be positive; got {}", step);
        let points_len = if end_time > start_time {
            ((end_time - start_time + step - 1) / step) as usize
        } else {
            0
        };
        let timestamps = &self.timestamps;
        let values = &self.values;
        let mut dst_timestamps = Vec::with_capacity(points_len);
        let mut dst_values = Vec::with_capacity(points_len);
        let mut ts = start_time;
        let mut i = 0usize;
        while dst_timestamps.len() < points_len {
            let ts_end = ts + step;
            let mut j = i;
            while j < timestamps.len() && timestamps[j] < ts_end {
                j += 1;
            }
            let mut lo = i;
            if i == j && i > 0 && timestamps[i - 1] + MAX_JITTER_MSECS >= ts {
                // Tolerate ingestion jitter.
                lo = i - 1;
            }
            let v = aggr_func.apply(x_files_factor, &values[lo..j]);
            dst_timestamps.push(ts);
            dst_values.push(v);
            ts = ts_end;
            i = j;
        }
        self.timestamps = dst_timestamps;
        self.values = dst_values;
        self.step = step;
    }
}

/// Parse a Graphite series name of the form `name;k1=v1;k2=v2` into tags.
pub fn unmarshal_tags(s: &str) -> HashMap<String, String> {
    let mut m = HashMap::new();
    if s.is_empty() {
        return m;
    }
    let mut parts = s.split(';');
    if let Some(name) = parts.next() {
        m.insert("name".to_string(), name.to_string());
    }
    for part in parts {
        if let Some((k, v)) = part.split_once('=') {
            m.insert(k.to_string(), v.to_string());
        }
    }
    m
}

/// Serialize tags to the `name;k1=v1;k2=v2` form; non-name tags sorted.
pub fn marshal_tags(tags: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = tags
        .iter()
        .filter(|(k, _)| k.as_str() != "name")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    parts.sort();
    let mut result = tags.get("name").cloned().unwrap_or_default();
    for part in parts {
        result.push(';');
        result.push_str(&part);
    }
    result
}

/// Build the marshalled key for `tag_keys` from the given series tags;
/// `default_name` fills the `name` tag when it is not in `tag_keys`.
pub fn format_key_from_tags(
    tags: &HashMap<String, String>,
    tag_keys: &[String],
    default_name: &str,
) -> String {
    let mut new_tags = HashMap::new();
    for key in tag_keys {
        new_tags.insert(key.clone(), tags.get(key).cloned().unwrap_or_default());
    }
    if !tag_keys.iter().any(|k| k == "name") {
        new_tags.insert("name".to_string(), default_name.to_string());
    }
    marshal_tags(&new_tags)
}

/// Resolve a possibly negative node index the way Python list indexing does.
/// Returns `None` for out-of-range indexes.
pub fn get_absolute_node_index(index: i64, size: usize) -> Option<usize> {
    let size = size as i64;
    let index = if index < 0 { size + index } else { index };
    if index < 0 || index >= size {
        None
    } else {
        Some(index as usize)
    }
}

/// Extract the metric path buried in a display name: parse the name and
/// descend into function calls until the first metric expression.
pub fn get_path_from_name(s: &str) -> String {
    let mut expr = match parser::parse(s) {
        Ok(expr) => expr,
        Err(_) => return s.to_string(),
    };
    loop {
        match expr {
            Expr::Metric(me) => return me.query,
            Expr::Func(fe) => {
                for arg in &fe.args {
                    if let Expr::Metric(me) = &arg.expr {
                        return me.query.clone();
                    }
                }
                match fe.args.into_iter().next() {
                    Some(arg) => expr = arg.expr,
                    None => return s.to_string(),
                }
            }
            Expr::Str(se) => return se.s,
            Expr::Number(ne) => return parser::format_float(ne.n),
            Expr::Bool(be) => return if be.b { "true".into() } else { "false".into() },
            Expr::None(_) => return s.to_string(),
        }
    }
}

/// Compose a name from path nodes (number exprs select dot-separated path
/// parts, string exprs select tag values), dot-joined.
pub fn get_name_from_nodes(name: &str, tags: &HashMap<String, String>, nodes: &[Expr]) -> String {
    if nodes.is_empty() {
        return String::new();
    }
    let path = get_path_from_name(name);
    let parts: Vec<&str> = path.split('.').collect();
    let mut dst_parts: Vec<&str> = Vec::new();
    for node in nodes {
        match node {
            Expr::Number(ne) => {
                if let Some(n) = get_absolute_node_index(ne.n as i64, parts.len()) {
                    dst_parts.push(parts[n]);
                }
            }
            Expr::Str(se) => {
                if let Some(v) = tags.get(&se.s) {
                    if !v.is_empty() {
                        dst_parts.push(v);
                    }
                }
            }
            _ => {}
        }
    }
    dst_parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NumberExpr, StringExpr};

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 120_000,
            end_time: 210_000,
            storage_step: 30_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    #[test]
    fn test_unmarshal_marshal_tags() {
        let tags = unmarshal_tags("foo.bar;baz=aa;x=y");
        assert_eq!(tags.get("name").unwrap(), "foo.bar");
        assert_eq!(tags.get("baz").unwrap(), "aa");
        assert_eq!(tags.get("x").unwrap(), "y");
        assert_eq!(marshal_tags(&tags), "foo.bar;baz=aa;x=y");
    }

    #[test]
    fn test_consolidate_averages_by_default() {
        let mut s = Series::from_name("foo");
        s.timestamps = vec![120_000, 150_000, 180_000];
        s.values = vec![1.0, 2.0, 3.0];
        s.step = 30_000;
        s.consolidate(&test_config(), 45_000);
        assert_eq!(s.timestamps, vec![120_000, 165_000]);
        assert_eq!(s.values, vec![1.5, 3.0]);
        assert_eq!(s.step, 45_000);
    }

    #[test]
    fn test_summarize_jitter_boundary() {
        // Sample 1999ms before the second interval start is pulled in;
        // 2001ms before is not.
        for (offset, pulled) in [(1_999i64, true), (2_000, true), (2_001, false)] {
            let mut s = Series::from_name("foo");
            s.timestamps = vec![60_000 - offset];
            s.values = vec![42.0];
            s.step = 30_000;
            s.summarize(AGGR_AVG, 0, 120_000, 60_000, 0.0);
            assert_eq!(s.timestamps, vec![0, 60_000]);
            // The sample always lands in the first interval; the second
            // interval sees it only via the jitter pull-in.
            assert_eq!(s.values[0], 42.0);
            if pulled {
                assert_eq!(s.values[1], 42.0, "offset {}", offset);
            } else {
                assert!(s.values[1].is_nan(), "offset {}", offset);
            }
        }
    }

    #[test]
    fn test_get_absolute_node_index() {
        assert_eq!(get_absolute_node_index(0, 3), Some(0));
        assert_eq!(get_absolute_node_index(-1, 3), Some(2));
        assert_eq!(get_absolute_node_index(3, 3), None);
        assert_eq!(get_absolute_node_index(-4, 3), None);
    }

    #[test]
    fn test_get_path_from_name() {
        assert_eq!(get_path_from_name("foo.bar"), "foo.bar");
        assert_eq!(get_path_from_name("sumSeries(foo.bar)"), "foo.bar");
        assert_eq!(
            get_path_from_name("scale(absolute(foo.baz),2)"),
            "foo.baz"
        );
        assert_eq!(get_path_from_name("123..!not-parseable("), "123..!not-parseable(");
    }

    #[test]
    fn test_get_name_from_nodes() {
        let mut tags = unmarshal_tags("foo.bar.baz");
        tags.insert("dc".to_string(), "east".to_string());
        let nodes = vec![
            Expr::Number(NumberExpr { n: 0.0 }),
            Expr::Number(NumberExpr { n: -1.0 }),
            Expr::Str(StringExpr { s: "dc".into() }),
        ];
        assert_eq!(get_name_from_nodes("foo.bar.baz", &tags, &nodes), "foo.baz.east");
    }
}
