//! Storage seam
//!
//! Evaluation reaches storage through the [`SeriesSource`] trait only. A
//! metric expression's raw Graphite selector is handed to the source
//! verbatim; the source answers with a lazy stream of matching series.
//! This module also carries the glob-to-regexp translation used for name
//! matching and an in-memory source for tests.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::series::Series;
use crate::eval::stream::{multi_series, SeriesStream, SeriesStreamBox};

/// Provider of raw series for metric expressions. `search` receives the
/// Graphite selector text exactly as written in the query.
pub trait SeriesSource: Send + Sync {
    /// Stream all series matching `query` within `[ec.start_time, ec.end_time)`.
    fn search(&self, ec: &EvalConfig, query: &str) -> Result<SeriesStreamBox>;

    /// Stream all series whose tags match every filter, for seriesByTag.
    fn search_by_tags(&self, ec: &EvalConfig, filters: &[TagFilter]) -> Result<SeriesStreamBox>;
}

// ============================================================================
// Tag filters
// ============================================================================

/// One parsed seriesByTag tag expression: `key=value`, `key!=value`,
/// `key=~regex` or `key!=~regex`. A missing tag matches as the empty
/// string, so `other=` selects series without the `other` tag.
pub struct TagFilter {
    key: String,
    value: String,
    re: Option<Regex>,
    negate: bool,
}

impl TagFilter {
    /// Parse a single tag expression. Regexps are compiled anchored, the
    /// way Graphite matches them.
    pub fn parse(expr: &str) -> Result<TagFilter> {
        let eq = expr.find('=').ok_or_else(|| {
            Error::Argument(format!("missing `=` in tag expression {:?}", expr))
        })?;
        let (mut key, mut rest) = (&expr[..eq], &expr[eq + 1..]);
        let negate = key.ends_with('!');
        if negate {
            key = &key[..key.len() - 1];
        }
        if key.is_empty() {
            return Err(Error::Argument(format!(
                "missing tag name in tag expression {:?}",
                expr
            )));
        }
        let is_regexp = rest.starts_with('~');
        if is_regexp {
            rest = &rest[1..];
        }
        let re = if is_regexp {
            let anchored = format!("^(?:{})$", rest);
            Some(Regex::new(&anchored).map_err(|err| {
                Error::Argument(format!(
                    "cannot compile regexp in tag expression {:?}: {}",
                    expr, err
                ))
            })?)
        } else {
            None
        };
        Ok(TagFilter {
            key: key.to_string(),
            value: rest.to_string(),
            re,
            negate,
        })
    }

    /// Exact-match filter, used for enforced tag filters from the config.
    pub fn exact(key: &str, value: &str) -> TagFilter {
        TagFilter {
            key: key.to_string(),
            value: value.to_string(),
            re: None,
            negate: false,
        }
    }

    /// Whether `tags` passes this filter.
    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        let tag_value = tags.get(&self.key).map(String::as_str).unwrap_or("");
        let matched = match &self.re {
            Some(re) => re.is_match(tag_value),
            None => tag_value == self.value,
        };
        matched != self.negate
    }
}

// ============================================================================
// Glob translation
// ============================================================================

/// Default capacity for [`RegexpCache`].
pub const DEFAULT_REGEXP_CACHE_SIZE: usize = 10_000;

/// Translate a Graphite glob (`*`, `{a,b}`, `[...]`) into an anchored
/// regexp string. `*` never crosses `delimiter`; a query not ending with
/// the delimiter also matches names with one trailing delimiter.
pub fn glob_to_regexp_string(query: &str, delimiter: char) -> String {
    let quoted_delimiter = regex::escape(&delimiter.to_string());
    let till_next_delimiter = format!("[^{}]*", quoted_delimiter);
    let mut s = String::with_capacity(query.len() + 16);
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < query.len() {
        match bytes[i] {
            b'*' => {
                s.push_str(&till_next_delimiter);
                i += 1;
            }
            b'{' => match query[i + 1..].find('}') {
                None => {
                    s.push_str(&regex::escape(&query[i..]));
                    i = query.len();
                }
                Some(n) => {
                    let opts: Vec<String> = query[i + 1..i + 1 + n]
                        .split(',')
                        .map(regex::escape)
                        .collect();
                    s.push_str("(?:");
                    s.push_str(&opts.join("|"));
                    s.push(')');
                    i += n + 2;
                }
            },
            b'[' => match query[i..].find(']') {
                None => {
                    s.push_str(&regex::escape(&query[i..]));
                    i = query.len();
                }
                Some(n) => {
                    // Character classes pass through untranslated.
                    s.push_str(&query[i..i + n + 1]);
                    i += n + 1;
                }
            },
            _ => {
                let ch_len = query[i..]
                    .chars()
                    .next()
                    .map_or(1, |c| c.len_utf8());
                s.push_str(&regex::escape(&query[i..i + ch_len]));
                i += ch_len;
            }
        }
    }
    if !s.ends_with(&quoted_delimiter) {
        s.push_str(&quoted_delimiter);
        s.push('?');
    }
    format!("^(?:{})$", s)
}

/// Bounded cache of compiled glob regexps, keyed by query and delimiter.
/// Compilation failures are cached too.
pub struct RegexpCache {
    cache: Mutex<LruCache<(String, char), std::result::Result<Regex, Error>>>,
}

impl RegexpCache {
    /// Create a cache holding up to `capacity` compiled regexps.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        RegexpCache {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compile (or fetch the cached compilation of) the regexp for `query`.
    pub fn get(&self, query: &str, delimiter: char) -> Result<Regex> {
        let key = (query.to_string(), delimiter);
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&key) {
            return entry.clone();
        }
        let rs = glob_to_regexp_string(query, delimiter);
        let entry = Regex::new(&rs).map_err(|err| {
            Error::Execution(format!(
                "cannot convert query {:?} to regexp: {}",
                query, err
            ))
        });
        cache.put(key, entry.clone());
        entry
    }
}

impl Default for RegexpCache {
    fn default() -> Self {
        RegexpCache::new(DEFAULT_REGEXP_CACHE_SIZE)
    }
}

// ============================================================================
// Storage proxy stream
// ============================================================================

/// Wrapper around a storage-backed stream that logs when the consumer drops
/// it before exhaustion, since every transform is expected to drain its
/// upstream even on error paths.
pub struct StorageProxyStream {
    inner: SeriesStreamBox,
    query: String,
    exhausted: bool,
}

impl StorageProxyStream {
    /// Wrap `inner` carrying the originating selector text for diagnostics.
    pub fn new(inner: SeriesStreamBox, query: String) -> Self {
        StorageProxyStream {
            inner,
            query,
            exhausted: false,
        }
    }
}

impl SeriesStream for StorageProxyStream {
    fn next(&mut self) -> Result<Option<Series>> {
        match self.inner.next() {
            Ok(Some(s)) => Ok(Some(s)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(err) => {
                self.exhausted = true;
                Err(err)
            }
        }
    }
}

impl Drop for StorageProxyStream {
    fn drop(&mut self) {
        if !self.exhausted {
            warn!(query = %self.query, "series stream dropped before being drained");
        }
    }
}

// ============================================================================
// In-memory source
// ============================================================================

/// Source backed by a fixed series list; selectors match by glob against
/// series names. Used in tests and as a reference implementation.
pub struct MemorySource {
    series: Vec<StoredSeries>,
    regexp_cache: Arc<RegexpCache>,
}

struct StoredSeries {
    name: String,
    tags: HashMap<String, String>,
    timestamps: Vec<i64>,
    values: Vec<f64>,
    step: i64,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        MemorySource {
            series: Vec::new(),
            regexp_cache: Arc::new(RegexpCache::default()),
        }
    }

    /// Register a series under `name` with the given samples.
    pub fn add_series(&mut self, name: &str, step: i64, timestamps: Vec<i64>, values: Vec<f64>) {
        assert_eq!(
            timestamps.len(),
            values.len(),
            "BUG: timestamps and values must have the same length"
        );
        self.series.push(StoredSeries {
            name: name.to_string(),
            tags: crate::eval::series::unmarshal_tags(name),
            timestamps,
            values,
            step,
        });
    }

    /// Register a series whose samples cover `[start, end)` at `step`
    /// spacing, cycling through `values`.
    pub fn add_series_over(&mut self, name: &str, start: i64, end: i64, step: i64, values: &[f64]) {
        let mut timestamps = Vec::new();
        let mut vs = Vec::new();
        let mut ts = start;
        let mut i = 0usize;
        while ts < end {
            timestamps.push(ts);
            vs.push(if values.is_empty() {
                f64::NAN
            } else {
                values[i % values.len()]
            });
            ts += step;
            i += 1;
        }
        self.add_series(name, step, timestamps, vs);
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        MemorySource::new()
    }
}

impl SeriesSource for MemorySource {
    fn search(&self, ec: &EvalConfig, query: &str) -> Result<SeriesStreamBox> {
        let re = self.regexp_cache.get(query, '.')?;
        let etfs: Vec<TagFilter> = ec
            .etfs
            .iter()
            .map(|(key, value)| TagFilter::exact(key, value))
            .collect();
        let mut matched = Vec::new();
        for stored in &self.series {
            if !re.is_match(&stored.name) {
                continue;
            }
            if !etfs.iter().all(|f| f.matches(&stored.tags)) {
                continue;
            }
            let mut s = Series::from_name(&stored.name);
            s.tags = stored.tags.clone();
            s.step = stored.step;
            s.path_expression = query.to_string();
            for (&ts, &v) in stored.timestamps.iter().zip(stored.values.iter()) {
                if ts >= ec.start_time && ts < ec.end_time {
                    s.timestamps.push(ts);
                    s.values.push(v);
                }
            }
            matched.push(s);
        }
        Ok(Box::new(StorageProxyStream::new(
            multi_series(matched),
            query.to_string(),
        )))
    }

    fn search_by_tags(&self, ec: &EvalConfig, filters: &[TagFilter]) -> Result<SeriesStreamBox> {
        let mut matched = Vec::new();
        for stored in &self.series {
            if !filters.iter().all(|f| f.matches(&stored.tags)) {
                continue;
            }
            let mut s = Series::from_name(&stored.name);
            s.tags = stored.tags.clone();
            s.step = stored.step;
            s.path_expression = stored.name.clone();
            for (&ts, &v) in stored.timestamps.iter().zip(stored.values.iter()) {
                if ts >= ec.start_time && ts < ec.end_time {
                    s.timestamps.push(ts);
                    s.values.push(v);
                }
            }
            matched.push(s);
        }
        Ok(Box::new(StorageProxyStream::new(
            multi_series(matched),
            "seriesByTag".to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::stream::fetch_all_series;

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 0,
            end_time: 120_000,
            storage_step: 30_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    #[test]
    fn test_glob_to_regexp_string() {
        assert_eq!(glob_to_regexp_string("foo.bar", '.'), r"^(?:foo\.bar\.?)$");
        assert_eq!(
            glob_to_regexp_string("foo.*", '.'),
            r"^(?:foo\.[^\.]*\.?)$"
        );
        assert_eq!(
            glob_to_regexp_string("foo.{bar,baz}", '.'),
            r"^(?:foo\.(?:bar|baz)\.?)$"
        );
        assert_eq!(
            glob_to_regexp_string("foo.ba[rz]", '.'),
            r"^(?:foo\.ba[rz]\.?)$"
        );
    }

    #[test]
    fn test_glob_matching() {
        let cache = RegexpCache::new(16);
        let re = cache.get("foo.*.baz", '.').unwrap();
        assert!(re.is_match("foo.bar.baz"));
        assert!(re.is_match("foo.x.baz"));
        assert!(!re.is_match("foo.bar.qux.baz"));
        assert!(!re.is_match("foo.baz"));

        let re = cache.get("foo.{bar,qux}", '.').unwrap();
        assert!(re.is_match("foo.bar"));
        assert!(re.is_match("foo.qux"));
        assert!(!re.is_match("foo.baz"));
    }

    #[test]
    fn test_glob_star_does_not_cross_delimiter() {
        let cache = RegexpCache::new(16);
        let re = cache.get("*", '.').unwrap();
        assert!(re.is_match("foo"));
        assert!(!re.is_match("foo.bar"));
    }

    #[test]
    fn test_memory_source_matches_and_slices() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 240_000, 30_000, &[1.0]);
        source.add_series_over("foo.baz", 0, 240_000, 30_000, &[2.0]);
        source.add_series_over("other", 0, 240_000, 30_000, &[3.0]);
        let ec = test_config();
        let mut stream = source.search(&ec, "foo.*").unwrap();
        let mut all = fetch_all_series(stream.as_mut()).unwrap();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "foo.bar");
        assert_eq!(all[0].path_expression, "foo.*");
        // Samples outside [start_time, end_time) are not returned.
        assert_eq!(all[0].timestamps.len(), 4);
        assert_eq!(*all[0].timestamps.last().unwrap(), 90_000);
    }

    #[test]
    fn test_memory_source_applies_enforced_tag_filters() {
        let mut source = MemorySource::new();
        source.add_series_over("cpu.total;env=prod", 0, 240_000, 30_000, &[1.0]);
        source.add_series_over("cpu.total;env=dev", 0, 240_000, 30_000, &[2.0]);
        let mut ec = test_config();
        ec.etfs = vec![("env".to_string(), "prod".to_string())];
        let mut stream = source.search(&ec, "cpu.*").unwrap();
        let all = fetch_all_series(stream.as_mut()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "cpu.total;env=prod");
    }

    #[test]
    fn test_memory_source_no_match_is_empty() {
        let source = MemorySource::new();
        let ec = test_config();
        let mut stream = source.search(&ec, "nope.*").unwrap();
        assert!(stream.next().unwrap().is_none());
    }
}
