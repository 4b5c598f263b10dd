//! Every transform must drain its upstream even when it fails, so no
//! storage cursor is left open. These tests watch the source side through
//! a tracking wrapper and assert exhaustion on error paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use graphite_query::eval::stream::{SeriesStream, SeriesStreamBox};
use graphite_query::{EvalConfig, Evaluator, MemorySource, Series, SeriesSource, TagFilter};

fn test_config() -> EvalConfig {
    EvalConfig {
        start_time: 0,
        end_time: 300_000,
        storage_step: 60_000,
        deadline: None,
        current_time: 150_000_000,
        x_files_factor: 0.0,
        etfs: Vec::new(),
        original_query: String::new(),
    }
}

struct TrackingStream {
    inner: SeriesStreamBox,
    exhausted: Arc<AtomicBool>,
}

impl SeriesStream for TrackingStream {
    fn next(&mut self) -> graphite_query::Result<Option<Series>> {
        match self.inner.next() {
            Ok(Some(s)) => Ok(Some(s)),
            done => {
                self.exhausted.store(true, Ordering::SeqCst);
                done
            }
        }
    }
}

/// Source wrapper recording, per issued stream, whether the consumer
/// pulled it to exhaustion.
struct TrackingSource {
    inner: MemorySource,
    streams: Mutex<Vec<Arc<AtomicBool>>>,
}

impl TrackingSource {
    fn new(inner: MemorySource) -> Self {
        TrackingSource {
            inner,
            streams: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, stream: SeriesStreamBox) -> SeriesStreamBox {
        let exhausted = Arc::new(AtomicBool::new(false));
        self.streams.lock().push(Arc::clone(&exhausted));
        Box::new(TrackingStream { inner: stream, exhausted })
    }

    fn issued(&self) -> usize {
        self.streams.lock().len()
    }

    fn all_exhausted(&self) -> bool {
        self.streams.lock().iter().all(|e| e.load(Ordering::SeqCst))
    }
}

impl SeriesSource for TrackingSource {
    fn search(&self, ec: &EvalConfig, query: &str) -> graphite_query::Result<SeriesStreamBox> {
        self.inner.search(ec, query).map(|s| self.track(s))
    }

    fn search_by_tags(
        &self,
        ec: &EvalConfig,
        filters: &[TagFilter],
    ) -> graphite_query::Result<SeriesStreamBox> {
        self.inner.search_by_tags(ec, filters).map(|s| self.track(s))
    }
}

fn three_series_source() -> MemorySource {
    let mut source = MemorySource::new();
    source.add_series_over("foo.a", 0, 300_000, 60_000, &[1.0]);
    source.add_series_over("foo.b", 0, 300_000, 60_000, &[2.0]);
    source.add_series_over("foo.c", 0, 300_000, 60_000, &[3.0]);
    source
}

#[test]
fn test_bad_aggr_name_drains_source_stream() {
    let source = Arc::new(TrackingSource::new(three_series_source()));
    let ev = Evaluator::new(Arc::clone(&source) as Arc<dyn SeriesSource>);
    let ec = test_config();
    assert!(ev.exec_expr(&ec, "consolidateBy(foo.*,'nosuch')").is_err());
    assert_eq!(source.issued(), 1);
    assert!(source.all_exhausted());
}

#[test]
fn test_sort_by_bad_func_drains_source_stream() {
    let source = Arc::new(TrackingSource::new(three_series_source()));
    let ev = Evaluator::new(Arc::clone(&source) as Arc<dyn SeriesSource>);
    let ec = test_config();
    assert!(ev.exec_expr(&ec, "sortBy(foo.*,'nosuch')").is_err());
    assert_eq!(source.issued(), 1);
    assert!(source.all_exhausted());
}

#[test]
fn test_group_drains_siblings_when_one_arg_fails() {
    let source = Arc::new(TrackingSource::new(three_series_source()));
    let ev = Evaluator::new(Arc::clone(&source) as Arc<dyn SeriesSource>);
    let ec = test_config();
    let result = ev.exec_expr(&ec, "group(foo.*, consolidateBy(foo.*,'nosuch'))");
    assert!(result.is_err());
    // Both the failing arg's stream and the already-evaluated sibling.
    assert_eq!(source.issued(), 2);
    assert!(source.all_exhausted());
}

#[test]
fn test_successful_query_exhausts_every_stream() {
    let source = Arc::new(TrackingSource::new(three_series_source()));
    let ev = Evaluator::new(Arc::clone(&source) as Arc<dyn SeriesSource>);
    let ec = test_config();
    let mut stream = ev
        .exec_expr(&ec, "sumSeries(foo.*, sortByName(foo.*))")
        .unwrap();
    let all = graphite_query::eval::stream::fetch_all_series(stream.as_mut()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(source.issued(), 2);
    assert!(source.all_exhausted());
}

#[test]
fn test_mid_stream_filter_error_drains_source() {
    let source = Arc::new(TrackingSource::new(three_series_source()));
    let ev = Evaluator::new(Arc::clone(&source) as Arc<dyn SeriesSource>);
    let ec = test_config();
    // The regexp is validated up front, so the error fires before the
    // series stream is built; the source must not be touched at all.
    assert!(ev.exec_expr(&ec, "grep(foo.*,'[')").is_err());
    assert_eq!(source.issued(), 0);
}
