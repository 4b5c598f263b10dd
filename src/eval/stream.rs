//! Lazy series streams and their composition wrappers
//!
//! A [`SeriesStream`] is the pull-based handle every transform consumes and
//! produces. Two mapping strategies compose over it:
//! - [`serial_map`]: order-preserving, one series at a time; required when
//!   cross-series sequential state matters.
//! - [`concurrent_map`]: fans series out to a fixed-size worker pool for
//!   CPU-bound per-series transforms; output order is unspecified.
//!
//! Both guarantee that a surfaced error implies the upstream was fully
//! drained, so no producer thread is left blocked.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::aggr::is_serial_func;
use crate::error::{Error, Result};
use crate::eval::series::Series;
use crate::parser::Expr;

/// Pull-based iterator over series. `Ok(None)` signals clean end-of-stream;
/// any error implies the upstream has already been drained.
pub trait SeriesStream: Send {
    /// Pull the next series.
    fn next(&mut self) -> Result<Option<Series>>;
}

/// Boxed stream handle flowing between transforms.
pub type SeriesStreamBox = Box<dyn SeriesStream>;

/// Per-series mapping applied by the composition wrappers. Returning
/// `Ok(None)` filters the series out.
pub type SeriesMapFn = Arc<dyn Fn(Series) -> Result<Option<Series>> + Send + Sync>;

// ============================================================================
// Materialized streams
// ============================================================================

/// Stream yielding an already-materialized list of series.
pub struct MultiSeries {
    series: VecDeque<Series>,
}

impl SeriesStream for MultiSeries {
    fn next(&mut self) -> Result<Option<Series>> {
        Ok(self.series.pop_front())
    }
}

/// Stream over a materialized series list.
pub fn multi_series(series: Vec<Series>) -> SeriesStreamBox {
    Box::new(MultiSeries {
        series: series.into(),
    })
}

/// Stream yielding exactly one series.
pub fn single_series(s: Series) -> SeriesStreamBox {
    multi_series(vec![s])
}

/// Stream yielding nothing.
pub fn zero_series() -> SeriesStreamBox {
    multi_series(Vec::new())
}

// ============================================================================
// Terminal consumers
// ============================================================================

/// Pull `stream` to exhaustion and collect every series.
pub fn fetch_all_series(stream: &mut dyn SeriesStream) -> Result<Vec<Series>> {
    let mut all = Vec::new();
    while let Some(s) = stream.next()? {
        all.push(s);
    }
    Ok(all)
}

/// Pull `stream` to exhaustion, discarding series. Returns the count.
pub fn drain_all_series(stream: &mut dyn SeriesStream) -> Result<usize> {
    let mut count = 0;
    while stream.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

// ============================================================================
// Step lookahead
// ============================================================================

struct Peeked {
    first: Option<Option<Series>>,
    inner: SeriesStreamBox,
}

impl SeriesStream for Peeked {
    fn next(&mut self) -> Result<Option<Series>> {
        if let Some(first) = self.first.take() {
            return Ok(first);
        }
        self.inner.next()
    }
}

/// Pull exactly one series to discover its step, transparently re-queueing
/// it for the real pass. Returns `default_step` for an empty stream.
pub fn peek_step(stream: &mut SeriesStreamBox, default_step: i64) -> Result<i64> {
    let first = stream.next()?;
    let step = first.as_ref().map_or(default_step, |s| s.step);
    let inner = std::mem::replace(stream, zero_series());
    *stream = Box::new(Peeked {
        first: Some(first),
        inner,
    });
    Ok(step)
}

// ============================================================================
// Serial wrapper
// ============================================================================

struct SerialMap {
    inner: SeriesStreamBox,
    f: SeriesMapFn,
}

impl SeriesStream for SerialMap {
    fn next(&mut self) -> Result<Option<Series>> {
        loop {
            let s = match self.inner.next()? {
                Some(s) => s,
                None => return Ok(None),
            };
            match (self.f)(s) {
                Ok(Some(s_new)) => return Ok(Some(s_new)),
                Ok(None) => continue,
                Err(err) => {
                    let _ = drain_all_series(self.inner.as_mut());
                    return Err(err);
                }
            }
        }
    }
}

/// Order-preserving wrapper: applies `f` to each series one at a time.
/// On error the upstream is drained before the error propagates.
pub fn serial_map(inner: SeriesStreamBox, f: SeriesMapFn) -> SeriesStreamBox {
    Box::new(SerialMap { inner, f })
}

// ============================================================================
// Concurrent wrapper
// ============================================================================

struct ConcurrentMap {
    result_rx: mpsc::Receiver<Result<Series>>,
    feeder_err: Arc<Mutex<Option<Error>>>,
    handles: Vec<thread::JoinHandle<()>>,
    finished: Option<Result<()>>,
}

impl ConcurrentMap {
    fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl SeriesStream for ConcurrentMap {
    fn next(&mut self) -> Result<Option<Series>> {
        if let Some(finished) = &self.finished {
            return finished.clone().map(|_| None);
        }
        loop {
            match self.result_rx.recv() {
                Ok(Ok(s)) => return Ok(Some(s)),
                Ok(Err(err)) => {
                    // Drain in-flight results before surfacing the error so
                    // no worker is left blocked on a full channel.
                    while self.result_rx.recv().is_ok() {}
                    self.join_all();
                    self.finished = Some(Err(err.clone()));
                    return Err(err);
                }
                Err(_) => {
                    // All workers finished; report the feeder error, if any.
                    self.join_all();
                    let result = match self.feeder_err.lock().take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                    self.finished = Some(result.clone());
                    return result.map(|_| None);
                }
            }
        }
    }
}

impl Drop for ConcurrentMap {
    fn drop(&mut self) {
        // Dropping the receiver makes pending worker sends fail, which in
        // turn unblocks the feeder; joining afterwards cannot deadlock.
        let (_dead_tx, dead_rx) = mpsc::sync_channel(1);
        drop(std::mem::replace(&mut self.result_rx, dead_rx));
        self.join_all();
    }
}

/// Worker-pool wrapper: applies `f` to series from `inner` on
/// `num_cpus::get()` threads. Output order is unspecified. The first error
/// suppresses further `f` invocations; remaining series are drained without
/// processing and the error surfaces only after all workers finish.
pub fn concurrent_map(mut inner: SeriesStreamBox, f: SeriesMapFn) -> SeriesStreamBox {
    let workers = num_cpus::get().max(1);
    let (series_tx, series_rx) = mpsc::sync_channel::<Series>(workers);
    let (result_tx, result_rx) = mpsc::sync_channel::<Result<Series>>(workers);
    let feeder_err = Arc::new(Mutex::new(None));
    let skip_processing = Arc::new(AtomicBool::new(false));
    let shared_rx = Arc::new(Mutex::new(series_rx));

    let mut handles = Vec::with_capacity(workers + 1);
    let feeder_err_clone = Arc::clone(&feeder_err);
    handles.push(thread::spawn(move || loop {
        match inner.next() {
            Ok(Some(s)) => {
                if series_tx.send(s).is_err() {
                    // All workers exited early; stop feeding.
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                *feeder_err_clone.lock() = Some(err);
                return;
            }
        }
    }));
    for _ in 0..workers {
        let shared_rx = Arc::clone(&shared_rx);
        let result_tx = result_tx.clone();
        let skip_processing = Arc::clone(&skip_processing);
        let f = Arc::clone(&f);
        handles.push(thread::spawn(move || loop {
            let s = {
                let rx = shared_rx.lock();
                rx.recv()
            };
            let s = match s {
                Ok(s) => s,
                Err(_) => return,
            };
            if skip_processing.load(Ordering::Acquire) {
                continue;
            }
            match f(s) {
                Ok(Some(s_new)) => {
                    if result_tx.send(Ok(s_new)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // Conserve CPU: drain the rest without calling f.
                    skip_processing.store(true, Ordering::Release);
                    if result_tx.send(Err(err)).is_err() {
                        return;
                    }
                }
            }
        }));
    }
    drop(result_tx);

    Box::new(ConcurrentMap {
        result_rx,
        feeder_err,
        handles,
        finished: None,
    })
}

/// Pick the wrapper for a per-series mapping: concurrent for CPU-bound
/// order-insensitive work, serial otherwise.
pub fn map_series(is_concurrent: bool, inner: SeriesStreamBox, f: SeriesMapFn) -> SeriesStreamBox {
    if is_concurrent {
        concurrent_map(inner, f)
    } else {
        serial_map(inner, f)
    }
}

/// Wrapper selection for feeding an aggregate function: order-sensitive
/// reducers (diff, pow, first, last, current) get the serial wrapper.
pub fn map_series_for_aggr_func(
    func_name: &str,
    inner: SeriesStreamBox,
    f: SeriesMapFn,
) -> SeriesStreamBox {
    map_series(!is_serial_func(func_name), inner, f)
}

// ============================================================================
// Stream concatenation
// ============================================================================

struct SeriesGroup {
    streams: VecDeque<SeriesStreamBox>,
    expr: Option<Expr>,
}

impl SeriesStream for SeriesGroup {
    fn next(&mut self) -> Result<Option<Series>> {
        loop {
            let stream = match self.streams.front_mut() {
                Some(stream) => stream,
                None => return Ok(None),
            };
            match stream.next() {
                Ok(Some(mut s)) => {
                    if let Some(expr) = &self.expr {
                        s.expr = expr.clone();
                    }
                    return Ok(Some(s));
                }
                Ok(None) => {
                    self.streams.pop_front();
                }
                Err(err) => {
                    // Drain the sibling streams before propagating.
                    self.streams.pop_front();
                    for sibling in self.streams.iter_mut() {
                        let _ = drain_all_series(sibling.as_mut());
                    }
                    self.streams.clear();
                    return Err(err);
                }
            }
        }
    }
}

/// Concatenate multiple streams in order. When `expr` is given, every
/// produced series gets it as its originating expression.
pub fn series_group(streams: Vec<SeriesStreamBox>, expr: Option<Expr>) -> SeriesStreamBox {
    Box::new(SeriesGroup {
        streams: streams.into(),
        expr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(names: &[&str]) -> Vec<Series> {
        names.iter().map(|name| Series::from_name(name)).collect()
    }

    struct FailAfter {
        remaining: usize,
        drained: Arc<AtomicBool>,
    }

    impl SeriesStream for FailAfter {
        fn next(&mut self) -> Result<Option<Series>> {
            if self.remaining == 0 {
                self.drained.store(true, Ordering::SeqCst);
                return Err(Error::Execution("boom".into()));
            }
            self.remaining -= 1;
            Ok(Some(Series::from_name("s")))
        }
    }

    #[test]
    fn test_multi_series_order() {
        let mut stream = multi_series(named(&["a", "b", "c"]));
        let all = fetch_all_series(stream.as_mut()).unwrap();
        let got: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_peek_step_requeues_first() {
        let mut s = Series::from_name("a");
        s.step = 13_000;
        let mut stream = multi_series(vec![s, Series::from_name("b")]);
        let step = peek_step(&mut stream, 30_000).unwrap();
        assert_eq!(step, 13_000);
        let all = fetch_all_series(stream.as_mut()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");
    }

    #[test]
    fn test_peek_step_empty_stream_uses_default() {
        let mut stream = zero_series();
        assert_eq!(peek_step(&mut stream, 30_000).unwrap(), 30_000);
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_serial_map_preserves_order_and_filters() {
        let inner = multi_series(named(&["a", "skip", "b"]));
        let mut mapped = serial_map(
            inner,
            Arc::new(|s: Series| {
                if s.name == "skip" {
                    Ok(None)
                } else {
                    Ok(Some(s))
                }
            }),
        );
        let all = fetch_all_series(mapped.as_mut()).unwrap();
        let got: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[test]
    fn test_serial_map_drains_on_error() {
        let drained = Arc::new(AtomicBool::new(false));
        let inner = Box::new(FailAfter {
            remaining: 3,
            drained: Arc::clone(&drained),
        });
        let mut mapped = serial_map(
            inner,
            Arc::new(|s: Series| {
                if s.name == "s" {
                    Err(Error::Execution("map failed".into()))
                } else {
                    Ok(Some(s))
                }
            }),
        );
        assert!(mapped.next().is_err());
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_map_value_results() {
        let series: Vec<Series> = (0..64)
            .map(|i| {
                let mut s = Series::from_name(&format!("s{}", i));
                s.values = vec![i as f64];
                s
            })
            .collect();
        let mut mapped = concurrent_map(
            multi_series(series),
            Arc::new(|mut s: Series| {
                s.values[0] *= 2.0;
                Ok(Some(s))
            }),
        );
        let mut all = fetch_all_series(mapped.as_mut()).unwrap();
        assert_eq!(all.len(), 64);
        all.sort_by(|a, b| a.values[0].partial_cmp(&b.values[0]).unwrap());
        for (i, s) in all.iter().enumerate() {
            assert_eq!(s.values[0], 2.0 * i as f64);
        }
    }

    #[test]
    fn test_concurrent_map_drop_unblocks_workers() {
        // Many more series than the channel holds, so workers are blocked
        // in send when the stream is dropped mid-consumption.
        let series: Vec<Series> = (0..512)
            .map(|i| Series::from_name(&format!("s{}", i)))
            .collect();
        let mut mapped = concurrent_map(multi_series(series), Arc::new(|s: Series| Ok(Some(s))));
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = mapped.next();
            drop(mapped);
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("dropping a partially consumed concurrent stream hung");
    }

    #[test]
    fn test_concurrent_map_surfaces_error_after_drain() {
        let inner = multi_series(named(&["a", "b", "c", "d"]));
        let mut mapped = concurrent_map(
            inner,
            Arc::new(|s: Series| {
                if s.name == "b" {
                    Err(Error::Execution("worker failed".into()))
                } else {
                    Ok(Some(s))
                }
            }),
        );
        let mut saw_error = false;
        loop {
            match mapped.next() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_concurrent_map_upstream_error() {
        let drained = Arc::new(AtomicBool::new(false));
        let inner = Box::new(FailAfter {
            remaining: 2,
            drained: Arc::clone(&drained),
        });
        let mut mapped = concurrent_map(inner, Arc::new(|s: Series| Ok(Some(s))));
        let mut result = Ok(());
        loop {
            match mapped.next() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_series_group_drains_siblings_on_error() {
        let drained = Arc::new(AtomicBool::new(false));
        let failing = Box::new(FailAfter {
            remaining: 0,
            drained: Arc::new(AtomicBool::new(false)),
        });
        struct CountingDrain {
            series: VecDeque<Series>,
            drained: Arc<AtomicBool>,
        }
        impl SeriesStream for CountingDrain {
            fn next(&mut self) -> Result<Option<Series>> {
                match self.series.pop_front() {
                    Some(s) => Ok(Some(s)),
                    None => {
                        self.drained.store(true, Ordering::SeqCst);
                        Ok(None)
                    }
                }
            }
        }
        let sibling = Box::new(CountingDrain {
            series: named(&["x", "y"]).into(),
            drained: Arc::clone(&drained),
        });
        let mut group = series_group(vec![failing, sibling], None);
        assert!(group.next().is_err());
        assert!(drained.load(Ordering::SeqCst), "sibling must be drained");
        assert!(group.next().unwrap().is_none());
    }
}
