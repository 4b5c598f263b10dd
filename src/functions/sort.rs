//! Series ordering
//!
//! The sortBy family collects the whole series list, ranks each series by
//! an aggregate of its values (or by name) and re-emits them in order.

use std::sync::Arc;

use crate::aggr::AggrFunc;
use crate::error::Result;
use crate::eval::config::EvalConfig;
use crate::eval::series::Series;
use crate::eval::stream::{
    concurrent_map, drain_all_series, multi_series, serial_map, SeriesStreamBox,
};
use crate::eval::Evaluator;
use crate::functions::args::{eval_series_list, get_optional_bool, get_optional_string};
use crate::functions::{check_arg_count, shared};
use crate::parser::{Expr, FuncExpr};

pub(crate) fn sort_by(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let func_name = get_optional_string(&fe.args, "func", 1, "average")?;
    let reverse = get_optional_bool(&fe.args, "reverse", 2, false)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    sort_by_generic(fe, stream, &func_name, reverse)
}

pub(crate) fn sort_by_maxima(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    sort_by_generic(fe, stream, "max", true)
}

pub(crate) fn sort_by_minima(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    // Series that never rise above zero are dropped before ranking.
    let filtered = concurrent_map(
        stream,
        Arc::new(move |s: Series| {
            let max = AggrFunc::Max.call(&s.values);
            if max.is_nan() || max <= 0.0 {
                return Ok(None);
            }
            Ok(Some(s))
        }),
    );
    sort_by_generic(fe, filtered, "min", false)
}

pub(crate) fn sort_by_total(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 1)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    sort_by_generic(fe, stream, "sum", true)
}

fn sort_by_generic(
    fe: &FuncExpr,
    mut stream: SeriesStreamBox,
    func_name: &str,
    reverse: bool,
) -> Result<SeriesStreamBox> {
    let aggr_func = match AggrFunc::by_name(func_name) {
        Ok(f) => f,
        Err(err) => {
            let _ = drain_all_series(stream.as_mut());
            return Err(err);
        }
    };
    let sws = shared(Vec::new());
    let sws_copy = Arc::clone(&sws);
    let fe_copy = fe.clone();
    let mut wrapped = concurrent_map(
        stream,
        Arc::new(move |mut s: Series| {
            let mut v = aggr_func.call(&s.values);
            if v.is_nan() {
                v = f64::NEG_INFINITY;
            }
            s.expr = Expr::Func(fe_copy.clone());
            sws_copy.lock().push((v, s));
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let mut sws = std::mem::take(&mut *sws.lock());
    sws.sort_by(|x, y| {
        let (mut left, mut right) = (x.0, y.0);
        if reverse {
            std::mem::swap(&mut left, &mut right);
        }
        left.total_cmp(&right)
    });
    Ok(multi_series(sws.into_iter().map(|(_, s)| s).collect()))
}

pub(crate) fn sort_by_name(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    fe: &FuncExpr,
) -> Result<SeriesStreamBox> {
    check_arg_count(fe, 1, 3)?;
    let natural = get_optional_bool(&fe.args, "natural", 1, false)?;
    let reverse = get_optional_bool(&fe.args, "reverse", 2, false)?;
    let stream = eval_series_list(ev, ec, &fe.args, "seriesList", 0)?;
    let collected = shared(Vec::new());
    let collected_copy = Arc::clone(&collected);
    let fe_copy = fe.clone();
    let mut wrapped = serial_map(
        stream,
        Arc::new(move |mut s: Series| {
            s.expr = Expr::Func(fe_copy.clone());
            collected_copy.lock().push(s);
            Ok(None)
        }),
    );
    drain_all_series(wrapped.as_mut())?;
    drop(wrapped);
    let mut ss = std::mem::take(&mut *collected.lock());
    ss.sort_by(|x, y| {
        let (mut left, mut right) = (x.name.as_str(), y.name.as_str());
        if reverse {
            std::mem::swap(&mut left, &mut right);
        }
        if natural {
            if natural_less(left, right) {
                std::cmp::Ordering::Less
            } else if natural_less(right, left) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        } else {
            left.cmp(right)
        }
    });
    Ok(multi_series(ss))
}

/// Natural string order: runs of digits compare numerically, everything
/// else byte-wise, so `server2` sorts before `server10`.
fn natural_less(a: &str, b: &str) -> bool {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();
    loop {
        match (a.first(), b.first()) {
            (None, None) => return false,
            (None, Some(_)) => return true,
            (Some(_), None) => return false,
            (Some(&ca), Some(&cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let (na, rest_a) = split_leading_number(a);
                    let (nb, rest_b) = split_leading_number(b);
                    if na != nb {
                        return na < nb;
                    }
                    a = rest_a;
                    b = rest_b;
                } else {
                    if ca != cb {
                        return ca < cb;
                    }
                    a = &a[1..];
                    b = &b[1..];
                }
            }
        }
    }
}

fn split_leading_number(s: &[u8]) -> (u64, &[u8]) {
    let mut n = 0u64;
    let mut i = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        n = n.saturating_mul(10).saturating_add((s[i] - b'0') as u64);
        i += 1;
    }
    (n, &s[i..])
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

    fn names(ss: &[Series]) -> Vec<&str> {
        ss.iter().map(|s| s.name.as_str()).collect()
    }

    fn three_series() -> MemorySource {
        let mut source = MemorySource::new();
        source.add_series_over("foo.a", 0, 180_000, 60_000, &[5.0]);
        source.add_series_over("foo.b", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("foo.c", 0, 180_000, 60_000, &[3.0]);
        source
    }

    #[test]
    fn test_sort_by_default_ascending() {
        let ss = eval(three_series(), "sortBy(foo.*)");
        assert_eq!(names(&ss), vec!["foo.b", "foo.c", "foo.a"]);
    }

    #[test]
    fn test_sort_by_reverse() {
        let ss = eval(three_series(), "sortBy(foo.*,'max',true)");
        assert_eq!(names(&ss), vec!["foo.a", "foo.c", "foo.b"]);
    }

    #[test]
    fn test_sort_by_total_is_descending() {
        let ss = eval(three_series(), "sortByTotal(foo.*)");
        assert_eq!(names(&ss), vec!["foo.a", "foo.c", "foo.b"]);
    }

    #[test]
    fn test_sort_by_maxima() {
        let ss = eval(three_series(), "sortByMaxima(foo.*)");
        assert_eq!(names(&ss), vec!["foo.a", "foo.c", "foo.b"]);
    }

    #[test]
    fn test_sort_by_minima_drops_non_positive() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.a", 0, 180_000, 60_000, &[4.0]);
        source.add_series_over("foo.b", 0, 180_000, 60_000, &[-1.0]);
        source.add_series_over("foo.c", 0, 180_000, 60_000, &[2.0]);
        let ss = eval(source, "sortByMinima(foo.*)");
        assert_eq!(names(&ss), vec!["foo.c", "foo.a"]);
    }

    #[test]
    fn test_sort_by_nan_sorts_first() {
        let mut source = three_series();
        source.add_series_over("foo.d", 0, 180_000, 60_000, &[]);
        let ss = eval(source, "sortBy(foo.*)");
        assert_eq!(names(&ss)[0], "foo.d");
    }

    #[test]
    fn test_sort_by_name_lexicographic_and_natural() {
        let mut source = MemorySource::new();
        source.add_series_over("srv.server1", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("srv.server10", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("srv.server2", 0, 180_000, 60_000, &[1.0]);
        let ss = eval(source, "sortByName(srv.*)");
        assert_eq!(
            names(&ss),
            vec!["srv.server1", "srv.server10", "srv.server2"]
        );
        let mut source = MemorySource::new();
        source.add_series_over("srv.server1", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("srv.server10", 0, 180_000, 60_000, &[1.0]);
        source.add_series_over("srv.server2", 0, 180_000, 60_000, &[1.0]);
        let ss = eval(source, "sortByName(srv.*,true)");
        assert_eq!(
            names(&ss),
            vec!["srv.server1", "srv.server2", "srv.server10"]
        );
    }

    #[test]
    fn test_sort_by_name_reverse() {
        let ss = eval(three_series(), "sortByName(foo.*,false,true)");
        assert_eq!(names(&ss), vec!["foo.c", "foo.b", "foo.a"]);
    }

    #[test]
    fn test_natural_less() {
        assert!(natural_less("a2", "a10"));
        assert!(!natural_less("a10", "a2"));
        assert!(natural_less("a", "b"));
        assert!(natural_less("a1b", "a1c"));
        assert!(!natural_less("a1", "a1"));
        assert!(natural_less("a1", "a1b"));
    }
}
