//! Query evaluation
//!
//! [`Evaluator`] walks a parsed expression tree and produces a lazy
//! [`SeriesStream`](stream::SeriesStream). Metric expressions go to the
//! injected [`SeriesSource`](source::SeriesSource); function expressions
//! dispatch into the transform library.

pub mod config;
pub mod series;
pub mod source;
pub mod stream;

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::source::SeriesSource;
use crate::eval::stream::{serial_map, SeriesStreamBox};
use crate::functions;
use crate::parser::{self, Expr};

/// Expression evaluator bound to a storage source. Cheap to share via
/// `Arc`; concurrent transforms capture clones of it.
pub struct Evaluator {
    source: Arc<dyn SeriesSource>,
}

impl Evaluator {
    /// Create an evaluator reading series from `source`.
    pub fn new(source: Arc<dyn SeriesSource>) -> Arc<Self> {
        Arc::new(Evaluator { source })
    }

    /// Parse and evaluate a query string. Also used internally by
    /// transforms that build query strings from data.
    pub fn exec_expr(self: &Arc<Self>, ec: &EvalConfig, query: &str) -> Result<SeriesStreamBox> {
        debug!(query, start_time = ec.start_time, end_time = ec.end_time, "executing query");
        let expr = parser::parse(query)?;
        self.eval_expr(ec, &expr)
    }

    /// Stream series matching the given tag filters, for seriesByTag.
    pub fn search_by_tags(
        &self,
        ec: &EvalConfig,
        filters: &[source::TagFilter],
    ) -> Result<SeriesStreamBox> {
        self.source.search_by_tags(ec, filters)
    }

    /// Evaluate a parsed expression.
    pub fn eval_expr(self: &Arc<Self>, ec: &EvalConfig, expr: &Expr) -> Result<SeriesStreamBox> {
        if ec.deadline_exceeded() {
            return Err(Error::Timeout(format!(
                "deadline exceeded while evaluating {}",
                expr.to_query_string()
            )));
        }
        match expr {
            Expr::Metric(me) => {
                let stream = self.source.search(ec, &me.query)?;
                let expr = expr.clone();
                let query = me.query.clone();
                Ok(serial_map(
                    stream,
                    Arc::new(move |mut s: series::Series| {
                        s.expr = expr.clone();
                        s.path_expression = query.clone();
                        Ok(Some(s))
                    }),
                ))
            }
            Expr::Func(fe) => functions::transform(self, ec, fe)
                .map_err(|err| err.in_expr(&expr.to_query_string())),
            _ => Err(Error::Execution(format!(
                "cannot evaluate {}: expecting metric expression or function call",
                expr.to_query_string()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::source::MemorySource;
    use crate::eval::stream::fetch_all_series;

    fn test_config() -> EvalConfig {
        EvalConfig {
            start_time: 120_000,
            end_time: 420_000,
            storage_step: 60_000,
            deadline: None,
            current_time: 150_000_000,
            x_files_factor: 0.0,
            etfs: Vec::new(),
            original_query: String::new(),
        }
    }

    #[test]
    fn test_eval_metric_expr() {
        let mut source = MemorySource::new();
        source.add_series_over("foo.bar", 0, 600_000, 60_000, &[1.0, 2.0]);
        let ev = Evaluator::new(Arc::new(source));
        let ec = test_config();
        let mut stream = ev.exec_expr(&ec, "foo.bar").unwrap();
        let all = fetch_all_series(stream.as_mut()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "foo.bar");
        assert_eq!(all[0].path_expression, "foo.bar");
        assert_eq!(all[0].expr.to_query_string(), "foo.bar");
    }

    #[test]
    fn test_eval_parse_error() {
        let ev = Evaluator::new(Arc::new(MemorySource::new()));
        let ec = test_config();
        assert!(ev.exec_expr(&ec, "foo.bar(").is_err());
    }

    #[test]
    fn test_eval_literal_is_error() {
        let ev = Evaluator::new(Arc::new(MemorySource::new()));
        let ec = test_config();
        assert!(ev.exec_expr(&ec, "123").is_err());
    }

    #[test]
    fn test_eval_deadline_exceeded() {
        let ev = Evaluator::new(Arc::new(MemorySource::new()));
        let mut ec = test_config();
        ec.deadline = Some(std::time::Instant::now() - std::time::Duration::from_secs(1));
        match ev.exec_expr(&ec, "foo.bar") {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }
}
