//! Graphite render-API query engine.
//!
//! Parses Graphite query expressions, evaluates them against a pluggable
//! series source and applies the render-API function library (transforms,
//! aggregations, filters, Holt-Winters forecasting and friends) over lazy,
//! pull-based series streams.
//!
//! ```
//! use std::sync::Arc;
//! use graphite_query::{EvalConfig, Evaluator, MemorySource};
//! use graphite_query::eval::stream::fetch_all_series;
//!
//! let mut source = MemorySource::new();
//! source.add_series_over("app.cpu", 0, 300_000, 60_000, &[1.0, 2.0]);
//!
//! let ev = Evaluator::new(Arc::new(source));
//! let ec = EvalConfig {
//!     start_time: 0,
//!     end_time: 300_000,
//!     storage_step: 60_000,
//!     deadline: None,
//!     current_time: 0,
//!     x_files_factor: 0.0,
//!     etfs: Vec::new(),
//!     original_query: String::new(),
//! };
//!
//! let mut stream = ev.exec_expr(&ec, "scale(app.cpu,2)").unwrap();
//! let series = fetch_all_series(stream.as_mut()).unwrap();
//! assert_eq!(series[0].name, "scale(app.cpu,2)");
//! assert_eq!(series[0].values, vec![2.0, 4.0, 2.0, 4.0, 2.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggr;
pub mod error;
pub mod eval;
pub mod functions;
pub mod parser;

pub use error::{Error, Result};
pub use eval::config::EvalConfig;
pub use eval::series::Series;
pub use eval::source::{MemorySource, SeriesSource, TagFilter};
pub use eval::Evaluator;
pub use parser::parse;
