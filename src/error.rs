//! Error types for the query engine

use thiserror::Error;

/// Main error type for query parsing and evaluation
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Target expression could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Function received malformed or missing arguments
    #[error("Argument error: {0}")]
    Argument(String),

    /// Failure while evaluating an expression or pulling a series stream
    #[error("Execution error: {0}")]
    Execution(String),

    /// Function exists in the Graphite API but is not implemented
    #[error("Unsupported function: {0}")]
    Unsupported(String),

    /// Evaluation deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Wrap the error with the canonical text of the failing sub-expression.
    pub fn in_expr(self, expr_text: &str) -> Self {
        Error::Execution(format!("cannot evaluate {}: {}", expr_text, self))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Argument("unexpected arg #2 for function \"scale\"".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Argument error"));
        assert!(display.contains("scale"));
    }

    #[test]
    fn test_in_expr_wrapping() {
        let err = Error::Execution("storage unavailable".to_string());
        let wrapped = err.in_expr("sumSeries(foo.bar)");
        assert!(format!("{}", wrapped).contains("sumSeries(foo.bar)"));
    }
}
