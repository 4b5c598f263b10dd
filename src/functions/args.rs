//! Argument extraction helpers
//!
//! Graphite allows any argument to be passed positionally or by name, with
//! `None` standing in for "use the default". Every accessor here resolves
//! by name first, then falls back to the positional slot.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};
use crate::eval::config::EvalConfig;
use crate::eval::stream::SeriesStreamBox;
use crate::eval::Evaluator;
use crate::parser::{ArgExpr, Expr};

fn expr_kind(expr: &Expr) -> &'static str {
    match expr {
        Expr::Metric(_) => "metric expression",
        Expr::Func(_) => "function call",
        Expr::Number(_) => "number",
        Expr::Str(_) => "string",
        Expr::Bool(_) => "bool",
        Expr::None(_) => "None",
    }
}

/// Resolve the argument `name` by name or at the positional `index`.
pub fn get_arg<'a>(args: &'a [ArgExpr], name: &str, index: usize) -> Result<&'a ArgExpr> {
    for arg in args {
        if arg.name.as_deref() == Some(name) {
            return Ok(arg);
        }
    }
    if index >= args.len() {
        return Err(Error::Argument(format!(
            "missing arg {:?} at position {}",
            name, index
        )));
    }
    let arg = &args[index];
    if let Some(arg_name) = &arg.name {
        return Err(Error::Argument(format!(
            "unexpected named arg at position {}: {:?}",
            index, arg_name
        )));
    }
    Ok(arg)
}

/// Like [`get_arg`] but absence is not an error.
pub fn get_optional_arg<'a>(args: &'a [ArgExpr], name: &str, index: usize) -> Option<&'a ArgExpr> {
    for arg in args {
        if arg.name.as_deref() == Some(name) {
            return Some(arg);
        }
    }
    let arg = args.get(index)?;
    if arg.name.is_some() {
        return None;
    }
    Some(arg)
}

/// Evaluate the series-list argument `name` at `index`.
pub fn eval_series_list(
    ev: &Arc<Evaluator>,
    ec: &EvalConfig,
    args: &[ArgExpr],
    name: &str,
    index: usize,
) -> Result<SeriesStreamBox> {
    let arg = get_arg(args, name, index)?;
    ev.eval_expr(ec, &arg.expr).map_err(|err| {
        Error::Execution(format!(
            "cannot evaluate arg {:?} at position {}: {}",
            name, index, err
        ))
    })
}

/// Interpret every argument as an integer.
pub fn get_ints(args: &[ArgExpr], name: &str) -> Result<Vec<i64>> {
    let mut ns = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        ns.push(get_number(args, name, i)? as i64);
    }
    Ok(ns)
}

/// Fetch the number argument `name` at `index`.
pub fn get_number(args: &[ArgExpr], name: &str, index: usize) -> Result<f64> {
    let arg = get_arg(args, name, index)?;
    match &arg.expr {
        Expr::Number(ne) => Ok(ne.n),
        other => Err(Error::Argument(format!(
            "arg {:?} at position {} must be a number; got {}",
            name,
            index,
            expr_kind(other)
        ))),
    }
}

/// Fetch the number argument `name` at `index`, defaulting when absent
/// or `None`.
pub fn get_optional_number(
    args: &[ArgExpr],
    name: &str,
    index: usize,
    default_value: f64,
) -> Result<f64> {
    let arg = match get_optional_arg(args, name, index) {
        Some(arg) => arg,
        None => return Ok(default_value),
    };
    match &arg.expr {
        Expr::None(_) => Ok(default_value),
        Expr::Number(ne) => Ok(ne.n),
        other => Err(Error::Argument(format!(
            "arg {:?} at position {} must be a number; got {}",
            name,
            index,
            expr_kind(other)
        ))),
    }
}

/// Fetch the string argument `name` at `index`.
pub fn get_string(args: &[ArgExpr], name: &str, index: usize) -> Result<String> {
    let arg = get_arg(args, name, index)?;
    match &arg.expr {
        Expr::Str(se) => Ok(se.s.clone()),
        other => Err(Error::Argument(format!(
            "arg {:?} at position {} must be a string; got {}",
            name,
            index,
            expr_kind(other)
        ))),
    }
}

/// Fetch the string argument `name` at `index`, defaulting when absent
/// or `None`.
pub fn get_optional_string(
    args: &[ArgExpr],
    name: &str,
    index: usize,
    default_value: &str,
) -> Result<String> {
    let arg = match get_optional_arg(args, name, index) {
        Some(arg) => arg,
        None => return Ok(default_value.to_string()),
    };
    match &arg.expr {
        Expr::None(_) => Ok(default_value.to_string()),
        Expr::Str(se) => Ok(se.s.clone()),
        other => Err(Error::Argument(format!(
            "arg {:?} at position {} must be a string; got {}",
            name,
            index,
            expr_kind(other)
        ))),
    }
}

/// Fetch the bool argument `name` at `index`, defaulting when absent
/// or `None`.
pub fn get_optional_bool(
    args: &[ArgExpr],
    name: &str,
    index: usize,
    default_value: bool,
) -> Result<bool> {
    let arg = match get_optional_arg(args, name, index) {
        Some(arg) => arg,
        None => return Ok(default_value),
    };
    match &arg.expr {
        Expr::None(_) => Ok(default_value),
        Expr::Bool(be) => Ok(be.b),
        other => Err(Error::Argument(format!(
            "arg {:?} at position {} must be a bool; got {}",
            name,
            index,
            expr_kind(other)
        ))),
    }
}

/// Fetch the string argument `name` at `index` and compile it as a regexp.
pub fn get_regexp(args: &[ArgExpr], name: &str, index: usize) -> Result<Regex> {
    let search = get_string(args, name, index)?;
    Regex::new(&search).map_err(|err| {
        Error::Argument(format!(
            "cannot compile search regexp {:?}: {}",
            search, err
        ))
    })
}

lazy_static! {
    static ref BACKREF_RE: Regex = Regex::new(r"\\(\d+)").unwrap();
}

/// Fetch a replacement-pattern string, rewriting Graphite's `\1` capture
/// references to the `${1}` form.
pub fn get_regexp_replacement(args: &[ArgExpr], name: &str, index: usize) -> Result<String> {
    let replace = get_string(args, name, index)?;
    Ok(BACKREF_RE.replace_all(&replace, "$${${1}}").into_owned())
}

/// Interpret every argument as a path node: a number (path index) or a
/// string (tag name).
pub fn get_nodes(args: &[ArgExpr]) -> Result<Vec<Expr>> {
    let mut nodes = Vec::with_capacity(args.len());
    for arg in args {
        match &arg.expr {
            Expr::Number(_) | Expr::Str(_) => nodes.push(arg.expr.clone()),
            other => {
                return Err(Error::Argument(format!(
                    "unexpected arg type for `nodes`; got {}; expecting number or string",
                    expr_kind(other)
                )));
            }
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{BoolExpr, NumberExpr, StringExpr};

    fn positional(expr: Expr) -> ArgExpr {
        ArgExpr::positional(expr)
    }

    fn named(name: &str, expr: Expr) -> ArgExpr {
        ArgExpr {
            name: Some(name.to_string()),
            expr,
        }
    }

    fn num(n: f64) -> Expr {
        Expr::Number(NumberExpr { n })
    }

    fn s(v: &str) -> Expr {
        Expr::Str(StringExpr { s: v.to_string() })
    }

    #[test]
    fn test_get_arg_by_name_wins_over_position() {
        let args = vec![positional(num(1.0)), named("limit", num(5.0))];
        assert_eq!(get_number(&args, "limit", 0).unwrap(), 5.0);
        assert_eq!(get_number(&args, "other", 0).unwrap(), 1.0);
    }

    #[test]
    fn test_get_arg_missing() {
        let args = vec![positional(num(1.0))];
        assert!(get_arg(&args, "limit", 3).is_err());
    }

    #[test]
    fn test_get_arg_rejects_foreign_named_arg() {
        let args = vec![named("other", num(1.0))];
        assert!(get_arg(&args, "limit", 0).is_err());
    }

    #[test]
    fn test_optional_defaults() {
        let args = vec![positional(Expr::None(crate::parser::NoneExpr))];
        assert_eq!(get_optional_number(&args, "n", 0, 7.5).unwrap(), 7.5);
        assert_eq!(get_optional_string(&args, "s", 0, "dflt").unwrap(), "dflt");
        assert!(get_optional_bool(&args, "b", 0, true).unwrap());
        assert_eq!(get_optional_number(&args, "n", 5, 2.0).unwrap(), 2.0);
    }

    #[test]
    fn test_type_mismatch() {
        let args = vec![positional(s("abc"))];
        assert!(get_number(&args, "n", 0).is_err());
        assert!(get_optional_bool(&args, "b", 0, false).is_err());
    }

    #[test]
    fn test_bool_arg() {
        let args = vec![positional(Expr::Bool(BoolExpr { b: true }))];
        assert!(get_optional_bool(&args, "b", 0, false).unwrap());
    }

    #[test]
    fn test_regexp_replacement_backrefs() {
        let args = vec![positional(s(r"\1.host.\2"))];
        assert_eq!(
            get_regexp_replacement(&args, "replace", 0).unwrap(),
            "${1}.host.${2}"
        );
    }

    #[test]
    fn test_regexp_replacement_backref_before_ident_chars() {
        let args = vec![positional(s(r"\1_x"))];
        assert_eq!(
            get_regexp_replacement(&args, "replace", 0).unwrap(),
            "${1}_x"
        );
    }

    #[test]
    fn test_get_nodes() {
        let args = vec![positional(num(1.0)), positional(s("dc"))];
        assert_eq!(get_nodes(&args).unwrap().len(), 2);
        let bad = vec![positional(Expr::Bool(BoolExpr { b: false }))];
        assert!(get_nodes(&bad).is_err());
    }

    #[test]
    fn test_get_ints() {
        let args = vec![positional(num(1.0)), positional(num(-2.9))];
        assert_eq!(get_ints(&args, "nodes").unwrap(), vec![1, -2]);
    }
}
