//! AST for Graphite render API target expressions
//!
//! Every node serializes back to canonical query text via
//! [`Expr::append_string`]. The canonical form is observable behavior: it is
//! used for generated series names, path expressions and error messages, so
//! formatting rules (single-quoted strings, shortest float representation,
//! chained-call printing) must stay stable.

use super::lexer::append_escaped_ident;

/// A parsed target expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Metric selector, e.g. `foo.{bar,baz}.*`
    Metric(MetricExpr),
    /// Function call, e.g. `sumSeries(foo.bar)`
    Func(FuncExpr),
    /// Numeric literal
    Number(NumberExpr),
    /// String literal
    Str(StringExpr),
    /// `True` or `False` literal
    Bool(BoolExpr),
    /// `None` literal
    None(NoneExpr),
}

impl Expr {
    /// Append the canonical text form to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        match self {
            Expr::Metric(me) => me.append_string(dst),
            Expr::Func(fe) => fe.append_string(dst),
            Expr::Number(ne) => ne.append_string(dst),
            Expr::Str(se) => se.append_string(dst),
            Expr::Bool(be) => be.append_string(dst),
            Expr::None(nne) => nne.append_string(dst),
        }
    }

    /// Canonical text form as an owned string.
    pub fn to_query_string(&self) -> String {
        let mut s = String::new();
        self.append_string(&mut s);
        s
    }
}

/// Metric selector expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricExpr {
    /// The raw query for fetching metrics.
    pub query: String,
}

impl MetricExpr {
    /// Append the escaped selector text to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        append_escaped_ident(dst, &self.query);
    }
}

/// Function call expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncExpr {
    /// The function name, case-sensitive.
    pub func_name: String,

    /// Function args in call order. For a chained call the piped value is
    /// the first arg.
    pub args: Vec<ArgExpr>,

    /// How the call prints back: `f(a,b)` or `a|f(b)`.
    pub print_state: FuncPrintState,
}

/// Print form for a function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncPrintState {
    /// Normal call: `func(arg1, ..., argN)`
    Normal,
    /// Chained call: `arg1|func(arg2, ..., argN)`
    Chained,
}

impl FuncExpr {
    /// Build a normal (non-chained) call expression.
    pub fn new(func_name: &str, args: Vec<ArgExpr>) -> Self {
        FuncExpr {
            func_name: func_name.to_string(),
            args,
            print_state: FuncPrintState::Normal,
        }
    }

    /// Append the canonical call text to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        match self.print_state {
            FuncPrintState::Normal => {
                append_escaped_ident(dst, &self.func_name);
                append_args_string(dst, &self.args);
            }
            FuncPrintState::Chained => {
                assert!(
                    !self.args.is_empty(),
                    "BUG: chained func call must have at least a single arg"
                );
                let first_arg = &self.args[0];
                assert!(
                    first_arg.name.is_none(),
                    "BUG: the first chained arg must have no name"
                );
                first_arg.append_string(dst);
                dst.push('|');
                append_escaped_ident(dst, &self.func_name);
                if self.args.len() > 1 {
                    append_args_string(dst, &self.args[1..]);
                }
            }
        }
    }
}

/// Function argument, optionally named.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgExpr {
    /// Name for a named arg (`name=value`); `None` for positional args.
    pub name: Option<String>,

    /// The arg value.
    pub expr: Expr,
}

impl ArgExpr {
    /// Positional arg wrapper.
    pub fn positional(expr: Expr) -> Self {
        ArgExpr { name: None, expr }
    }

    /// Append the canonical arg text to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        if let Some(name) = &self.name {
            append_escaped_ident(dst, name);
            dst.push('=');
        }
        self.expr.append_string(dst);
    }
}

/// Float constant.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberExpr {
    /// The constant value.
    pub n: f64,
}

impl NumberExpr {
    /// Append the shortest round-trippable representation to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        append_float(dst, self.n);
    }
}

/// String constant.
#[derive(Debug, Clone, PartialEq)]
pub struct StringExpr {
    /// Unquoted string contents.
    pub s: String,
}

impl StringExpr {
    /// Append the single-quoted escaped form to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        dst.push('\'');
        for c in self.s.chars() {
            match c {
                '\\' => dst.push_str("\\\\"),
                '\'' => dst.push_str("\\'"),
                _ => dst.push(c),
            }
        }
        dst.push('\'');
    }
}

/// Bool constant (`True` or `False`).
#[derive(Debug, Clone, PartialEq)]
pub struct BoolExpr {
    /// The constant value.
    pub b: bool,
}

impl BoolExpr {
    /// Append `True` or `False` to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        dst.push_str(if self.b { "True" } else { "False" });
    }
}

/// `None` constant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NoneExpr;

impl NoneExpr {
    /// Append `None` to `dst`.
    pub fn append_string(&self, dst: &mut String) {
        dst.push_str("None");
    }
}

/// Quote `s` so it can be embedded in a generated Graphite query.
pub fn quote_string(s: &str) -> String {
    let se = StringExpr { s: s.to_string() };
    let mut dst = String::new();
    se.append_string(&mut dst);
    dst
}

fn append_args_string(dst: &mut String, args: &[ArgExpr]) {
    dst.push('(');
    for (i, arg) in args.iter().enumerate() {
        arg.append_string(dst);
        if i + 1 < args.len() {
            dst.push(',');
        }
    }
    dst.push(')');
}

/// Append `n` in shortest `%g`-style form: plain decimal for mid-range
/// magnitudes, exponent notation for very large or very small values.
pub fn append_float(dst: &mut String, n: f64) {
    if n.is_nan() {
        dst.push_str("NaN");
        return;
    }
    if n.is_infinite() {
        dst.push_str(if n > 0.0 { "+Inf" } else { "-Inf" });
        return;
    }
    let abs = n.abs();
    if abs != 0.0 && (abs < 1e-4 || abs >= 1e21) {
        let mut mantissa = format!("{:e}", n);
        // Normalize the exponent to a signed two-digit form.
        if let Some(pos) = mantissa.find('e') {
            let (m, e) = mantissa.split_at(pos);
            let exp: i32 = e[1..].parse().unwrap_or(0);
            mantissa = format!("{}e{}{:02}", m, if exp < 0 { '-' } else { '+' }, exp.abs());
        }
        dst.push_str(&mantissa);
        return;
    }
    if n == n.trunc() {
        dst.push_str(&format!("{}", n as i64));
        return;
    }
    dst.push_str(&format!("{}", n));
}

/// Shortest `%g`-style form of `n` as an owned string.
pub fn format_float(n: f64) -> String {
    let mut s = String::new();
    append_float(&mut s, n);
    s
}
