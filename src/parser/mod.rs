//! Graphite render API target expression parser
//!
//! Recursive descent with one token of lookahead. Supports Graphite's
//! pipe-chaining sugar: `metric|f1(...)|f2(...)` desugars into nested
//! function calls with the piped value as the first argument.
//!
//! See <https://graphite.readthedocs.io/en/stable/render_api.html>

pub mod ast;
pub mod lexer;

pub use ast::{
    format_float, quote_string, ArgExpr, BoolExpr, Expr, FuncExpr, FuncPrintState, MetricExpr,
    NoneExpr, NumberExpr, StringExpr,
};
pub use lexer::{append_escaped_ident, unescape_ident, Lexer};

use crate::error::{Error, Result};
use lexer::{
    is_eof, is_ident_prefix, is_positive_number_prefix, is_special_integer_prefix,
    is_string_prefix,
};

/// Parse a Graphite render API target expression.
///
/// The whole input must be consumed; trailing tokens are a parse error.
pub fn parse(s: &str) -> Result<Expr> {
    let mut p = Parser::default();
    p.lex.init(s);
    if let Err(err) = p.lex.next() {
        return Err(Error::Parse(format!(
            "cannot parse target expression: {}; context: {:?}",
            err,
            p.lex.context()
        )));
    }
    let expr = p.parse_expr().map_err(|err| {
        Error::Parse(format!(
            "cannot parse target expression: {}; context: {:?}",
            err,
            p.lex.context()
        ))
    })?;
    if !is_eof(&p.lex.token) {
        return Err(Error::Parse(format!(
            "unexpected tail left after parsing {:?}; context: {:?}",
            expr.to_query_string(),
            p.lex.context()
        )));
    }
    Ok(expr)
}

#[derive(Default)]
struct Parser {
    lex: Lexer,
}

impl Parser {
    fn parse_expr(&mut self) -> Result<Expr> {
        let token = self.lex.token.clone();
        let mut expr = if is_positive_number_prefix(&token) || token == "+" || token == "-" {
            self.parse_number()?
        } else if is_string_prefix(&token) {
            self.parse_string()?
        } else if is_ident_prefix(&token) {
            self.parse_metric_expr_or_func_call()?
        } else {
            return Err(Error::Parse(format!(
                "unexpected token when parsing expression: {:?}",
                token
            )));
        };
        while self.lex.token == "|" {
            // Chained function call, e.g. `metric|func`.
            let first_arg = ArgExpr::positional(expr);
            expr = Expr::Func(self.parse_chained_func(first_arg)?);
        }
        Ok(expr)
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let mut token = self.lex.token.clone();
        let mut is_minus = false;
        if token == "-" || token == "+" {
            self.lex.next().map_err(|err| {
                Error::Parse(format!("cannot find number after {:?} token: {}", token, err))
            })?;
            is_minus = token == "-";
            token = self.lex.token.clone();
        }
        let mut n = if is_special_integer_prefix(&token) {
            parse_prefixed_int(&token)?
        } else {
            token.parse::<f64>().map_err(|err| {
                Error::Parse(format!(
                    "cannot parse floating-point number {:?}: {}",
                    token, err
                ))
            })?
        };
        if is_minus {
            n = -n;
        }
        self.lex.next().map_err(|err| {
            Error::Parse(format!("cannot find next token after {:?}: {}", token, err))
        })?;
        Ok(Expr::Number(NumberExpr { n }))
    }

    fn parse_string(&mut self) -> Result<Expr> {
        let token = self.lex.token.clone();
        let b = token.as_bytes();
        if b.len() < 2 || b[0] != b[b.len() - 1] {
            return Err(Error::Parse(format!(
                "string literal contains unexpected trailing char; got {:?}",
                token
            )));
        }
        let quote = b[0] as char;
        let s = token[1..token.len() - 1]
            .replace(&format!("\\{}", quote), &quote.to_string())
            .replace("\\\\", "\\");
        self.lex.next().map_err(|err| {
            Error::Parse(format!("cannot find next token after {}: {}", token, err))
        })?;
        Ok(Expr::Str(StringExpr { s }))
    }

    fn parse_metric_expr_or_func_call(&mut self) -> Result<Expr> {
        let token = self.lex.token.clone();
        let ident = unescape_ident(&token);
        self.lex.next().map_err(|err| {
            Error::Parse(format!("cannot find next token after {:?}: {}", token, err))
        })?;
        if self.lex.token == "(" {
            // Function call, e.g. `func(foo,bar)`.
            let func_name = ident;
            let args = self.parse_args().map_err(|err| {
                Error::Parse(format!(
                    "cannot parse args for function {:?}: {}",
                    func_name, err
                ))
            })?;
            return Ok(Expr::Func(FuncExpr {
                func_name,
                args,
                print_state: FuncPrintState::Normal,
            }));
        }
        // Metric expression or bool expression or None.
        if ident.eq_ignore_ascii_case("true") {
            return Ok(Expr::Bool(BoolExpr { b: true }));
        }
        if ident.eq_ignore_ascii_case("false") {
            return Ok(Expr::Bool(BoolExpr { b: false }));
        }
        if ident.eq_ignore_ascii_case("none") {
            return Ok(Expr::None(NoneExpr));
        }
        Ok(Expr::Metric(MetricExpr { query: ident }))
    }

    fn parse_chained_func(&mut self, mut first_arg: ArgExpr) -> Result<FuncExpr> {
        loop {
            self.lex.next().map_err(|err| {
                Error::Parse(format!(
                    "cannot find function name after {:?}|: {}",
                    first_arg.expr.to_query_string(),
                    err
                ))
            })?;
            if !is_ident_prefix(&self.lex.token) {
                return Err(Error::Parse(format!(
                    "expecting function name after {:?}|, got {:?}",
                    first_arg.expr.to_query_string(),
                    self.lex.token
                )));
            }
            let func_name = unescape_ident(&self.lex.token);
            self.lex.next().map_err(|err| {
                Error::Parse(format!(
                    "cannot find next token after {:?}|{:?}: {}",
                    first_arg.expr.to_query_string(),
                    func_name,
                    err
                ))
            })?;
            let mut fe = FuncExpr {
                func_name,
                args: Vec::new(),
                print_state: FuncPrintState::Chained,
            };
            if self.lex.token != "(" {
                fe.args = vec![first_arg];
            } else {
                let args = self.parse_args().map_err(|err| {
                    Error::Parse(format!(
                        "cannot parse args for {:?}|{:?}: {}",
                        first_arg.expr.to_query_string(),
                        fe.func_name,
                        err
                    ))
                })?;
                fe.args = std::iter::once(first_arg).chain(args).collect();
            }
            if self.lex.token != "|" {
                return Ok(fe);
            }
            first_arg = ArgExpr::positional(Expr::Func(fe));
        }
    }

    fn parse_args(&mut self) -> Result<Vec<ArgExpr>> {
        let mut args: Vec<ArgExpr> = Vec::new();
        loop {
            self.lex.next().map_err(|err| {
                Error::Parse(format!("cannot find arg #{}: {}", args.len(), err))
            })?;
            if self.lex.token == ")" {
                self.lex.next().map_err(|err| {
                    Error::Parse(format!("cannot find next token after function args: {}", err))
                })?;
                return Ok(args);
            }
            let expr = self
                .parse_expr()
                .map_err(|err| Error::Parse(format!("cannot parse arg #{}: {}", args.len(), err)))?;
            if self.lex.token == "=" {
                // Named arg; the name must have parsed as a bare metric expr.
                let arg_name = match &expr {
                    Expr::Metric(me) => me.query.clone(),
                    _ => {
                        return Err(Error::Parse(format!(
                            "expecting a name for named expression; got {:?}",
                            expr.to_query_string()
                        )));
                    }
                };
                self.lex.next().map_err(|err| {
                    Error::Parse(format!("cannot find named value for {:?}: {}", arg_name, err))
                })?;
                let arg_value = self.parse_expr().map_err(|err| {
                    Error::Parse(format!(
                        "cannot parse named value for {:?}: {}",
                        arg_name, err
                    ))
                })?;
                args.push(ArgExpr {
                    name: Some(arg_name),
                    expr: arg_value,
                });
            } else {
                args.push(ArgExpr::positional(expr));
            }
            match self.lex.token.as_str() {
                "," => {
                    // Continue parsing args.
                }
                ")" => {
                    self.lex.next().map_err(|err| {
                        Error::Parse(format!("cannot find next token after func args: {}", err))
                    })?;
                    return Ok(args);
                }
                token => {
                    return Err(Error::Parse(format!(
                        "unexpected token detected in func args: {:?}",
                        token
                    )));
                }
            }
        }
    }
}

fn parse_prefixed_int(token: &str) -> Result<f64> {
    let b = token.as_bytes();
    let (radix, digits) = match b.get(1) {
        Some(b'x') | Some(b'X') => (16, &token[2..]),
        Some(b'o') | Some(b'O') => (8, &token[2..]),
        Some(b'b') | Some(b'B') => (2, &token[2..]),
        _ => (8, &token[1..]),
    };
    i64::from_str_radix(digits, radix)
        .map(|d| d as f64)
        .map_err(|err| Error::Parse(format!("cannot parse integer {:?}: {}", token, err)))
}
