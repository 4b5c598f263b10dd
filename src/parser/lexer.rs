//! Lexer for Graphite render API target expressions
//!
//! Tokenizes a target string into punctuation, quoted strings, numbers and
//! identifiers. Graphite metric selectors embed wildcards directly in the
//! metric name, so identifiers absorb `.`, `*`, bracketed char classes
//! (`[a-z]`) and brace alternations (`{foo,bar}`) as single tokens.

use crate::error::{Error, Result};

/// Stateful scanner over a target expression.
///
/// After [`Lexer::init`], each [`Lexer::next`] call advances to the next
/// token, which is exposed via the `token` field. An empty `token` means
/// end of input. Errors are sticky: once `next` fails, all subsequent
/// calls return the same error.
#[derive(Debug, Default)]
pub struct Lexer {
    /// The currently parsed token. Empty string means EOF.
    pub token: String,

    /// Unscanned tail of the input.
    tail: String,

    /// Sticky scan error.
    err: Option<Error>,
}

impl Lexer {
    /// Reset the lexer to scan `s`.
    ///
    /// The first token becomes available after the first call to `next`.
    pub fn init(&mut self, s: &str) {
        self.token.clear();
        self.tail = s.to_string();
        self.err = None;
    }

    /// Remaining unparsed input including the current token, for error context.
    pub fn context(&self) -> String {
        format!("{}{}", self.token, self.tail)
    }

    /// Advance to the next token.
    pub fn next(&mut self) -> Result<()> {
        self.token.clear();
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.scan_token() {
            Ok(token) => {
                self.token = token;
                Ok(())
            }
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    fn scan_token(&mut self) -> Result<String> {
        let s = self.tail.trim_start();
        if s.is_empty() {
            self.tail.clear();
            return Ok(String::new());
        }
        let token_len = match s.as_bytes()[0] {
            b'(' | b')' | b',' | b'|' | b'=' | b'+' | b'-' => 1,
            b'"' | b'\'' => scan_string(s)?,
            c if c.is_ascii_digit() => scan_positive_number(s)?,
            _ => scan_ident(s)?,
        };
        let token = s[..token_len].to_string();
        self.tail = s[token_len..].to_string();
        Ok(token)
    }
}

/// Whether `token` signals end of input.
pub fn is_eof(token: &str) -> bool {
    token.is_empty()
}

/// Whether `token` starts a quoted string literal.
pub fn is_string_prefix(token: &str) -> bool {
    matches!(token.as_bytes().first(), Some(b'"') | Some(b'\''))
}

/// Whether `token` starts an unsigned number literal.
pub fn is_positive_number_prefix(token: &str) -> bool {
    matches!(token.as_bytes().first(), Some(c) if c.is_ascii_digit())
}

/// Whether `token` starts an identifier (metric selector, function name,
/// bool or None literal).
pub fn is_ident_prefix(token: &str) -> bool {
    match token.as_bytes().first() {
        Some(&c) => c == b'\\' || c == b'[' || c == b'{' || is_first_ident_char(c),
        None => false,
    }
}

/// Whether `token` is a hex/octal/binary integer literal.
pub fn is_special_integer_prefix(token: &str) -> bool {
    let b = token.as_bytes();
    if b.first() != Some(&b'0') {
        return false;
    }
    if b.len() < 2 {
        return false;
    }
    matches!(b[1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B') || b[1].is_ascii_digit()
}

fn is_ident_char(c: u8) -> bool {
    if c.is_ascii_alphanumeric() {
        return true;
    }
    matches!(
        c,
        b'_' | b'.' | b'*' | b'$' | b':' | b'#' | b'%' | b'?' | b'@' | b'-'
    ) || c >= 0x80
}

// First ident char excludes digits, since digit-first tokens are scanned
// as numbers.
fn is_first_ident_char(c: u8) -> bool {
    is_ident_char(c) && !c.is_ascii_digit()
}

fn scan_string(s: &str) -> Result<usize> {
    let b = s.as_bytes();
    let quote = b[0];
    let mut i = 1;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            c if c == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(Error::Parse(format!(
        "missing closing quote {} in string {:?}",
        quote as char, s
    )))
}

fn scan_positive_number(s: &str) -> Result<usize> {
    let b = s.as_bytes();
    let mut i = 0;
    if b.len() > 1 && b[0] == b'0' {
        match b[1] {
            b'x' | b'X' => {
                i = 2;
                while i < b.len() && b[i].is_ascii_hexdigit() {
                    i += 1;
                }
                if i == 2 {
                    return Err(Error::Parse(format!("missing hex digits in {:?}", s)));
                }
                return Ok(i);
            }
            b'o' | b'O' => {
                i = 2;
                while i < b.len() && (b'0'..=b'7').contains(&b[i]) {
                    i += 1;
                }
                if i == 2 {
                    return Err(Error::Parse(format!("missing octal digits in {:?}", s)));
                }
                return Ok(i);
            }
            b'b' | b'B' => {
                i = 2;
                while i < b.len() && (b[i] == b'0' || b[i] == b'1') {
                    i += 1;
                }
                if i == 2 {
                    return Err(Error::Parse(format!("missing binary digits in {:?}", s)));
                }
                return Ok(i);
            }
            _ => {}
        }
    }
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    if i == b.len() || (b[i] != b'.' && b[i] != b'e' && b[i] != b'E') {
        return Ok(i);
    }
    if b[i] == b'.' {
        // Fractional part cannot be empty.
        i += 1;
        let j = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == j {
            return Err(Error::Parse(format!(
                "missing fractional part in number {:?}",
                s
            )));
        }
        if i == b.len() {
            return Ok(i);
        }
    }
    if b[i] != b'e' && b[i] != b'E' {
        return Ok(i);
    }
    i += 1;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    let j = i;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    if i == j {
        return Err(Error::Parse(format!("missing exponent part in {:?}", s)));
    }
    Ok(i)
}

fn scan_ident(s: &str) -> Result<usize> {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            c if is_ident_char(c) => i += 1,
            b'\\' => {
                // Escaped char, possibly a \xHH hex escape.
                i += 1;
                if i < b.len() {
                    if b[i] == b'x'
                        && i + 2 < b.len()
                        && b[i + 1].is_ascii_hexdigit()
                        && b[i + 2].is_ascii_hexdigit()
                    {
                        i += 3;
                    } else {
                        i += utf8_char_len(b[i]);
                    }
                }
            }
            b'[' => match s[i..].find(']') {
                Some(n) => i += n + 1,
                None => {
                    return Err(Error::Parse(format!("missing `]` in {:?}", s)));
                }
            },
            b'{' => match s[i..].find('}') {
                Some(n) => i += n + 1,
                None => {
                    return Err(Error::Parse(format!("missing `}}` in {:?}", s)));
                }
            },
            _ => break,
        }
    }
    if i == 0 {
        return Err(Error::Parse(format!(
            "unexpected char {:?} at the start of token in {:?}",
            s.chars().next().unwrap_or('\0'),
            s
        )));
    }
    Ok(i)
}

fn utf8_char_len(first_byte: u8) -> usize {
    match first_byte {
        c if c < 0x80 => 1,
        c if c >= 0xf0 => 4,
        c if c >= 0xe0 => 3,
        c if c >= 0xc0 => 2,
        _ => 1,
    }
}

/// Decode backslash escapes in an identifier token.
///
/// Inverse of [`append_escaped_ident`] for round-trippable identifiers:
/// `\xHH` decodes to the byte `0xHH`, any other `\c` decodes to `c`.
pub fn unescape_ident(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let b = s.as_bytes();
    let mut dst = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] != b'\\' {
            dst.push(b[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= b.len() {
            break;
        }
        if b[i] == b'x'
            && i + 2 < b.len()
            && b[i + 1].is_ascii_hexdigit()
            && b[i + 2].is_ascii_hexdigit()
        {
            let hi = hex_value(b[i + 1]);
            let lo = hex_value(b[i + 2]);
            dst.push((hi << 4) | lo);
            i += 3;
        } else {
            let n = utf8_char_len(b[i]).min(b.len() - i);
            dst.extend_from_slice(&b[i..i + n]);
            i += n;
        }
    }
    String::from_utf8_lossy(&dst).into_owned()
}

/// Append `s` to `dst` with all chars that are not valid identifier chars
/// backslash-escaped. Wildcard-block chars (`[...]`, `{...}` incl. commas)
/// pass through since the lexer absorbs them on input. Non-printable bytes
/// are hex-escaped as `\xHH`.
pub fn append_escaped_ident(dst: &mut String, s: &str) {
    let mut out: Vec<u8> = Vec::with_capacity(s.len());
    for (i, &c) in s.as_bytes().iter().enumerate() {
        if matches!(c, b'[' | b']' | b'{' | b'}' | b',') {
            out.push(c);
        } else if is_ident_char(c) && (i > 0 || is_first_ident_char(c)) {
            out.push(c);
        } else if (0x20..0x7f).contains(&c) {
            out.push(b'\\');
            out.push(c);
        } else {
            out.push(b'\\');
            out.push(b'x');
            out.push(hex_char(c >> 4) as u8);
            out.push(hex_char(c & 0xf) as u8);
        }
    }
    dst.push_str(&String::from_utf8_lossy(&out));
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => c - b'A' + 10,
    }
}

fn hex_char(n: u8) -> char {
    char::from_digit(n as u32, 16).unwrap_or('0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> {
        let mut lex = Lexer::default();
        lex.init(s);
        let mut result = Vec::new();
        loop {
            lex.next().unwrap();
            if is_eof(&lex.token) {
                return result;
            }
            result.push(lex.token.clone());
        }
    }

    #[test]
    fn test_punctuation_and_idents() {
        assert_eq!(
            tokens("sum(foo.bar, 1)"),
            vec!["sum", "(", "foo.bar", ",", "1", ")"]
        );
        assert_eq!(tokens("a|b|c"), vec!["a", "|", "b", "|", "c"]);
        assert_eq!(tokens("x=-1.5"), vec!["x", "=", "-", "1.5"]);
    }

    #[test]
    fn test_wildcard_idents() {
        assert_eq!(tokens("foo.*.bar"), vec!["foo.*.bar"]);
        assert_eq!(tokens("foo.[a-z]ar"), vec!["foo.[a-z]ar"]);
        assert_eq!(tokens("foo.{bar,baz}.x"), vec!["foo.{bar,baz}.x"]);
        assert_eq!(tokens("host-1.cpu"), vec!["host-1.cpu"]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(tokens("1.5e3"), vec!["1.5e3"]);
        assert_eq!(tokens("0xFF"), vec!["0xFF"]);
        assert_eq!(tokens("0b101"), vec!["0b101"]);
        assert_eq!(tokens("0o17"), vec!["0o17"]);
        assert_eq!(tokens("123"), vec!["123"]);
    }

    #[test]
    fn test_strings() {
        assert_eq!(tokens(r#"'foo bar'"#), vec!["'foo bar'"]);
        assert_eq!(tokens(r#""it\"s""#), vec![r#""it\"s""#]);
    }

    #[test]
    fn test_unclosed_string_is_sticky() {
        let mut lex = Lexer::default();
        lex.init("'oops");
        assert!(lex.next().is_err());
        assert!(lex.next().is_err());
    }

    #[test]
    fn test_unclosed_brace() {
        let mut lex = Lexer::default();
        lex.init("foo.{bar");
        assert!(lex.next().is_err());
    }

    #[test]
    fn test_escape_roundtrip() {
        for s in ["foo.bar", "a b", "x\ty", "m{с}", "1xx", "a(b)"] {
            let mut escaped = String::new();
            append_escaped_ident(&mut escaped, s);
            assert_eq!(unescape_ident(&escaped), s, "escaped form: {}", escaped);
        }
    }

    #[test]
    fn test_escape_keeps_wildcard_blocks() {
        for s in ["foo.{bar,baz}.*", "foo.[a-z]ar"] {
            let mut escaped = String::new();
            append_escaped_ident(&mut escaped, s);
            assert_eq!(escaped, s);
        }
    }

    #[test]
    fn test_hex_escape() {
        assert_eq!(unescape_ident(r"foo\x20bar"), "foo bar");
        let mut dst = String::new();
        append_escaped_ident(&mut dst, "a\nb");
        assert_eq!(dst, r"a\x0ab");
    }
}
