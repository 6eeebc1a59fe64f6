//! Single left-to-right scan turning source text into a token stream.
//!
//! Whitespace and comments are skipped (comments are collected on the side so
//! the parser can reattach them to nodes), strings keep everything between
//! their quotes with escapes decoded in place. Bracket sugar (`[...]`,
//! `{...}`) is left to the parser.

use strum::Display;

use crate::error::{Error, ErrorKind, SourceLoc, render_context};

/// The nine language keywords.
pub const KEYWORDS: [&str; 9] = [
    "if", "let", "mut", "set", "fun", "while", "begin", "import", "del",
];

/// Operator names, in the same order as their opcodes (`ADD` first).
pub const OPERATORS: [&str; 25] = [
    "+", "-", "*", "/", ">", "<", "<=", ">=", "!=", "=", "len", "empty?", "tail", "head", "nil?",
    "assert", "toNumber", "toString", "@", "mod", "type", "hasField", "not", "and", "or",
];

/// Classification of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TokenKind {
    /// One of `()[]{}`.
    Grouping,
    Identifier,
    /// `&name` in an argument list; the text is the name without the `&`.
    Capture,
    /// `.name`; the text is the name without the dot.
    GetField,
    Keyword,
    Operator,
    Number,
    /// Text is the decoded string content, quotes removed.
    String,
    /// `'` (quote) or `!` (macro call marker).
    Shorthand,
    /// `...name`; the text is the name without the dots.
    Spread,
    Mismatch,
}

/// A lexed token with its 0-based source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            col,
        }
    }
}

/// A `#` comment collected during the scan, without the leading `#`.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub text: String,
    pub line: usize,
    pub col: usize,
}

/// Output of [`tokenize`]: the token stream plus the collected comments.
#[derive(Debug, Default)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    pub comments: Vec<Comment>,
}

/// Scans `code` into tokens, reporting the first invalid token as a
/// [`ErrorKind::Tokenizing`] error located in `filename`.
pub fn tokenize(code: &str, filename: &str) -> Result<TokenStream, Error> {
    Lexer::new(code, filename).scan()
}

struct Lexer<'a> {
    code: &'a str,
    filename: &'a str,
    chars: Vec<char>,
    line: usize,
    col: usize,
    saved_line: usize,
    saved_col: usize,
    buffer: String,
    out: TokenStream,
}

impl<'a> Lexer<'a> {
    fn new(code: &'a str, filename: &'a str) -> Self {
        Self {
            code,
            filename,
            chars: code.chars().collect(),
            line: 0,
            col: 0,
            saved_line: 0,
            saved_col: 0,
            buffer: String::new(),
            out: TokenStream::default(),
        }
    }

    fn scan(mut self) -> Result<TokenStream, Error> {
        let mut pos = 0;
        while pos < self.chars.len() {
            let current = self.chars[pos];
            match current {
                '(' | ')' | '[' | ']' | '{' | '}' => {
                    self.flush_buffer()?;
                    let token = Token::new(TokenKind::Grouping, current, self.line, self.col);
                    self.out.tokens.push(token);
                }
                '"' => {
                    self.flush_buffer()?;
                    pos = self.scan_string(pos)?;
                    continue; // position bookkeeping already done
                }
                // be careful with `!` and `!=`
                '\'' => {
                    self.flush_buffer()?;
                    self.out
                        .tokens
                        .push(Token::new(TokenKind::Shorthand, current, self.line, self.col));
                }
                '!' if self.buffer.is_empty() && self.chars.get(pos + 1) != Some(&'=') => {
                    self.out
                        .tokens
                        .push(Token::new(TokenKind::Shorthand, current, self.line, self.col));
                }
                '#' => {
                    self.flush_buffer()?;
                    pos = self.scan_comment(pos);
                    continue; // position bookkeeping already done
                }
                c if c == ' ' || c == '\t' || c == '\u{b}' || c == '\n' || c == '\r' => {
                    self.flush_buffer()?;
                }
                '&' => {
                    self.flush_buffer()?;
                    self.save_pos();
                    self.buffer.push('&');
                }
                '.' => {
                    // don't split 3.0 into 3 and .0
                    let starts_number = self
                        .buffer
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-' || c == '.');
                    if !self.buffer.is_empty() && !starts_number {
                        self.flush_buffer()?;
                    }
                    if self.buffer.is_empty() {
                        self.save_pos();
                    }
                    self.buffer.push('.');
                }
                c => {
                    if self.buffer.is_empty() {
                        self.save_pos();
                    }
                    self.buffer.push(c);
                }
            }

            self.advance(self.chars[pos]);
            pos += 1;
        }

        self.flush_buffer()?;
        Ok(self.out)
    }

    /// Scans a string literal starting at the opening quote, decoding escapes.
    ///
    /// Returns the index just past the closing quote.
    fn scan_string(&mut self, start: usize) -> Result<usize, Error> {
        self.saved_line = self.line;
        self.saved_col = self.col;
        self.advance('"');

        let mut content = String::new();
        let mut pos = start + 1;
        while pos < self.chars.len() {
            let current = self.chars[pos];
            self.advance(current);
            pos += 1;

            match current {
                '"' => {
                    self.out.tokens.push(Token {
                        kind: TokenKind::String,
                        text: content,
                        line: self.saved_line,
                        col: self.saved_col,
                    });
                    return Ok(pos);
                }
                '\\' => {
                    pos = self.scan_escape(pos, &mut content)?;
                }
                c => content.push(c),
            }
        }

        Err(self.tokenizing_error("unterminated string", "\"", self.saved_line, self.saved_col))
    }

    /// Decodes one escape sequence; `pos` is the index right after the `\`.
    fn scan_escape(&mut self, pos: usize, content: &mut String) -> Result<usize, Error> {
        let Some(&marker) = self.chars.get(pos) else {
            return Err(self.tokenizing_error(
                "empty control character '\\' in string",
                "\\",
                self.line,
                self.col,
            ));
        };
        self.advance(marker);

        let simple = match marker {
            '"' => Some('"'),
            'n' => Some('\n'),
            'a' => Some('\u{7}'),
            'b' => Some('\u{8}'),
            't' => Some('\t'),
            'r' => Some('\r'),
            'f' => Some('\u{c}'),
            '\\' => Some('\\'),
            '0' => Some('\0'),
            _ => None,
        };
        if let Some(c) = simple {
            content.push(c);
            return Ok(pos + 1);
        }

        // \xHH (greedy hex), \uHHHH, \UHHHHHHHH
        let fixed_len = match marker {
            'x' => 0,
            'u' => 4,
            'U' => 8,
            _ => {
                return Err(self.tokenizing_error(
                    &format!("unknown control character '\\{marker}' in string"),
                    &format!("\\{marker}"),
                    self.line,
                    self.col,
                ));
            }
        };

        let mut digits = String::new();
        let mut cursor = pos + 1;
        while cursor < self.chars.len()
            && self.chars[cursor].is_ascii_hexdigit()
            && (fixed_len == 0 || digits.len() < fixed_len)
        {
            digits.push(self.chars[cursor]);
            self.advance(self.chars[cursor]);
            cursor += 1;
        }

        let valid_len = if fixed_len == 0 { !digits.is_empty() } else { digits.len() == fixed_len };
        let decoded = u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32);
        match decoded {
            Some(c) if valid_len => {
                content.push(c);
                Ok(cursor)
            }
            _ => Err(self.tokenizing_error(
                &format!(
                    "invalid escape sequence \\{marker}{digits} in string, expected a hexadecimal number in utf8 range"
                ),
                &format!("\\{marker}{digits}"),
                self.line,
                self.col,
            )),
        }
    }

    /// Consumes a `#` comment up to (excluding) the end of line.
    fn scan_comment(&mut self, start: usize) -> usize {
        let line = self.line;
        let col = self.col;
        self.advance('#');

        let mut text = String::new();
        let mut pos = start + 1;
        while pos < self.chars.len() && self.chars[pos] != '\n' {
            text.push(self.chars[pos]);
            self.advance(self.chars[pos]);
            pos += 1;
        }
        self.out.comments.push(Comment {
            text: text.trim().to_owned(),
            line,
            col,
        });
        pos
    }

    fn save_pos(&mut self) {
        self.saved_line = self.line;
        self.saved_col = self.col;
    }

    fn advance(&mut self, c: char) {
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
    }

    fn flush_buffer(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.buffer);
        let kind = guess_kind(&text);
        if kind == TokenKind::Mismatch {
            return Err(self.tokenizing_error(
                &format!("invalid token '{text}'"),
                &text,
                self.saved_line,
                self.saved_col,
            ));
        }
        // strip the markers the kind already encodes
        let text = match kind {
            TokenKind::Capture | TokenKind::GetField => text[1..].to_owned(),
            TokenKind::Spread => text[3..].to_owned(),
            _ => text,
        };
        self.out.tokens.push(Token {
            kind,
            text,
            line: self.saved_line,
            col: self.saved_col,
        });
        Ok(())
    }

    fn tokenizing_error(&self, message: &str, snippet: &str, line: usize, col: usize) -> Error {
        Error::new(ErrorKind::Tokenizing, message)
            .with_loc(SourceLoc::new(self.filename, line, col))
            .with_context(render_context(self.code, line, col, snippet.chars().count()))
    }
}

/// Classifies a bare word, assuming groupings, strings, shorthands and
/// comments were already split off by the scanner.
#[must_use]
pub fn guess_kind(value: &str) -> TokenKind {
    if value.is_empty() {
        return TokenKind::Mismatch;
    }
    if is_number(value) {
        TokenKind::Number
    } else if OPERATORS.contains(&value) {
        TokenKind::Operator
    } else if KEYWORDS.contains(&value) {
        TokenKind::Keyword
    } else if let Some(rest) = value.strip_prefix('&') {
        if rest.is_empty() { TokenKind::Mismatch } else { TokenKind::Capture }
    } else if let Some(rest) = value.strip_prefix("...") {
        if rest.is_empty() { TokenKind::Mismatch } else { TokenKind::Spread }
    } else if value.starts_with('.') {
        if value.len() > 1 && !value[1..].contains('.') {
            TokenKind::GetField
        } else {
            TokenKind::Mismatch
        }
    } else {
        TokenKind::Identifier
    }
}

/// Matches `-?\d+(\.\d+)?([eE][+-]?\d+)?`.
fn is_number(value: &str) -> bool {
    let mut chars = value.chars().peekable();
    if chars.peek() == Some(&'-') {
        chars.next();
    }
    let mut digits = 0;
    while chars.peek().is_some_and(char::is_ascii_digit) {
        chars.next();
        digits += 1;
    }
    if digits == 0 {
        return false;
    }
    if chars.peek() == Some(&'.') {
        chars.next();
        let mut fraction = 0;
        while chars.peek().is_some_and(char::is_ascii_digit) {
            chars.next();
            fraction += 1;
        }
        if fraction == 0 {
            return false;
        }
    }
    if matches!(chars.peek(), Some('e' | 'E')) {
        chars.next();
        if matches!(chars.peek(), Some('+' | '-')) {
            chars.next();
        }
        let mut exponent = 0;
        while chars.peek().is_some_and(char::is_ascii_digit) {
            chars.next();
            exponent += 1;
        }
        if exponent == 0 {
            return false;
        }
    }
    chars.next().is_none()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(code: &str) -> Vec<(TokenKind, String)> {
        tokenize(code, "test.ark")
            .expect("tokenize failed")
            .tokens
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn scans_simple_form() {
        assert_eq!(
            kinds("(let x 42)"),
            vec![
                (TokenKind::Grouping, "(".to_owned()),
                (TokenKind::Keyword, "let".to_owned()),
                (TokenKind::Identifier, "x".to_owned()),
                (TokenKind::Number, "42".to_owned()),
                (TokenKind::Grouping, ")".to_owned()),
            ]
        );
    }

    #[test]
    fn scans_operators_and_namespaced_identifiers() {
        assert_eq!(
            kinds("(+ math:pi 1)"),
            vec![
                (TokenKind::Grouping, "(".to_owned()),
                (TokenKind::Operator, "+".to_owned()),
                (TokenKind::Identifier, "math:pi".to_owned()),
                (TokenKind::Number, "1".to_owned()),
                (TokenKind::Grouping, ")".to_owned()),
            ]
        );
    }

    #[test]
    fn negative_and_scientific_numbers() {
        assert_eq!(
            kinds("-3.5 1e10 2E-4"),
            vec![
                (TokenKind::Number, "-3.5".to_owned()),
                (TokenKind::Number, "1e10".to_owned()),
                (TokenKind::Number, "2E-4".to_owned()),
            ]
        );
    }

    #[test]
    fn capture_spread_and_getfield_are_stripped() {
        assert_eq!(
            kinds("&captured ...rest obj.field"),
            vec![
                (TokenKind::Capture, "captured".to_owned()),
                (TokenKind::Spread, "rest".to_owned()),
                (TokenKind::Identifier, "obj".to_owned()),
                (TokenKind::GetField, "field".to_owned()),
            ]
        );
    }

    #[test]
    fn shorthands_and_bang_equal() {
        assert_eq!(
            kinds("'x !{m} (!= a b)"),
            vec![
                (TokenKind::Shorthand, "'".to_owned()),
                (TokenKind::Identifier, "x".to_owned()),
                (TokenKind::Shorthand, "!".to_owned()),
                (TokenKind::Grouping, "{".to_owned()),
                (TokenKind::Identifier, "m".to_owned()),
                (TokenKind::Grouping, "}".to_owned()),
                (TokenKind::Grouping, "(".to_owned()),
                (TokenKind::Operator, "!=".to_owned()),
                (TokenKind::Identifier, "a".to_owned()),
                (TokenKind::Identifier, "b".to_owned()),
                (TokenKind::Grouping, ")".to_owned()),
            ]
        );
    }

    #[test]
    fn string_escapes_are_decoded() {
        let stream = tokenize(r#""a\tb\nA\x41""#, "test.ark").expect("tokenize failed");
        assert_eq!(stream.tokens.len(), 1);
        assert_eq!(stream.tokens[0].text, "a\tb\nAA");
    }

    #[test]
    fn comment_is_collected_not_tokenized() {
        let stream = tokenize("(let a 1) # the answer\n(+ a 1)", "test.ark").expect("tokenize failed");
        assert_eq!(stream.comments.len(), 1);
        assert_eq!(stream.comments[0].text, "the answer");
        assert_eq!(stream.comments[0].line, 0);
        assert!(stream.tokens.iter().all(|t| t.kind != TokenKind::Mismatch));
    }

    #[test]
    fn hash_inside_string_is_kept() {
        let stream = tokenize("\"# not a comment\"", "test.ark").expect("tokenize failed");
        assert_eq!(stream.tokens[0].text, "# not a comment");
        assert!(stream.comments.is_empty());
    }

    #[test]
    fn positions_are_zero_based_per_line() {
        let stream = tokenize("(a)\n  (b)", "test.ark").expect("tokenize failed");
        let b = &stream.tokens[4];
        assert_eq!((b.text.as_str(), b.line, b.col), ("b", 1, 3));
    }

    #[test]
    fn invalid_escape_is_a_tokenizing_error() {
        let err = tokenize(r#""\q""#, "test.ark").expect_err("expected error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Tokenizing);
    }

    #[test]
    fn lone_ampersand_is_invalid() {
        let err = tokenize("( & )", "test.ark").expect_err("expected error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Tokenizing);
        assert!(err.message().contains("invalid token"));
    }

    #[test]
    fn unterminated_string_is_reported() {
        let err = tokenize("\"abc", "test.ark").expect_err("expected error");
        assert!(err.message().contains("unterminated string"));
    }
}
