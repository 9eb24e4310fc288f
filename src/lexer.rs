//! Hand-rolled lexer (scanner) for the Kestrel language.
//!
//! The [`Lexer`] consumes a source string and produces a flat `Vec<Token>`
//! ending with [`TokenKind::Eof`]. Whitespace, `//` line comments and
//! `/* */` block comments are skipped.
//!
//! # Error Handling
//!
//! Lexer errors are collected rather than aborting the scan, so a single
//! pass reports every bad character or literal. Call [`Lexer::scan`] to get
//! both the token stream and the error list.

use thiserror::Error;

use crate::token::{keyword, Span, Token, TokenKind};

/// The Kestrel lexical scanner.
pub struct Lexer<'src> {
    chars: std::str::CharIndices<'src>,
    /// The current character and its byte offset, or `None` at EOF.
    current: Option<(usize, char)>,
    /// One character of lookahead past `current`.
    peeked: Option<(usize, char)>,
    line: u32,
    col: u32,
    /// Byte offset just past the last consumed character.
    pos: usize,
    errors: Vec<LexError>,
}

/// A non-fatal lexical error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{}:{}] {message}", span.line, span.col)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        let mut chars = src.char_indices();
        let current = chars.next();
        let peeked = chars.next();
        Self {
            chars,
            current,
            peeked,
            line: 1,
            col: 1,
            pos: 0,
            errors: Vec::new(),
        }
    }

    /// Run the full scan, returning `(tokens, errors)`.
    pub fn scan(mut self) -> (Vec<Token>, Vec<LexError>) {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            let Some((start, ch)) = self.current else {
                let span = Span::new(self.pos, self.pos, self.line, self.col);
                tokens.push(Token::new(TokenKind::Eof, span));
                break;
            };
            let (line, col) = (self.line, self.col);
            self.advance();
            if let Some(kind) = self.next_kind(ch, start, line, col) {
                tokens.push(Token::new(kind, self.make_span(start, line, col)));
            }
        }
        (tokens, self.errors)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal scanning helpers
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    fn peek(&self) -> Option<char> {
        self.current.map(|(_, c)| c)
    }

    #[inline]
    fn peek2(&self) -> Option<char> {
        self.peeked.map(|(_, c)| c)
    }

    fn advance(&mut self) -> Option<char> {
        let result = self.current;
        self.current = self.peeked;
        self.peeked = self.chars.next();

        let (offset, ch) = result?;
        self.pos = offset + ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    #[inline]
    fn make_span(&self, start_pos: usize, start_line: u32, start_col: u32) -> Span {
        Span::new(start_pos, self.pos, start_line, start_col)
    }

    fn error(&mut self, message: impl Into<String>, start_pos: usize, line: u32, col: u32) {
        let span = self.make_span(start_pos, line, col);
        self.errors.push(LexError {
            message: message.into(),
            span,
        });
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match (self.peek(), self.peek2()) {
                (Some(c), _) if c.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    let (start, line, col) = (self.pos, self.line, self.col);
                    self.advance();
                    self.advance();
                    loop {
                        match (self.peek(), self.peek2()) {
                            (Some('*'), Some('/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => {
                                self.error("unterminated block comment", start, line, col);
                                break;
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// `first` has been consumed; returns `None` for an unrecognised
    /// character (already reported).
    fn next_kind(&mut self, first: char, start: usize, line: u32, col: u32) -> Option<TokenKind> {
        use TokenKind::*;

        let kind = match first {
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            ',' => Comma,
            ';' => Semicolon,
            '.' => Dot,
            '~' => Tilde,

            '+' => self.pick(&[('+', PlusPlus), ('=', PlusEq)], Plus),
            '-' => self.pick(&[('-', MinusMinus), ('=', MinusEq)], Minus),
            '*' => {
                if self.eat('*') {
                    StarStar
                } else {
                    self.pick(&[('=', StarEq)], Star)
                }
            }
            '/' => self.pick(&[('=', SlashEq)], Slash),
            '%' => self.pick(&[('=', PercentEq)], Percent),
            '^' => self.pick(&[('=', CaretEq)], Caret),
            '!' => self.pick(&[('=', BangEq)], Bang),
            '=' => self.pick(&[('=', EqEq)], Eq),
            '&' => self.pick(&[('&', AmpAmp), ('=', AmpEq)], Amp),
            '|' => self.pick(&[('|', PipePipe), ('=', PipeEq)], Pipe),
            '<' => {
                if self.eat('<') {
                    self.pick(&[('=', LtLtEq)], LtLt)
                } else {
                    self.pick(&[('=', LtEq)], Lt)
                }
            }
            '>' => {
                if self.eat('>') {
                    self.pick(&[('=', GtGtEq)], GtGt)
                } else {
                    self.pick(&[('=', GtEq)], Gt)
                }
            }

            '"' => self.scan_string(start, line, col),
            c if c.is_ascii_digit() => self.scan_number(c, start, line, col),
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                ident.push(c);
                while let Some(c) = self.peek().filter(|c| c.is_alphanumeric() || *c == '_') {
                    ident.push(c);
                    self.advance();
                }
                keyword(&ident).unwrap_or(Ident(ident))
            }

            other => {
                self.error(format!("unexpected character `{other}`"), start, line, col);
                return None;
            }
        };
        Some(kind)
    }

    /// Consume the first matching follow-up character, else `fallback`.
    fn pick(&mut self, options: &[(char, TokenKind)], fallback: TokenKind) -> TokenKind {
        for (c, kind) in options {
            if self.eat(*c) {
                return kind.clone();
            }
        }
        fallback
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sub-scanners
    // ─────────────────────────────────────────────────────────────────────────

    fn take_digits(&mut self, raw: &mut String, radix: u32) {
        while let Some(c) = self.peek() {
            if c == '_' {
                self.advance();
            } else if c.is_digit(radix) {
                raw.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Integers (decimal or `0x` hex, `_` separators) and floats with an
    /// optional fraction and exponent.
    fn scan_number(&mut self, first: char, start: usize, line: u32, col: u32) -> TokenKind {
        if first == '0' && matches!(self.peek(), Some('x' | 'X')) {
            self.advance();
            let mut raw = String::new();
            self.take_digits(&mut raw, 16);
            return match u64::from_str_radix(&raw, 16) {
                Ok(v) => TokenKind::Int(v as i64),
                Err(_) => {
                    self.error(format!("invalid hex literal `0x{raw}`"), start, line, col);
                    TokenKind::Int(0)
                }
            };
        }

        let mut raw = String::new();
        raw.push(first);
        self.take_digits(&mut raw, 10);

        let mut is_float = false;
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            raw.push('.');
            self.advance();
            self.take_digits(&mut raw, 10);
        }
        if matches!(self.peek(), Some('e' | 'E'))
            && self
                .peek2()
                .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+')
        {
            is_float = true;
            raw.push('e');
            self.advance();
            if let Some(sign) = self.peek().filter(|c| *c == '-' || *c == '+') {
                raw.push(sign);
                self.advance();
            }
            self.take_digits(&mut raw, 10);
        }

        if is_float {
            raw.parse::<f64>().map(TokenKind::Float).unwrap_or_else(|_| {
                self.error(format!("invalid float literal `{raw}`"), start, line, col);
                TokenKind::Float(0.0)
            })
        } else {
            raw.parse::<i64>().map(TokenKind::Int).unwrap_or_else(|_| {
                self.error(format!("integer literal `{raw}` overflows i64"), start, line, col);
                TokenKind::Int(0)
            })
        }
    }

    /// The opening `"` has been consumed.
    fn scan_string(&mut self, start: usize, line: u32, col: u32) -> TokenKind {
        let mut text = String::new();
        loop {
            match self.advance() {
                None => {
                    self.error("unterminated string literal", start, line, col);
                    break;
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(c) => {
                        self.error(format!("unknown string escape `\\{c}`"), start, line, col);
                        text.push(c);
                    }
                    None => {
                        self.error("unterminated string escape at end of file", start, line, col);
                        break;
                    }
                },
                Some(c) => text.push(c),
            }
        }
        TokenKind::Str(text)
    }
}

/// Lex `src` and return `(tokens, errors)`.
pub fn lex(src: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(src).scan()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (toks, errs) = lex(src);
        assert!(errs.is_empty(), "unexpected lex errors: {errs:?}");
        toks.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("+ += ++ ** *= << <<= >= >> >>= && & &= || |= ^= != =="),
            vec![
                Plus, PlusEq, PlusPlus, StarStar, StarEq, LtLt, LtLtEq, GtEq, GtGt, GtGtEq,
                AmpAmp, Amp, AmpEq, PipePipe, PipeEq, CaretEq, BangEq, EqEq, Eof
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        use TokenKind::*;
        assert_eq!(
            kinds("var x = this; struct P constructor int"),
            vec![
                Var,
                Ident("x".into()),
                Eq,
                This,
                Semicolon,
                Struct,
                Ident("P".into()),
                Constructor,
                Ident("int".into()),
                Eof
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        use TokenKind::*;
        assert_eq!(
            kinds("42 1_000 0xff 3.5 1e3 2.5e-1"),
            vec![Int(42), Int(1000), Int(255), Float(3.5), Float(1000.0), Float(0.25), Eof]
        );
    }

    #[test]
    fn test_member_access_on_integer_is_not_float() {
        use TokenKind::*;
        assert_eq!(kinds("1.x"), vec![Int(1), Dot, Ident("x".into()), Eof]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\n\t\"b\\""#),
            vec![TokenKind::Str("a\n\t\"b\\".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        use TokenKind::*;
        assert_eq!(kinds("1 // one\n /* two\n */ 3"), vec![Int(1), Int(3), Eof]);
    }

    #[test]
    fn test_errors_are_collected() {
        let (toks, errs) = lex("var a = \"open\n$ 1");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].to_string().starts_with("[1:9]"));
        assert!(toks.last().unwrap().is_eof());

        let (_, errs) = lex("a $ b # c");
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_spans() {
        let (toks, _) = lex("var\n  x");
        assert_eq!((toks[0].span.line, toks[0].span.col), (1, 1));
        assert_eq!((toks[1].span.line, toks[1].span.col), (2, 3));
        assert_eq!(toks[1].span.start, 6);
    }
}
