//! Token types and source location tracking for the Kestrel lexer.
//!
//! Every [`Token`] carries a [`Span`] pointing back into the original source
//! text. Spans flow through the parser into the AST and from there into the
//! compiler's line table, so runtime errors can name a line and column.

use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Source location
// ─────────────────────────────────────────────────────────────────────────────

/// A half-open byte range `[start, end)` within the original source string,
/// together with 1-indexed line and column numbers of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
    /// Column in characters, not bytes.
    pub col: u32,
}

impl Span {
    #[inline]
    pub fn new(start: usize, end: usize, line: u32, col: u32) -> Self {
        Self {
            start,
            end,
            line,
            col,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Cover both spans; line/col come from whichever starts first.
    pub fn merge(self, other: Self) -> Self {
        let (line, col) = if self.start <= other.start {
            (self.line, self.col)
        } else {
            (other.line, other.col)
        };
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line,
            col,
        }
    }

    /// Zero-length span for synthetic nodes.
    #[inline]
    pub fn dummy() -> Self {
        Self::default()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    #[inline]
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.span)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TokenKind
// ─────────────────────────────────────────────────────────────────────────────

/// The complete set of token kinds in the Kestrel language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // ── Literals ──────────────────────────────────────────────────────────────
    Int(i64),
    Float(f64),
    /// Escape sequences already resolved.
    Str(String),
    True,
    False,
    Null,

    Ident(String),

    // ── Keywords ──────────────────────────────────────────────────────────────
    Var,
    Const,
    Function,
    Struct,
    Return,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    This,
    Export,
    Static,
    Private,
    Constructor,
    Default,

    // ── Operators ─────────────────────────────────────────────────────────────
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    LtLt,
    GtGt,
    Bang,
    AmpAmp,
    PipePipe,
    EqEq,
    BangEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    PlusPlus,
    MinusMinus,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    LtLtEq,
    GtGtEq,
    Dot,

    // ── Punctuation ───────────────────────────────────────────────────────────
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,

    Eof,
}

impl TokenKind {
    /// Source text of fixed tokens.
    pub fn lexeme(&self) -> Option<&'static str> {
        use TokenKind::*;
        Some(match self {
            True => "true",
            False => "false",
            Null => "null",
            Var => "var",
            Const => "const",
            Function => "function",
            Struct => "struct",
            Return => "return",
            If => "if",
            Else => "else",
            While => "while",
            For => "for",
            Break => "break",
            Continue => "continue",
            This => "this",
            Export => "export",
            Static => "static",
            Private => "private",
            Constructor => "constructor",
            Default => "default",
            Plus => "+",
            Minus => "-",
            Star => "*",
            StarStar => "**",
            Slash => "/",
            Percent => "%",
            Amp => "&",
            Pipe => "|",
            Caret => "^",
            Tilde => "~",
            LtLt => "<<",
            GtGt => ">>",
            Bang => "!",
            AmpAmp => "&&",
            PipePipe => "||",
            EqEq => "==",
            BangEq => "!=",
            Lt => "<",
            Gt => ">",
            LtEq => "<=",
            GtEq => ">=",
            PlusPlus => "++",
            MinusMinus => "--",
            Eq => "=",
            PlusEq => "+=",
            MinusEq => "-=",
            StarEq => "*=",
            SlashEq => "/=",
            PercentEq => "%=",
            AmpEq => "&=",
            PipeEq => "|=",
            CaretEq => "^=",
            LtLtEq => "<<=",
            GtGtEq => ">>=",
            Dot => ".",
            LParen => "(",
            RParen => ")",
            LBrace => "{",
            RBrace => "}",
            LBracket => "[",
            RBracket => "]",
            Comma => ",",
            Semicolon => ";",
            Int(_) | Float(_) | Str(_) | Ident(_) | Eof => return None,
        })
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Int(n) => write!(f, "integer `{n}`"),
            TokenKind::Float(n) => write!(f, "float `{n}`"),
            TokenKind::Str(_) => write!(f, "string literal"),
            TokenKind::Ident(s) => write!(f, "identifier `{s}`"),
            TokenKind::Eof => write!(f, "end of file"),
            other => write!(f, "`{}`", other.lexeme().unwrap_or("?")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyword table
// ─────────────────────────────────────────────────────────────────────────────

/// Map a bare identifier to its keyword [`TokenKind`], if it is one.
///
/// Type names (`int`, `float`, `string`, ...) are not reserved; the parser
/// recognises them in declaration position.
pub fn keyword(s: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match s {
        "true" => True,
        "false" => False,
        "null" => Null,
        "var" => Var,
        "const" => Const,
        "function" => Function,
        "struct" => Struct,
        "return" => Return,
        "if" => If,
        "else" => Else,
        "while" => While,
        "for" => For,
        "break" => Break,
        "continue" => Continue,
        "this" => This,
        "export" => Export,
        "static" => Static,
        "private" => Private,
        "constructor" => Constructor,
        "default" => Default,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_merge() {
        let a = Span::new(0, 5, 1, 1);
        let b = Span::new(3, 10, 1, 4);
        let m = a.merge(b);
        assert_eq!((m.start, m.end, m.line, m.col), (0, 10, 1, 1));
    }

    #[test]
    fn test_keyword_recognition() {
        assert_eq!(keyword("var"), Some(TokenKind::Var));
        assert_eq!(keyword("constructor"), Some(TokenKind::Constructor));
        assert_eq!(keyword("null"), Some(TokenKind::Null));
        assert_eq!(keyword("int"), None, "type names are not reserved");
        assert_eq!(keyword("foo"), None);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(TokenKind::StarStar.to_string(), "`**`");
        assert_eq!(TokenKind::Ident("foo".into()).to_string(), "identifier `foo`");
        assert_eq!(TokenKind::LBrace.to_string(), "`{`");
        assert_eq!(TokenKind::Eof.to_string(), "end of file");
    }
}
