//! Abstract Syntax Tree (AST) node types for the Kestrel language.
//!
//! The AST is the output of the parser and the input to the compiler. Every
//! node carries a [`Span`] so compile errors and the runtime line table can
//! point back into the source text. All strings are owned, so the tree does
//! not borrow from the source.

use crate::arith::IncrOp;
use crate::token::Span;

/// A parsed source file: the statements of the module body.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
    pub span: Span,
}

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

/// `var x = e;`, `const x = e;`, `var<int, float> x = e;`, `int x = e;`
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    /// Declared type names; empty means unrestricted.
    pub types: Vec<String>,
    pub is_const: bool,
    pub init: Option<Expr>,
    pub exported: bool,
    pub span: Span,
}

/// A function parameter with optional type restriction and default.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub types: Vec<String>,
    pub default: Option<Expr>,
    pub span: Span,
}

/// A named or anonymous function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructItemKind {
    /// `var m = e;` (or a static with `is_static`).
    Member { types: Vec<String>, init: Option<Expr> },
    Method(FunctionDecl),
    Constructor(FunctionDecl),
    /// `constructor() = default;`
    DefaultConstructor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructItem {
    pub name: String,
    pub kind: StructItemKind,
    pub is_static: bool,
    pub is_private: bool,
    pub is_const: bool,
    pub span: Span,
}

/// `struct Name { ... }` or an anonymous `struct { ... }` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: Option<String>,
    pub items: Vec<StructItem>,
    pub span: Span,
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Var(VarDecl),
    Function {
        decl: FunctionDecl,
        exported: bool,
    },
    Struct {
        decl: StructDecl,
        exported: bool,
    },
    Expr(Expr),
    Return(Option<Expr>, Span),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    Block(Vec<Stmt>, Span),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Var(v) => v.span,
            Stmt::Function { decl, .. } => decl.span,
            Stmt::Struct { decl, .. } => decl.span,
            Stmt::Expr(e) => e.span(),
            Stmt::Return(_, span)
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Break(span)
            | Stmt::Continue(span)
            | Stmt::Block(_, span) => *span,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null(Span),
    Bool(bool, Span),
    Int(i64, Span),
    Float(f64, Span),
    Str(String, Span),
    Ident(String, Span),
    This(Span),
    Array(Vec<Expr>, Span),
    /// `{ k = v, ["k"] = v }`; bare keys are lowered to string keys.
    Table(Vec<(Expr, Expr)>, Span),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    /// Short-circuit `&&` (`is_and`) or `||`.
    Logical {
        is_and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    /// `target = value` or a compound `target op= value`.
    Assign {
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
        span: Span,
    },
    Incr {
        op: IncrOp,
        target: Box<Expr>,
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    Field {
        object: Box<Expr>,
        name: String,
        span: Span,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    MethodCall {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Function(Box<FunctionDecl>),
    Struct(Box<StructDecl>),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Null(s)
            | Expr::Bool(_, s)
            | Expr::Int(_, s)
            | Expr::Float(_, s)
            | Expr::Str(_, s)
            | Expr::Ident(_, s)
            | Expr::This(s)
            | Expr::Array(_, s)
            | Expr::Table(_, s) => *s,
            Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Logical { span, .. }
            | Expr::Assign { span, .. }
            | Expr::Incr { span, .. }
            | Expr::Call { span, .. }
            | Expr::Field { span, .. }
            | Expr::Index { span, .. }
            | Expr::MethodCall { span, .. } => *span,
            Expr::Function(f) => f.span,
            Expr::Struct(s) => s.span,
        }
    }

    /// Whether the expression can appear left of `=`.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Expr::Ident(..) | Expr::Field { .. } | Expr::Index { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}
