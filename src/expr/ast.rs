//! Abstract syntax tree for template expressions

use crate::error::Span;
use crate::value::Value;

/// AST node with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// An expression inside `{{ ... }}`
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `42`, `"text"`, `true`, `null`
    Literal(Value),
    /// `[a, b]`
    List(Vec<Spanned<Expr>>),
    /// Bare name: `x`, `params`
    Name(String),
    /// `target.name`
    Attr {
        target: Box<Spanned<Expr>>,
        name: String,
    },
    /// `target[index]`, also `target.0`
    Index {
        target: Box<Spanned<Expr>>,
        index: Box<Spanned<Expr>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    /// `value | name` or `value | name(args)`
    Filter {
        value: Box<Spanned<Expr>>,
        name: String,
        args: Vec<Spanned<Expr>>,
    },
    /// `function(args, key=value)`
    Call {
        function: String,
        args: Vec<Spanned<Expr>>,
        kwargs: Vec<(String, Spanned<Expr>)>,
    },
}
