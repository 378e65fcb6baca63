//! Template expression language: `{{ params.user | upper }}`

pub mod ast;
pub mod eval;
mod grammar;
pub mod lexer;
pub mod template;

pub use ast::*;
pub use eval::{Bindings, EvalError, Evaluator, Host, NoHost};
pub use grammar::{parse_expression, parse_expression_at};
pub use template::{Field, Part, Template};
