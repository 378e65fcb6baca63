//! `{{ ... }}` templates and compiled document fields

use indexmap::IndexMap;

use crate::error::ParseError;
use crate::expr::ast::{Expr, Spanned};
use crate::expr::eval::{EvalError, Evaluator};
use crate::expr::grammar::parse_expression_at;
use crate::value::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Expr(Spanned<Expr>),
}

/// A field string with embedded expressions, parsed once
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

/// Byte offset of the `}}` closing an expression that starts at `from`,
/// skipping over quoted string literals
fn find_close(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut quote = None;
    let mut i = from;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (Some(_), b'\\') => i += 1,
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'\'' | b'"') => quote = Some(bytes[i]),
            (None, _) if source[i..].starts_with(CLOSE) => return Some(i),
            (None, _) => {}
        }
        i += 1;
    }
    None
}

impl Template {
    /// Split a field string into text and expression parts
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let mut parts = Vec::new();
        let mut rest = 0;
        while let Some(found) = source[rest..].find(OPEN) {
            let open = rest + found;
            if open > rest {
                parts.push(Part::Text(source[rest..open].to_string()));
            }
            let inner_start = open + OPEN.len();
            let close = find_close(source, inner_start).ok_or_else(|| {
                ParseError::syntax(open..source.len(), "Unterminated '{{' in template")
            })?;
            let expr = parse_expression_at(&source[inner_start..close], inner_start)?;
            parts.push(Part::Expr(expr));
            rest = close + CLOSE.len();
        }
        if rest < source.len() {
            parts.push(Part::Text(source[rest..].to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// Parse a bare expression (no delimiters), as `condition` accepts
    pub fn expression(source: &str) -> Result<Self, ParseError> {
        let expr = parse_expression_at(source, 0)?;
        Ok(Self {
            source: source.to_string(),
            parts: vec![Part::Expr(expr)],
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Whether the template contains any expression at all
    pub fn has_expressions(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Expr(_)))
    }

    /// The sole expression when the field is one whole expression
    ///
    /// Whitespace around the delimiters does not count as text.
    fn whole_expression(&self) -> Option<&Spanned<Expr>> {
        let mut found = None;
        for part in &self.parts {
            match part {
                Part::Text(text) if text.trim().is_empty() => {}
                Part::Expr(expr) if found.is_none() => found = Some(expr),
                _ => return None,
            }
        }
        found
    }

    /// Evaluate: a whole-expression template keeps the native type, anything
    /// else renders to a string
    pub fn evaluate(&self, evaluator: &Evaluator<'_>) -> Result<Value, EvalError> {
        if let Some(expr) = self.whole_expression() {
            return evaluator.eval(expr);
        }
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Expr(expr) => out.push_str(&evaluator.eval(expr)?.render()),
            }
        }
        Ok(Value::String(out))
    }
}

/// A document value with its templates compiled
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Literal(Value),
    Template(Template),
    List(Vec<Field>),
    Map(IndexMap<String, Field>),
}

impl Field {
    /// Compile a document value, parsing every template string inside it
    ///
    /// Errors carry the dotted sub-path of the offending string, the string
    /// itself and the parse error.
    pub fn compile(value: Value) -> Result<Self, Vec<(String, String, ParseError)>> {
        let mut errors = Vec::new();
        let field = Self::compile_at(value, String::new(), &mut errors);
        if errors.is_empty() {
            Ok(field)
        } else {
            Err(errors)
        }
    }

    fn compile_at(
        value: Value,
        path: String,
        errors: &mut Vec<(String, String, ParseError)>,
    ) -> Self {
        match value {
            Value::String(s) if s.contains(OPEN) => match Template::parse(&s) {
                Ok(template) => Field::Template(template),
                Err(err) => {
                    errors.push((path, s.clone(), err));
                    Field::Literal(Value::String(s))
                }
            },
            Value::List(items) => Field::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Self::compile_at(item, format!("{}[{}]", path, i), errors))
                    .collect(),
            ),
            Value::Map(map) => Field::Map(
                map.into_iter()
                    .map(|(key, item)| {
                        let sub = if path.is_empty() {
                            key.clone()
                        } else {
                            format!("{}.{}", path, key)
                        };
                        let field = Self::compile_at(item, sub, errors);
                        (key, field)
                    })
                    .collect(),
            ),
            other => Field::Literal(other),
        }
    }

    /// Compile a condition: a template if it has delimiters, else a bare expression
    pub fn condition(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::String(s) if s.contains(OPEN) => Template::parse(&s).map(Field::Template),
            Value::String(s) => Template::expression(&s).map(Field::Template),
            other => Ok(Field::Literal(other)),
        }
    }

    pub fn evaluate(&self, evaluator: &Evaluator<'_>) -> Result<Value, EvalError> {
        match self {
            Field::Literal(value) => Ok(value.clone()),
            Field::Template(template) => template.evaluate(evaluator),
            Field::List(items) => items
                .iter()
                .map(|item| item.evaluate(evaluator))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Field::Map(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), item.evaluate(evaluator)?);
                }
                Ok(Value::Map(out))
            }
        }
    }

    /// Source text for log lines and error context
    pub fn describe(&self) -> String {
        match self {
            Field::Literal(value) => value.render(),
            Field::Template(template) => template.source().to_string(),
            Field::List(_) | Field::Map(_) => "<structured>".to_string(),
        }
    }
}
