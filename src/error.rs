//! Error taxonomy shared by the parser, binder, evaluator and engine

use std::fmt;

use ariadne::{Color, Label, Report, ReportKind, Source};
use indexmap::IndexMap;
use thiserror::Error;

use crate::document::{LibraryError, SchemaError};
use crate::expr::EvalError;
use crate::params::ParamValidationError;
use crate::registry::{ActionError, ActionErrorKind};
use crate::value::Value;

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

/// Syntax error inside a `{{ ... }}` expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Parse error at {span:?}: {message}")]
    Syntax {
        span: Span,
        message: String,
        expected: Vec<String>,
    },
}

impl ParseError {
    pub fn syntax(span: Span, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            span,
            message: message.into(),
            expected: Vec::new(),
        }
    }

    pub fn span(&self) -> &Span {
        match self {
            ParseError::Syntax { span, .. } => span,
        }
    }

    /// Short message without the span prefix
    pub fn message(&self) -> String {
        match self {
            ParseError::Syntax {
                message, expected, ..
            } => {
                if expected.is_empty() {
                    message.clone()
                } else {
                    format!("{} (expected {})", message, expected.join(", "))
                }
            }
        }
    }

    /// Format the error with source context using ariadne
    pub fn format(&self, source: &str, filename: &str) -> String {
        let mut buf = Vec::new();
        match self {
            ParseError::Syntax {
                span,
                message,
                expected,
            } => {
                let expected_str = if expected.is_empty() {
                    String::new()
                } else {
                    format!("\nExpected: {}", expected.join(", "))
                };

                let written = Report::build(ReportKind::Error, filename, span.start)
                    .with_message(message)
                    .with_label(
                        Label::new((filename, span.clone()))
                            .with_message(format!("{}{}", message, expected_str))
                            .with_color(Color::Red),
                    )
                    .finish()
                    .write((filename, Source::from(source)), &mut buf);
                if written.is_err() {
                    return format!("{}: {}", filename, self.message());
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl<'a> From<chumsky::error::Rich<'a, crate::expr::lexer::Token>> for ParseError {
    fn from(err: chumsky::error::Rich<'a, crate::expr::lexer::Token>) -> Self {
        use chumsky::error::RichReason;

        let message = match err.reason() {
            RichReason::ExpectedFound { found, .. } => match found {
                Some(tok) => format!("Unexpected {}", format_token(tok)),
                None => "Unexpected end of expression".to_string(),
            },
            RichReason::Custom(msg) => msg.to_string(),
        };

        let expected: Vec<String> = err
            .expected()
            .filter_map(|e| match e {
                chumsky::error::RichPattern::Token(tok) => Some(format_token(tok)),
                chumsky::error::RichPattern::Label(label) => Some(label.to_string()),
                chumsky::error::RichPattern::EndOfInput => Some("end of expression".to_string()),
                chumsky::error::RichPattern::Identifier(s) => Some(format!("identifier '{}'", s)),
                chumsky::error::RichPattern::Any => Some("any token".to_string()),
                chumsky::error::RichPattern::SomethingElse => None,
            })
            .collect();

        ParseError::Syntax {
            span: err.span().into_range(),
            message,
            expected,
        }
    }
}

/// Format a token for human-readable error messages
fn format_token(tok: &crate::expr::lexer::Token) -> String {
    use crate::expr::lexer::Token;
    match tok {
        Token::Ident(s) => format!("name '{}'", s),
        Token::String(s) => format!("string \"{}\"", s),
        Token::Int(n) => format!("number {}", n),
        Token::Float(n) => format!("number {}", n),
        Token::True => "'true'".to_string(),
        Token::False => "'false'".to_string(),
        Token::Null => "'null'".to_string(),
        Token::And => "'and'".to_string(),
        Token::Or => "'or'".to_string(),
        Token::Not => "'not'".to_string(),
        Token::Plus => "'+'".to_string(),
        Token::Minus => "'-'".to_string(),
        Token::Star => "'*'".to_string(),
        Token::Slash => "'/'".to_string(),
        Token::Percent => "'%'".to_string(),
        Token::EqEq => "'=='".to_string(),
        Token::NotEq => "'!='".to_string(),
        Token::Less => "'<'".to_string(),
        Token::Greater => "'>'".to_string(),
        Token::LessOrEqual => "'<='".to_string(),
        Token::GreaterOrEqual => "'>='".to_string(),
        Token::Assign => "'='".to_string(),
        Token::Pipe => "'|'".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::Comma => "','".to_string(),
        Token::ParenOpen => "'('".to_string(),
        Token::ParenClose => "')'".to_string(),
        Token::BracketOpen => "'['".to_string(),
        Token::BracketClose => "']'".to_string(),
    }
}

/// Classification of a terminal or caught error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Schema,
    ParamValidation,
    Expression,
    Action(ActionErrorKind),
    Structural,
    LoopLimitExceeded,
    ExplicitFailure,
    SubMacro,
    MacroNotFound,
    Cancelled,
}

impl ErrorKind {
    /// Stable name used in the `type` field of results and `error` bindings
    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Schema => "SchemaError",
            ErrorKind::ParamValidation => "ParamValidationError",
            ErrorKind::Expression => "ExpressionError",
            ErrorKind::Action(kind) => kind.type_name(),
            ErrorKind::Structural => "StructuralError",
            ErrorKind::LoopLimitExceeded => "LoopLimitExceeded",
            ErrorKind::ExplicitFailure => "ExplicitFailure",
            ErrorKind::SubMacro => "SubMacroError",
            ErrorKind::MacroNotFound => "MacroNotFound",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Process exit code for this kind of failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::MacroNotFound => 3,
            ErrorKind::ParamValidation => 8,
            ErrorKind::Action(kind) => kind.exit_code(),
            _ => 1,
        }
    }

    /// Whether a `try` frame may intercept this error
    ///
    /// Loop-limit, structural and cancellation errors always end the run.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::LoopLimitExceeded | ErrorKind::Structural | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// The single error record a failed or aborted run reports
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    /// Name of the action that raised the error (label or action name)
    pub action: Option<String>,
    /// Execution-order index of the raising action
    pub action_index: Option<usize>,
    pub context: IndexMap<String, Value>,
    /// The wrapped failure of a sub-macro
    pub cause: Option<Box<ErrorDescriptor>>,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action: None,
            action_index: None,
            context: IndexMap::new(),
            cause: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, index: usize) -> Self {
        self.action = Some(action.into());
        self.action_index = Some(index);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorDescriptor) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Exit code; sub-macro failures report the code of what they wrap
    pub fn exit_code(&self) -> i32 {
        match (&self.kind, &self.cause) {
            (ErrorKind::SubMacro, Some(cause)) => cause.exit_code(),
            (kind, _) => kind.exit_code(),
        }
    }

    /// The innermost wrapped error
    pub fn root_cause(&self) -> &ErrorDescriptor {
        match &self.cause {
            Some(cause) => cause.root_cause(),
            None => self,
        }
    }

    /// Read-only view exposed as `error` inside a catch body
    pub fn to_value(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert("type".to_string(), Value::from(self.kind.type_name()));
        map.insert("message".to_string(), Value::from(self.message.clone()));
        map.insert(
            "action".to_string(),
            self.action.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert(
            "action_index".to_string(),
            self.action_index
                .map(|i| Value::Int(i as i64))
                .unwrap_or(Value::Null),
        );
        map.insert("context".to_string(), Value::Map(self.context.clone()));
        Value::Map(map)
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let (Some(action), Some(index)) = (&self.action, self.action_index) {
            write!(f, " (action '{}' #{})", action, index)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorDescriptor {}

impl From<ActionError> for ErrorDescriptor {
    fn from(err: ActionError) -> Self {
        Self {
            context: err.context,
            ..Self::new(ErrorKind::Action(err.kind), err.message)
        }
    }
}

impl From<EvalError> for ErrorDescriptor {
    fn from(err: EvalError) -> Self {
        Self::new(ErrorKind::Expression, err.to_string())
    }
}

impl From<SchemaError> for ErrorDescriptor {
    fn from(err: SchemaError) -> Self {
        let issues = err.issues.iter().map(|i| Value::String(i.to_string())).collect();
        Self::new(ErrorKind::Schema, "invalid macro document")
            .with_context("issues", Value::List(issues))
    }
}

impl From<ParamValidationError> for ErrorDescriptor {
    fn from(err: ParamValidationError) -> Self {
        let failures = err
            .failures
            .iter()
            .map(|f| Value::String(f.to_string()))
            .collect();
        Self::new(ErrorKind::ParamValidation, "parameter validation failed")
            .with_context("failures", Value::List(failures))
    }
}

impl From<LibraryError> for ErrorDescriptor {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::NotFound { name } => {
                Self::new(ErrorKind::MacroNotFound, format!("macro not found: {}", name))
                    .with_context("macro", name)
            }
            LibraryError::Schema { path, source } => ErrorDescriptor::from(source)
                .with_context("path", path.display().to_string()),
            other @ LibraryError::Io { .. } => {
                Self::new(ErrorKind::MacroNotFound, other.to_string())
            }
            other @ LibraryError::Duplicate { .. } => {
                Self::new(ErrorKind::Schema, other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::MacroNotFound.exit_code(), 3);
        assert_eq!(ErrorKind::ParamValidation.exit_code(), 8);
        assert_eq!(ErrorKind::Action(ActionErrorKind::TemplateNotFound).exit_code(), 4);
        assert_eq!(ErrorKind::Action(ActionErrorKind::Timeout).exit_code(), 5);
        assert_eq!(ErrorKind::Action(ActionErrorKind::ElementNotFound).exit_code(), 5);
        assert_eq!(ErrorKind::Action(ActionErrorKind::WindowNotFound).exit_code(), 6);
        assert_eq!(ErrorKind::Action(ActionErrorKind::Failed).exit_code(), 7);
        assert_eq!(ErrorKind::Action(ActionErrorKind::DependencyMissing).exit_code(), 9);
        assert_eq!(ErrorKind::ExplicitFailure.exit_code(), 1);
    }

    #[test]
    fn test_sub_macro_reports_wrapped_code() {
        let inner = ErrorDescriptor::new(
            ErrorKind::Action(ActionErrorKind::WindowNotFound),
            "no window",
        );
        let outer = ErrorDescriptor::new(ErrorKind::SubMacro, "call failed").with_cause(inner);
        assert_eq!(outer.exit_code(), 6);
        assert_eq!(outer.root_cause().message, "no window");
    }

    #[test]
    fn test_error_binding_shape() {
        let err = ErrorDescriptor::new(ErrorKind::ExplicitFailure, "boom")
            .with_action("fail", 3)
            .with_context("elapsed_ms", Value::Int(0));
        let value = err.to_value();
        let map = value.as_map().unwrap();
        assert_eq!(map["type"], Value::from("ExplicitFailure"));
        assert_eq!(map["message"], Value::from("boom"));
        assert_eq!(map["action_index"], Value::Int(3));
    }

    #[test]
    fn test_parse_error_format_mentions_message() {
        let err = ParseError::syntax(3..4, "Unexpected '+'");
        let report = err.format("1 + + 2", "expr");
        assert!(report.contains("Unexpected '+'"));
    }
}
