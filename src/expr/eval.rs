//! Expression evaluation against a layered variable environment

use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Duration;

use indexmap::IndexMap;
use thiserror::Error;

use crate::expr::ast::{BinaryOp, Expr, Spanned, UnaryOp};
use crate::value::Value;

/// Longest list `range()` may build
pub const MAX_RANGE_LEN: usize = 100_000;

/// Name resolution for an evaluation
///
/// `resolve("params")`, `resolve("vars")` and `resolve("env")` return the
/// namespaces themselves; any other name follows the bare-name lookup order of
/// the implementor.
pub trait Bindings {
    fn resolve(&self, name: &str) -> Option<Cow<'_, Value>>;
}

/// Side-effecting builtins delegated to the host
pub trait Host {
    /// Run `sh -c command` and return its trimmed stdout
    fn shell(&self, command: &str, timeout: Duration) -> Result<String, String>;

    /// Ask a registered action for a value
    fn query(&self, action: &str, args: IndexMap<String, Value>) -> Result<Value, String>;
}

/// Host that refuses every side effect
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl Host for NoHost {
    fn shell(&self, command: &str, _timeout: Duration) -> Result<String, String> {
        Err(format!("shell is not available here (command: {})", command))
    }

    fn query(&self, action: &str, _args: IndexMap<String, Value>) -> Result<Value, String> {
        Err(format!("query is not available here (action: {})", action))
    }
}

impl Bindings for IndexMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("undefined name '{0}'")]
    UndefinedName(String),

    #[error("{target} has no attribute '{name}'")]
    NoAttribute { target: &'static str, name: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("cannot index {target} with {index}")]
    BadIndex {
        target: &'static str,
        index: &'static str,
    },

    #[error("unsupported operand types for '{op}': {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("bad operand type for unary '{op}': {operand}")]
    BadOperand {
        op: &'static str,
        operand: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in '{0}'")]
    Overflow(&'static str),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}: {message}")]
    BadArguments { function: String, message: String },

    #[error("{function} failed: {message}")]
    CallFailed { function: String, message: String },

    #[error("cannot convert {value} to {target}")]
    Conversion { target: &'static str, value: String },

    #[error("{0} is not iterable")]
    NotIterable(&'static str),
}

/// Evaluator for parsed expressions
pub struct Evaluator<'a> {
    bindings: &'a dyn Bindings,
    host: &'a dyn Host,
    shell_timeout: Duration,
}

impl<'a> Evaluator<'a> {
    pub fn new(bindings: &'a dyn Bindings, host: &'a dyn Host) -> Self {
        Self {
            bindings,
            host,
            shell_timeout: Duration::from_secs(30),
        }
    }

    /// Default timeout of the `shell()` builtin
    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }

    pub fn eval(&self, expr: &Spanned<Expr>) -> Result<Value, EvalError> {
        match &expr.node {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Name(name) => self
                .bindings
                .resolve(name)
                .map(Cow::into_owned)
                .ok_or_else(|| EvalError::UndefinedName(name.clone())),
            Expr::Attr { target, name } => self.attr(target, name),
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Filter { value, name, args } => {
                let value = self.eval(value)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                apply_filter(name, value, &args)
            }
            Expr::Call {
                function,
                args,
                kwargs,
            } => self.call(function, args, kwargs),
        }
    }

    /// Attribute access, borrowing namespaces instead of cloning them
    fn attr(&self, target: &Spanned<Expr>, name: &str) -> Result<Value, EvalError> {
        if let Expr::Name(base) = &target.node {
            let resolved = self
                .bindings
                .resolve(base)
                .ok_or_else(|| EvalError::UndefinedName(base.clone()))?;
            return match resolved.as_ref() {
                Value::Map(map) => map.get(name).cloned().ok_or_else(|| {
                    if matches!(base.as_str(), "params" | "vars" | "env") {
                        EvalError::UndefinedName(format!("{}.{}", base, name))
                    } else {
                        EvalError::NoAttribute {
                            target: "map",
                            name: name.to_string(),
                        }
                    }
                }),
                other => attr_value(other, name),
            };
        }
        let value = self.eval(target)?;
        attr_value(&value, name)
    }

    fn binary(
        &self,
        op: BinaryOp,
        left: &Spanned<Expr>,
        right: &Spanned<Expr>,
    ) -> Result<Value, EvalError> {
        match op {
            BinaryOp::And => {
                let left = self.eval(left)?;
                if !left.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::Or => {
                let left = self.eval(left)?;
                if left.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            _ => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(op, left, right)
            }
        }
    }

    fn call(
        &self,
        function: &str,
        args: &[Spanned<Expr>],
        kwargs: &[(String, Spanned<Expr>)],
    ) -> Result<Value, EvalError> {
        let args = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut named = IndexMap::new();
        for (name, expr) in kwargs {
            named.insert(name.clone(), self.eval(expr)?);
        }
        let bad = |message: &str| EvalError::BadArguments {
            function: function.to_string(),
            message: message.to_string(),
        };

        match function {
            "shell" => {
                let command = match (args.first(), named.get("command")) {
                    (Some(Value::String(s)), None) | (None, Some(Value::String(s))) => s.clone(),
                    _ => return Err(bad("expected a command string")),
                };
                let timeout = match args.get(1).or_else(|| named.get("timeout")) {
                    None => self.shell_timeout,
                    Some(value) => value
                        .as_f64()
                        .filter(|secs| *secs > 0.0)
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                        .ok_or_else(|| bad("timeout must be a positive number of seconds"))?,
                };
                self.host
                    .shell(&command, timeout)
                    .map(Value::String)
                    .map_err(|message| EvalError::CallFailed {
                        function: function.to_string(),
                        message,
                    })
            }
            "query" => {
                let action = match args.as_slice() {
                    [Value::String(action)] => action.clone(),
                    _ => return Err(bad("expected the action name as the only positional argument")),
                };
                self.host
                    .query(&action, named)
                    .map_err(|message| EvalError::CallFailed {
                        function: function.to_string(),
                        message,
                    })
            }
            "env" => {
                let name = match args.first() {
                    Some(Value::String(name)) => name.clone(),
                    _ => return Err(bad("expected a variable name")),
                };
                let fallback = args.get(1).or_else(|| named.get("default")).cloned();
                let found = self
                    .bindings
                    .resolve("env")
                    .and_then(|env| env.as_map().and_then(|m| m.get(&name).cloned()));
                match (found, fallback) {
                    (Some(value), _) => Ok(value),
                    (None, Some(fallback)) => Ok(fallback),
                    (None, None) => Err(EvalError::UndefinedName(format!("env.{}", name))),
                }
            }
            "len" => match args.as_slice() {
                [value] => length(value).map(|n| Value::Int(n as i64)),
                _ => Err(bad("expected exactly one argument")),
            },
            "range" => {
                let ints = args
                    .iter()
                    .map(|v| v.as_i64().ok_or_else(|| bad("arguments must be integers")))
                    .collect::<Result<Vec<_>, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] if *step != 0 => (*start, *stop, *step),
                    [_, _, _] => return Err(bad("step must not be zero")),
                    _ => return Err(bad("expected one to three arguments")),
                };
                let mut items = Vec::new();
                let mut next = Some(start);
                while let Some(i) = next {
                    if !((step > 0 && i < stop) || (step < 0 && i > stop)) {
                        break;
                    }
                    if items.len() >= MAX_RANGE_LEN {
                        return Err(bad(&format!(
                            "result would exceed {} items",
                            MAX_RANGE_LEN
                        )));
                    }
                    items.push(Value::Int(i));
                    next = i.checked_add(step);
                }
                Ok(Value::List(items))
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }
}

fn attr_value(value: &Value, name: &str) -> Result<Value, EvalError> {
    match value {
        Value::Map(map) => map.get(name).cloned().ok_or_else(|| EvalError::NoAttribute {
            target: "map",
            name: name.to_string(),
        }),
        other => Err(EvalError::NoAttribute {
            target: other.type_name(),
            name: name.to_string(),
        }),
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let pos = normalize_index(*i, items.len())?;
            Ok(items[pos].clone())
        }
        (Value::String(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let pos = normalize_index(*i, chars.len())?;
            Ok(Value::String(chars[pos].to_string()))
        }
        (Value::Map(map), Value::String(key)) => {
            map.get(key).cloned().ok_or_else(|| EvalError::NoAttribute {
                target: "map",
                name: key.clone(),
            })
        }
        (target, index) => Err(EvalError::BadIndex {
            target: target.type_name(),
            index: index.type_name(),
        }),
    }
}

/// Resolve a possibly negative index against a length
fn normalize_index(index: i64, len: usize) -> Result<usize, EvalError> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::IndexOutOfRange { index, len });
    }
    Ok(resolved as usize)
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value {
            Value::Int(n) => n.checked_neg().map(Value::Int).ok_or(EvalError::Overflow("-")),
            Value::Float(x) => Ok(Value::Float(-x)),
            other => Err(EvalError::BadOperand {
                op: "-",
                operand: other.type_name(),
            }),
        },
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    let mismatch = |left: &Value, right: &Value| EvalError::TypeMismatch {
        op: op.symbol(),
        left: left.type_name(),
        right: right.type_name(),
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| mismatch(&left, &right))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Le => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_add(b).map(Value::Int).ok_or(EvalError::Overflow("+"))
            }
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (left, right) => float_op(&left, &right, |a, b| a + b).ok_or_else(|| mismatch(&left, &right)),
        },
        BinaryOp::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_sub(b).map(Value::Int).ok_or(EvalError::Overflow("-"))
            }
            (left, right) => float_op(&left, &right, |a, b| a - b).ok_or_else(|| mismatch(&left, &right)),
        },
        BinaryOp::Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_mul(b).map(Value::Int).ok_or(EvalError::Overflow("*"))
            }
            (left, right) => float_op(&left, &right, |a, b| a * b).ok_or_else(|| mismatch(&left, &right)),
        },
        BinaryOp::Div => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(mismatch(&left, &right)),
            };
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::Float(a / b))
        }
        BinaryOp::Rem => match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => {
                a.checked_rem(b).map(Value::Int).ok_or(EvalError::Overflow("%"))
            }
            (left, right) => {
                if right.as_f64() == Some(0.0) {
                    return Err(EvalError::DivisionByZero);
                }
                float_op(&left, &right, |a, b| a % b).ok_or_else(|| mismatch(&left, &right))
            }
        },
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

/// Apply a float operation when both sides are numeric
fn float_op(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Option<Value> {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Some(Value::Float(f(left.as_f64()?, right.as_f64()?)))
        }
        _ => None,
    }
}

/// Equality with numeric comparison across int and float
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_f64() == right.as_f64()
        }
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn length(value: &Value) -> Result<usize, EvalError> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::List(items) => Ok(items.len()),
        Value::Map(map) => Ok(map.len()),
        other => Err(EvalError::NotIterable(other.type_name())),
    }
}

fn apply_filter(name: &str, value: Value, args: &[Value]) -> Result<Value, EvalError> {
    let text = |value: &Value| -> Result<String, EvalError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Ok(String::new()),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => Ok(value.render()),
            other => Err(EvalError::BadArguments {
                function: name.to_string(),
                message: format!("expected text, got {}", other.type_name()),
            }),
        }
    };
    let conversion = |target: &'static str, value: &Value| EvalError::Conversion {
        target,
        value: format!("{} {}", value.type_name(), value),
    };

    match name {
        "upper" => Ok(Value::String(text(&value)?.to_uppercase())),
        "lower" => Ok(Value::String(text(&value)?.to_lowercase())),
        "strip" => Ok(Value::String(text(&value)?.trim().to_string())),
        "title" => Ok(Value::String(title_case(&text(&value)?))),
        "str" => Ok(Value::String(value.render())),
        "length" => length(&value).map(|n| Value::Int(n as i64)),
        "int" => match &value {
            Value::Int(_) => Ok(value),
            Value::Float(x) if x.is_finite() => Ok(Value::Int(x.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|x| x.is_finite())
                            .map(|x| x.trunc() as i64)
                    })
                    .map(Value::Int)
                    .ok_or_else(|| conversion("integer", &value))
            }
            _ => Err(conversion("integer", &value)),
        },
        "float" => match &value {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Float(_) => Ok(value),
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .map(Value::Float)
                .ok_or_else(|| conversion("float", &value)),
            _ => Err(conversion("float", &value)),
        },
        "bool" => match &value {
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" | "" => Ok(Value::Bool(false)),
                _ => Err(conversion("boolean", &value)),
            },
            other => Ok(Value::Bool(other.is_truthy())),
        },
        "default" => match args {
            [fallback] => Ok(if value.is_null() {
                fallback.clone()
            } else {
                value
            }),
            _ => Err(EvalError::BadArguments {
                function: name.to_string(),
                message: "expected one fallback value".to_string(),
            }),
        },
        "join" => {
            let sep = match args {
                [] => String::new(),
                [sep] => text(sep)?,
                _ => {
                    return Err(EvalError::BadArguments {
                        function: name.to_string(),
                        message: "expected at most one separator".to_string(),
                    })
                }
            };
            match value {
                Value::List(items) => Ok(Value::String(
                    items.iter().map(Value::render).collect::<Vec<_>>().join(&sep),
                )),
                other => Err(EvalError::NotIterable(other.type_name())),
            }
        }
        "first" | "last" => match value {
            Value::List(items) => Ok(if name == "first" {
                items.into_iter().next().unwrap_or(Value::Null)
            } else {
                items.into_iter().last().unwrap_or(Value::Null)
            }),
            Value::String(s) => {
                let c = if name == "first" {
                    s.chars().next()
                } else {
                    s.chars().last()
                };
                Ok(c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null))
            }
            other => Err(EvalError::NotIterable(other.type_name())),
        },
        other => Err(EvalError::UnknownFilter(other.to_string())),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}
