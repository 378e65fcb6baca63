//! Action registry: primitive action name -> handler

pub mod builtin;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::config::Config;
use crate::process::ProcessError;
use crate::value::Value;

/// Resolved arguments of a primitive action
pub type ActionArgs = IndexMap<String, Value>;

/// Sub-kinds of action failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionErrorKind {
    ElementNotFound,
    WindowNotFound,
    TemplateNotFound,
    Timeout,
    DependencyMissing,
    InvalidArguments,
    UnknownAction,
    Failed,
}

impl ActionErrorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionErrorKind::ElementNotFound => "ElementNotFound",
            ActionErrorKind::WindowNotFound => "WindowNotFound",
            ActionErrorKind::TemplateNotFound => "TemplateNotFound",
            ActionErrorKind::Timeout => "Timeout",
            ActionErrorKind::DependencyMissing => "DependencyMissing",
            ActionErrorKind::InvalidArguments => "InvalidArguments",
            ActionErrorKind::UnknownAction => "UnknownAction",
            ActionErrorKind::Failed => "ActionFailed",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ActionErrorKind::TemplateNotFound => 4,
            ActionErrorKind::ElementNotFound | ActionErrorKind::Timeout => 5,
            ActionErrorKind::WindowNotFound => 6,
            ActionErrorKind::DependencyMissing => 9,
            _ => 7,
        }
    }
}

impl fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Failure reported by a handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
    pub context: IndexMap<String, Value>,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: IndexMap::new(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::InvalidArguments, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Failed, message)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<ProcessError> for ActionError {
    fn from(err: ProcessError) -> Self {
        let message = err.to_string();
        match err {
            ProcessError::NotFound { program } => {
                ActionError::new(ActionErrorKind::DependencyMissing, message)
                    .with_context("program", program)
            }
            ProcessError::Timeout { command, timeout } => {
                ActionError::new(ActionErrorKind::Timeout, message)
                    .with_context("command", command)
                    .with_context("timeout", timeout.as_secs_f64())
            }
            ProcessError::Failed {
                command,
                code,
                stderr,
            } => ActionError::failed(message)
                .with_context("command", command)
                .with_context("exit_code", code as i64)
                .with_context("stderr", stderr),
            ProcessError::Io { command, .. } => {
                ActionError::failed(message).with_context("command", command)
            }
        }
    }
}

/// Successful handler result; `value` feeds `store_result`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub value: Option<Value>,
}

impl ActionOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }
}

/// What a handler can see of the run invoking it
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub macro_name: &'a str,
    pub action_index: usize,
    pub config: &'a Config,
}

/// A primitive action
pub trait ActionHandler: Send + Sync {
    /// One-line summary for `deskpilot actions`
    fn description(&self) -> &str {
        ""
    }

    /// Check argument shape before execution
    fn validate(&self, _args: &ActionArgs) -> Result<(), ActionError> {
        Ok(())
    }

    fn execute(&self, args: &ActionArgs, ctx: &ActionContext<'_>)
        -> Result<ActionOutcome, ActionError>;
}

/// Handler built from a closure
pub struct FnHandler<F> {
    description: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ActionArgs, &ActionContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync,
{
    pub fn new(description: impl Into<String>, func: F) -> Self {
        Self {
            description: description.into(),
            func,
        }
    }
}

impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(&ActionArgs, &ActionContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(
        &self,
        args: &ActionArgs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, ActionError> {
        (self.func)(args, ctx)
    }
}

/// Errors that can occur while populating a registry
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("duplicate action registration: {name}")]
    Duplicate { name: String },

    #[error("invalid action name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Reserved control-flow kinds; primitives may not use these names
pub const RESERVED_ACTIONS: &[&str] = &[
    "if", "repeat", "while", "foreach", "try", "break", "continue", "call", "set-var", "log",
    "fail", "delay", "shell", "return",
];

/// Registry of primitive actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: IndexMap<String, Arc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the default desktop actions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a handler under a new name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), Arc::new(handler), false)
    }

    /// Register a closure as a handler
    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&ActionArgs, &ActionContext<'_>) -> Result<ActionOutcome, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnHandler::new(description, func))
    }

    /// Register a handler, replacing any existing one of the same name
    pub fn replace(
        &mut self,
        name: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), Arc::new(handler), true)
    }

    fn insert(
        &mut self,
        name: String,
        handler: Arc<dyn ActionHandler>,
        replace: bool,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidName {
                name,
                reason: "empty",
            });
        }
        if RESERVED_ACTIONS.contains(&name.as_str()) {
            return Err(RegistryError::InvalidName {
                name,
                reason: "reserved for control flow",
            });
        }
        if !replace && self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Get a handler by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(name)
    }

    /// Check if an action exists
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }

    /// Name and description of every action
    pub fn describe(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.description()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Validate and execute an action
    pub fn invoke(
        &self,
        name: &str,
        args: &ActionArgs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, ActionError> {
        let handler = self.handlers.get(name).ok_or_else(|| {
            ActionError::new(
                ActionErrorKind::UnknownAction,
                format!("unknown action '{}'", name),
            )
        })?;
        handler.validate(args)?;
        handler.execute(args, ctx)
    }
}

/// Typed accessors over action arguments
pub trait ArgsExt {
    fn require(&self, key: &str) -> Result<&Value, ActionError>;
    fn opt(&self, key: &str) -> Option<&Value>;

    fn str_arg(&self, key: &str) -> Result<String, ActionError> {
        as_text(key, self.require(key)?)
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>, ActionError> {
        self.opt(key).map(|v| as_text(key, v)).transpose()
    }

    fn int_arg(&self, key: &str) -> Result<i64, ActionError> {
        as_int(key, self.require(key)?)
    }

    fn opt_int(&self, key: &str) -> Result<Option<i64>, ActionError> {
        self.opt(key).map(|v| as_int(key, v)).transpose()
    }

    fn opt_float(&self, key: &str) -> Result<Option<f64>, ActionError> {
        self.opt(key)
            .map(|v| {
                let number = match v {
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    other => other.as_f64(),
                };
                number.ok_or_else(|| ActionError::invalid(format!("'{}' must be a number", key)))
            })
            .transpose()
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>, ActionError> {
        self.opt(key)
            .map(|v| match v {
                Value::Bool(b) => Ok(*b),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => Ok(true),
                    "false" | "no" | "off" | "0" => Ok(false),
                    _ => Err(ActionError::invalid(format!("'{}' must be a boolean", key))),
                },
                _ => Err(ActionError::invalid(format!("'{}' must be a boolean", key))),
            })
            .transpose()
    }
}

impl ArgsExt for ActionArgs {
    fn require(&self, key: &str) -> Result<&Value, ActionError> {
        self.opt(key)
            .ok_or_else(|| ActionError::invalid(format!("missing required argument '{}'", key)))
    }

    /// Present and not null
    fn opt(&self, key: &str) -> Option<&Value> {
        self.get(key).filter(|v| !v.is_null())
    }
}

fn as_text(key: &str, value: &Value) -> Result<String, ActionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.render()),
        other => Err(ActionError::invalid(format!(
            "'{}' must be text, got {}",
            key,
            other.type_name()
        ))),
    }
}

fn as_int(key: &str, value: &Value) -> Result<i64, ActionError> {
    let number = match value {
        Value::String(s) => s.trim().parse::<i64>().ok(),
        other => other.as_i64(),
    };
    number.ok_or_else(|| ActionError::invalid(format!("'{}' must be an integer", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(config: &Config) -> ActionContext<'_> {
        ActionContext {
            macro_name: "test",
            action_index: 0,
            config,
        }
    }

    #[test]
    fn test_register_and_invoke() {
        let mut registry = ActionRegistry::new();
        registry
            .register_fn("echo", "Echo the text argument", |args, _ctx| {
                Ok(ActionOutcome::value(args.str_arg("text")?))
            })
            .unwrap();

        let config = Config::default();
        let mut args = ActionArgs::new();
        args.insert("text".to_string(), Value::from("hi"));
        let outcome = registry.invoke("echo", &args, &ctx(&config)).unwrap();
        assert_eq!(outcome.value, Some(Value::from("hi")));

        let err = registry
            .invoke("echo", &ActionArgs::new(), &ctx(&config))
            .unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::InvalidArguments);
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        let config = Config::default();
        let err = registry
            .invoke("nope", &ActionArgs::new(), &ctx(&config))
            .unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::UnknownAction);
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let mut registry = ActionRegistry::new();
        let noop = |_: &ActionArgs, _: &ActionContext<'_>| Ok(ActionOutcome::none());
        registry.register_fn("a", "", noop).unwrap();
        assert_eq!(
            registry.register_fn("a", "", noop),
            Err(RegistryError::Duplicate {
                name: "a".to_string()
            })
        );
        assert!(matches!(
            registry.register_fn("shell", "", noop),
            Err(RegistryError::InvalidName { .. })
        ));
        registry
            .replace("a", FnHandler::new("replaced", noop))
            .unwrap();
        assert_eq!(registry.describe().next(), Some(("a", "replaced")));
    }

    #[test]
    fn test_process_errors_map_to_kinds() {
        let err: ActionError = ProcessError::NotFound {
            program: "xdotool".to_string(),
        }
        .into();
        assert_eq!(err.kind, ActionErrorKind::DependencyMissing);

        let err: ActionError = ProcessError::Failed {
            command: "false".to_string(),
            code: 1,
            stderr: String::new(),
        }
        .into();
        assert_eq!(err.kind, ActionErrorKind::Failed);
        assert_eq!(err.context["exit_code"], Value::Int(1));
    }

    #[test]
    fn test_args_coercion() {
        let mut args = ActionArgs::new();
        args.insert("x".to_string(), Value::from("12"));
        args.insert("flag".to_string(), Value::from("yes"));
        args.insert("gone".to_string(), Value::Null);
        assert_eq!(args.int_arg("x"), Ok(12));
        assert_eq!(args.opt_bool("flag"), Ok(Some(true)));
        assert_eq!(args.opt_str("gone"), Ok(None));
        assert!(args.int_arg("gone").is_err());
    }
}
