//! Variable environment of one run

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::expr::Bindings;
use crate::params::BoundParams;
use crate::value::Value;

/// Bound params, `vars`, the environment snapshot and the stack of lexical
/// scopes opened by frames
///
/// `params`, `vars` and `env` are always maps; keeping them as [`Value`]s lets
/// expressions borrow a whole namespace.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    params: Value,
    vars: Value,
    env: Value,
    scopes: Vec<IndexMap<String, Value>>,
    call_chain: Vec<String>,
}

impl ExecutionContext {
    pub fn new(env: IndexMap<String, Value>, call_chain: Vec<String>) -> Self {
        Self {
            params: Value::Map(IndexMap::new()),
            vars: Value::Map(IndexMap::new()),
            env: Value::Map(env),
            scopes: Vec::new(),
            call_chain,
        }
    }

    /// Snapshot of the process environment
    pub fn capture_env() -> IndexMap<String, Value> {
        std::env::vars().map(|(k, v)| (k, Value::String(v))).collect()
    }

    pub(crate) fn set_params(&mut self, params: BoundParams) {
        self.params = Value::Map(params);
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.as_map().and_then(|params| params.get(name))
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.as_map().and_then(|vars| vars.get(name))
    }

    /// The `vars` namespace as a map value
    pub fn vars(&self) -> &Value {
        &self.vars
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        if let Value::Map(vars) = &mut self.vars {
            vars.insert(name.into(), value);
        }
    }

    pub(crate) fn env_snapshot(&self) -> IndexMap<String, Value> {
        self.env.as_map().cloned().unwrap_or_default()
    }

    /// Names of the macros enclosing this run, outermost first, ending
    /// with the current macro
    pub fn call_chain(&self) -> &[String] {
        &self.call_chain
    }

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(IndexMap::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Drop the innermost scope's bindings for a new loop iteration
    pub(crate) fn reset_scope(&mut self) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.clear();
        }
    }

    /// Bind a name in the innermost scope
    pub(crate) fn bind(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    pub(crate) fn clear_scopes(&mut self) {
        self.scopes.clear();
    }
}

impl Bindings for ExecutionContext {
    /// Scopes innermost first (loop bindings, then a catch body's `error`),
    /// then `vars`, then `params`, then the environment
    fn resolve(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            "params" => return Some(Cow::Borrowed(&self.params)),
            "vars" => return Some(Cow::Borrowed(&self.vars)),
            "env" => return Some(Cow::Borrowed(&self.env)),
            _ => {}
        }
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.var(name))
            .or_else(|| self.param(name))
            .or_else(|| self.env.as_map().and_then(|env| env.get(name)))
            .map(Cow::Borrowed)
    }
}
