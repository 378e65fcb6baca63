//! YAML macro documents -> [`MacroDefinition`]
//!
//! Shape violations are accumulated rather than reported one at a time, so a
//! single pass lists every problem in the document.

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use thiserror::Error;

use crate::document::schema::*;
use crate::error::ParseError;
use crate::expr::Field;
use crate::value::Value;

/// One shape violation
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIssue {
    /// Dotted/indexed location, e.g. `actions[2].then[0].count`
    pub path: String,
    pub reason: String,
    /// Template text and syntax error when the issue is a bad expression
    pub expression: Option<(String, ParseError)>,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            expression: None,
        }
    }

    /// Render the issue, with an ariadne snippet for expression errors
    pub fn render(&self) -> String {
        match &self.expression {
            Some((source, err)) => err.format(source, &self.path),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{}: {}", self.path, self.reason)
        }
    }
}

/// Every shape violation found in a document
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid macro document ({} problem(s)): {}", .issues.len(), summary(.issues))]
pub struct SchemaError {
    pub issues: Vec<SchemaIssue>,
}

impl SchemaError {
    pub fn single(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            issues: vec![SchemaIssue::new(path, reason)],
        }
    }
}

fn summary(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse a YAML macro document
pub fn parse_macro(source: &str) -> Result<MacroDefinition, SchemaError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(source)
        .map_err(|e| SchemaError::single("", format!("invalid YAML: {}", e)))?;
    let mut parser = DocumentParser::default();
    let definition = parser.document(Value::from(yaml));
    match definition {
        Some(definition) if parser.issues.is_empty() => Ok(definition),
        _ => Err(SchemaError {
            issues: parser.issues,
        }),
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else if key.is_empty() || key.starts_with('[') {
        format!("{}{}", path, key)
    } else {
        format!("{}.{}", path, key)
    }
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "description",
    "version",
    "params",
    "parameters",
    "vars",
    "actions",
];

const PARAM_KEYS: &[&str] = &["name", "type", "required", "default", "pattern", "description"];

/// Check a literal default against the declared type; ints widen to floats
fn typed_default(param_type: ParamType, value: Value) -> Result<Value, &'static str> {
    match (param_type, value) {
        (ParamType::String, v @ Value::String(_))
        | (ParamType::Integer, v @ Value::Int(_))
        | (ParamType::Float, v @ Value::Float(_))
        | (ParamType::Boolean, v @ Value::Bool(_))
        | (ParamType::List, v @ Value::List(_)) => Ok(v),
        (ParamType::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
        (_, other) => Err(other.type_name()),
    }
}

#[derive(Default)]
struct DocumentParser {
    issues: Vec<SchemaIssue>,
}

impl DocumentParser {
    fn issue(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.issues.push(SchemaIssue::new(path, reason));
    }

    fn document(&mut self, root: Value) -> Option<MacroDefinition> {
        let Value::Map(mut map) = root else {
            self.issue("", "macro document must be a mapping");
            return None;
        };

        for key in map.keys() {
            if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                self.issues
                    .push(SchemaIssue::new(key.clone(), format!("unknown key '{}'", key)));
            }
        }

        let name = match map.shift_remove("name") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(_) => {
                self.issue("name", "must be a non-empty string");
                None
            }
            None => {
                self.issue("name", "missing required key");
                None
            }
        };
        let description = match map.shift_remove("description") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(_) => {
                self.issue("description", "must be a string");
                String::new()
            }
        };
        let version = match map.shift_remove("version") {
            None | Some(Value::Null) => None,
            Some(v @ (Value::String(_) | Value::Int(_) | Value::Float(_))) => Some(v.render()),
            Some(_) => {
                self.issue("version", "must be a string or number");
                None
            }
        };

        let params = match (map.shift_remove("params"), map.shift_remove("parameters")) {
            (Some(_), Some(_)) => {
                self.issue("parameters", "use either 'params' or 'parameters', not both");
                IndexMap::new()
            }
            (Some(value), None) => self.params_mapping(value),
            (None, Some(value)) => self.params_list(value),
            (None, None) => IndexMap::new(),
        };
        let vars = self.vars(map.shift_remove("vars"));
        let actions = self.block("actions", map.shift_remove("actions"));

        Some(MacroDefinition {
            name: name?,
            description,
            version,
            params,
            vars,
            actions,
            source_path: None,
        })
    }

    /// Name that expressions can refer to: an identifier, not reserved
    fn check_name(&mut self, path: &str, name: &str) -> bool {
        if !is_identifier(name) {
            self.issue(path, format!("'{}' is not a valid name", name));
            return false;
        }
        if RESERVED_NAMES.contains(&name) {
            self.issue(path, format!("'{}' is a reserved name", name));
            return false;
        }
        true
    }

    fn binding(&mut self, path: &str, value: Value) -> Option<String> {
        match value {
            Value::String(name) => self.check_name(path, &name).then_some(name),
            _ => {
                self.issue(path, "must be a name");
                None
            }
        }
    }

    fn params_mapping(&mut self, value: Value) -> IndexMap<String, ParamSpec> {
        let mut params = IndexMap::new();
        match value {
            Value::Null => {}
            Value::Map(map) => {
                for (name, spec) in map {
                    let path = join("params", &name);
                    let spec = match spec {
                        Value::Null => Some(ParamSpec::new(name.clone())),
                        // `name: integer` shorthand
                        Value::String(type_name) => {
                            self.param_type(&join(&path, "type"), &type_name)
                                .map(|t| ParamSpec::new(name.clone()).with_type(t))
                        }
                        Value::Map(fields) => {
                            if fields.contains_key("name") {
                                self.issue(join(&path, "name"), "unknown key 'name'");
                            }
                            self.param_spec(&path, name.clone(), fields)
                        }
                        _ => {
                            self.issue(path.clone(), "parameter spec must be a mapping");
                            None
                        }
                    };
                    if self.check_name(&path, &name) {
                        if let Some(spec) = spec {
                            params.insert(name, spec);
                        }
                    }
                }
            }
            _ => self.issue("params", "must be a mapping of parameter specs"),
        }
        params
    }

    fn params_list(&mut self, value: Value) -> IndexMap<String, ParamSpec> {
        let mut params = IndexMap::new();
        let items = match value {
            Value::Null => return params,
            Value::List(items) => items,
            _ => {
                self.issue("parameters", "must be a list");
                return params;
            }
        };
        for (i, item) in items.into_iter().enumerate() {
            let path = format!("parameters[{}]", i);
            let (name, spec) = match item {
                Value::String(name) => (name.clone(), Some(ParamSpec::new(name))),
                Value::Map(mut fields) => match fields.shift_remove("name") {
                    Some(Value::String(name)) => {
                        let spec = self.param_spec(&path, name.clone(), fields);
                        (name, spec)
                    }
                    _ => {
                        self.issue(join(&path, "name"), "missing parameter name");
                        continue;
                    }
                },
                _ => {
                    self.issue(path, "parameter must be a name or a mapping");
                    continue;
                }
            };
            if !self.check_name(&path, &name) {
                continue;
            }
            if params.contains_key(&name) {
                self.issue(path, format!("duplicate parameter '{}'", name));
                continue;
            }
            if let Some(spec) = spec {
                params.insert(name, spec);
            }
        }
        params
    }

    fn param_type(&mut self, path: &str, name: &str) -> Option<ParamType> {
        let parsed = ParamType::parse(name);
        if parsed.is_none() {
            self.issue(
                path,
                format!(
                    "unknown type '{}' (expected string, integer, float, boolean or list)",
                    name
                ),
            );
        }
        parsed
    }

    fn param_spec(
        &mut self,
        path: &str,
        name: String,
        mut fields: IndexMap<String, Value>,
    ) -> Option<ParamSpec> {
        let issues_before = self.issues.len();
        for key in fields.keys() {
            if !PARAM_KEYS.contains(&key.as_str()) {
                self.issues
                    .push(SchemaIssue::new(join(path, key), format!("unknown key '{}'", key)));
            }
        }

        let param_type = match fields.shift_remove("type") {
            None | Some(Value::Null) => Some(ParamType::String),
            Some(Value::String(t)) => self.param_type(&join(path, "type"), &t),
            Some(_) => {
                self.issue(join(path, "type"), "must be a type name");
                None
            }
        };
        let description = match fields.shift_remove("description") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let required = match fields.shift_remove("required") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(b),
            Some(_) => {
                self.issue(join(path, "required"), "must be a boolean");
                None
            }
        };

        let default = match (fields.shift_remove("default"), param_type) {
            (None | Some(Value::Null), _) => None,
            (Some(value), Some(param_type)) => match typed_default(param_type, value) {
                Ok(value) => Some(value),
                Err(found) => {
                    self.issue(
                        join(path, "default"),
                        format!("default must be of type {}, found {}", param_type, found),
                    );
                    None
                }
            },
            (Some(_), None) => None,
        };
        if required == Some(true) && default.is_some() {
            self.issue(
                join(path, "required"),
                "a required parameter cannot have a default",
            );
        }

        let pattern = match fields.shift_remove("pattern") {
            None | Some(Value::Null) => None,
            Some(Value::String(source)) => {
                if param_type != Some(ParamType::String) {
                    self.issue(join(path, "pattern"), "only string parameters take a pattern");
                    None
                } else {
                    match Pattern::new(&source) {
                        Ok(pattern) => Some(pattern),
                        Err(e) => {
                            self.issue(join(path, "pattern"), format!("invalid pattern: {}", e));
                            None
                        }
                    }
                }
            }
            Some(_) => {
                self.issue(join(path, "pattern"), "must be a string");
                None
            }
        };
        if let (Some(pattern), Some(Value::String(default))) = (&pattern, &default) {
            if !pattern.is_match(default) {
                self.issue(
                    join(path, "default"),
                    format!("default does not match pattern '{}'", pattern.as_str()),
                );
            }
        }

        if self.issues.len() > issues_before {
            return None;
        }
        Some(ParamSpec {
            name,
            param_type: param_type?,
            required: required.unwrap_or(default.is_none()),
            default,
            pattern,
            description,
        })
    }

    fn vars(&mut self, value: Option<Value>) -> IndexMap<String, Field> {
        let mut vars = IndexMap::new();
        match value {
            None | Some(Value::Null) => {}
            Some(Value::Map(map)) => {
                for (name, value) in map {
                    let path = join("vars", &name);
                    if self.check_name(&path, &name) {
                        let field = self.field(&path, value);
                        vars.insert(name, field);
                    }
                }
            }
            Some(_) => self.issue("vars", "must be a mapping"),
        }
        vars
    }

    /// Compile a field, reporting template syntax errors
    fn field(&mut self, path: &str, value: Value) -> Field {
        match Field::compile(value) {
            Ok(field) => field,
            Err(errors) => {
                for (sub, source, err) in errors {
                    self.issues.push(SchemaIssue {
                        path: join(path, &sub),
                        reason: format!("invalid expression: {}", err.message()),
                        expression: Some((source, err)),
                    });
                }
                Field::Literal(Value::Null)
            }
        }
    }

    fn condition(&mut self, path: &str, value: Value) -> Field {
        let source = value.render();
        match Field::condition(value) {
            Ok(field) => field,
            Err(err) => {
                self.issues.push(SchemaIssue {
                    path: path.to_string(),
                    reason: format!("invalid expression: {}", err.message()),
                    expression: Some((source, err)),
                });
                Field::Literal(Value::Null)
            }
        }
    }

    fn block(&mut self, path: &str, value: Option<Value>) -> Block {
        match value {
            None | Some(Value::Null) => Vec::<ActionNode>::new().into(),
            Some(Value::List(items)) => items
                .into_iter()
                .enumerate()
                .filter_map(|(i, item)| self.node(&format!("{}[{}]", path, i), item))
                .collect::<Vec<_>>()
                .into(),
            Some(_) => {
                self.issue(path, "must be a list of actions");
                Vec::<ActionNode>::new().into()
            }
        }
    }

    fn node(&mut self, path: &str, value: Value) -> Option<ActionNode> {
        let Value::Map(mut map) = value else {
            self.issue(path, "action must be a mapping");
            return None;
        };
        let action = match map.shift_remove("action") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(_) => {
                self.issue(join(path, "action"), "must be a non-empty string");
                return None;
            }
            None => {
                self.issue(path, "missing 'action' key");
                return None;
            }
        };

        // set-var uses `name` for the variable it writes
        let label = if action == "set-var" {
            None
        } else {
            match map.shift_remove("name") {
                None | Some(Value::Null) => None,
                Some(v @ (Value::String(_) | Value::Int(_))) => Some(v.render()),
                Some(_) => {
                    self.issue(join(path, "name"), "label must be a string");
                    None
                }
            }
        };
        let when = map
            .shift_remove("when")
            .map(|v| self.condition(&join(path, "when"), v));

        let mut node = NodeBuilder {
            parser: self,
            path,
            map,
        };
        let kind = node.kind(&action);
        let NodeBuilder { map, .. } = node;
        if !matches!(kind, NodeKind::Primitive { .. }) {
            for key in map.keys() {
                self.issues.push(SchemaIssue::new(
                    join(path, key),
                    format!("unknown key '{}' for '{}'", key, action),
                ));
            }
        }

        Some(ActionNode {
            label,
            when,
            kind,
            path: path.to_string(),
        })
    }
}

/// Consumes the keys of one action mapping
struct NodeBuilder<'p, 'a> {
    parser: &'p mut DocumentParser,
    path: &'a str,
    map: IndexMap<String, Value>,
}

impl NodeBuilder<'_, '_> {
    fn sub(&self, key: &str) -> String {
        join(self.path, key)
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        self.map.shift_remove(key)
    }

    fn required(&mut self, key: &str) -> Option<Value> {
        let value = self.take(key);
        if value.is_none() {
            let path = self.sub(key);
            self.parser.issue(path, "missing required key");
        }
        value
    }

    fn required_field(&mut self, key: &str) -> Field {
        match self.required(key) {
            Some(value) => {
                let path = self.sub(key);
                self.parser.field(&path, value)
            }
            None => Field::Literal(Value::Null),
        }
    }

    fn optional_field(&mut self, key: &str) -> Option<Field> {
        let value = self.take(key)?;
        let path = self.sub(key);
        Some(self.parser.field(&path, value))
    }

    fn required_condition(&mut self, key: &str) -> Field {
        match self.required(key) {
            Some(value) => {
                let path = self.sub(key);
                self.parser.condition(&path, value)
            }
            None => Field::Literal(Value::Null),
        }
    }

    fn block(&mut self, key: &str, required: bool) -> Block {
        let value = if required {
            self.required(key)
        } else {
            self.take(key)
        };
        let path = self.sub(key);
        self.parser.block(&path, value)
    }

    fn binding(&mut self, key: &str, required: bool) -> Option<String> {
        let value = if required {
            self.required(key)
        } else {
            self.take(key)
        }?;
        let path = self.sub(key);
        self.parser.binding(&path, value)
    }

    /// `store_result`, or its alias `store_as`
    fn store_result(&mut self) -> Option<String> {
        match (self.take("store_result"), self.take("store_as")) {
            (Some(_), Some(_)) => {
                let path = self.sub("store_as");
                self.parser
                    .issue(path, "use either 'store_result' or 'store_as', not both");
                None
            }
            (Some(value), None) => {
                let path = self.sub("store_result");
                self.parser.binding(&path, value)
            }
            (None, Some(value)) => {
                let path = self.sub("store_as");
                self.parser.binding(&path, value)
            }
            (None, None) => None,
        }
    }

    /// Check a literal field against a predicate; templates are checked at run time
    fn check_literal(&mut self, key: &str, field: &Field, ok: fn(&Value) -> bool, reason: &str) {
        if let Field::Literal(value) = field {
            if !ok(value) {
                let path = self.sub(key);
                self.parser.issue(path, reason.to_string());
            }
        }
    }

    fn kind(&mut self, action: &str) -> NodeKind {
        match action {
            "if" => {
                let condition = self.required_condition("condition");
                let then = self.block("then", true);
                let otherwise = self.block("else", false);
                NodeKind::If {
                    condition,
                    then,
                    otherwise,
                }
            }
            "repeat" => {
                let count = self.required_field("count");
                self.check_literal(
                    "count",
                    &count,
                    |v| matches!(v, Value::Int(n) if *n >= 0) || v.is_null(),
                    "must be a non-negative integer",
                );
                let binding = self.binding("as", false);
                let body = self.block("actions", true);
                NodeKind::Repeat {
                    count,
                    binding,
                    body,
                }
            }
            "while" => {
                let condition = self.required_condition("condition");
                let max_iterations = match self.required("max_iterations") {
                    Some(Value::Int(n)) if n > 0 => n as u64,
                    Some(_) => {
                        let path = self.sub("max_iterations");
                        self.parser
                            .issue(path, "must be a positive integer literal");
                        1
                    }
                    None => 1,
                };
                let body = self.block("actions", true);
                NodeKind::While {
                    condition,
                    max_iterations,
                    body,
                }
            }
            "foreach" => {
                let items = self.required_field("items");
                self.check_literal(
                    "items",
                    &items,
                    |v| matches!(v, Value::List(_) | Value::Null),
                    "must be a list",
                );
                let binding = self.binding("as", true).unwrap_or_default();
                let index_binding = self.binding("index_as", false);
                if index_binding.as_deref() == Some(binding.as_str()) {
                    let path = self.sub("index_as");
                    self.parser.issue(path, "must differ from 'as'");
                }
                let body = self.block("actions", true);
                NodeKind::Foreach {
                    items,
                    binding,
                    index_binding,
                    body,
                }
            }
            "try" => {
                let body = self.block("actions", true);
                let catch = self.block("catch", false);
                NodeKind::Try { body, catch }
            }
            "break" => NodeKind::Break,
            "continue" => NodeKind::Continue,
            "call" => {
                let macro_name = self.required_field("macro");
                self.check_literal(
                    "macro",
                    &macro_name,
                    |v| matches!(v, Value::String(s) if !s.trim().is_empty()) || v.is_null(),
                    "must be a macro name or path",
                );
                let args = match self.take("args") {
                    None | Some(Value::Null) => IndexMap::new(),
                    Some(Value::Map(map)) => {
                        let mut args = IndexMap::new();
                        for (key, value) in map {
                            let path = join(&self.sub("args"), &key);
                            let field = self.parser.field(&path, value);
                            args.insert(key, field);
                        }
                        args
                    }
                    Some(_) => {
                        let path = self.sub("args");
                        self.parser.issue(path, "must be a mapping");
                        IndexMap::new()
                    }
                };
                let store_result = self.store_result();
                NodeKind::Call {
                    macro_name,
                    args,
                    store_result,
                }
            }
            "set-var" => {
                let name = self.binding("name", true).unwrap_or_default();
                let value = self.required_field("value");
                NodeKind::SetVar { name, value }
            }
            "log" => {
                let message = self.required_field("message");
                let level = match self.take("level") {
                    None | Some(Value::Null) => LogLevel::Info,
                    Some(Value::String(s)) => LogLevel::parse(&s).unwrap_or_else(|| {
                        let path = self.sub("level");
                        self.parser.issue(
                            path,
                            format!("unknown level '{}' (expected trace, debug, info, warn or error)", s),
                        );
                        LogLevel::Info
                    }),
                    Some(_) => {
                        let path = self.sub("level");
                        self.parser.issue(path, "must be a level name");
                        LogLevel::Info
                    }
                };
                NodeKind::Log { message, level }
            }
            "fail" => NodeKind::Fail {
                message: self.required_field("message"),
            },
            "delay" => {
                let key = if self.map.contains_key("seconds") || !self.map.contains_key("duration") {
                    "seconds"
                } else {
                    "duration"
                };
                let seconds = self.required_field(key);
                self.check_literal(
                    key,
                    &seconds,
                    |v| {
                        v.as_f64().map_or(v.is_null(), |s| {
                            s >= 0.0 && Duration::try_from_secs_f64(s).is_ok()
                        })
                    },
                    "must be a non-negative number of seconds",
                );
                NodeKind::Delay { seconds }
            }
            "shell" => {
                let command = self.required_field("command");
                let timeout = self.optional_field("timeout");
                if let Some(timeout) = &timeout {
                    self.check_literal(
                        "timeout",
                        timeout,
                        |v| {
                            v.as_f64().map_or(false, |s| {
                                s > 0.0 && Duration::try_from_secs_f64(s).is_ok()
                            })
                        },
                        "must be a positive number of seconds",
                    );
                }
                let check = self
                    .optional_field("check")
                    .unwrap_or(Field::Literal(Value::Bool(true)));
                self.check_literal(
                    "check",
                    &check,
                    |v| matches!(v, Value::Bool(_)),
                    "must be a boolean",
                );
                let store_result = self.store_result();
                NodeKind::Shell {
                    command,
                    timeout,
                    check,
                    store_result,
                }
            }
            "return" => NodeKind::Return {
                value: self.optional_field("value"),
            },
            primitive => {
                let store_result = self.store_result();
                let mut fields = IndexMap::new();
                for (key, value) in std::mem::take(&mut self.map) {
                    let path = join(self.path, &key);
                    let field = self.parser.field(&path, value);
                    fields.insert(key, field);
                }
                NodeKind::Primitive {
                    action: primitive.to_string(),
                    fields,
                    store_result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn issues(source: &str) -> Vec<String> {
        parse_macro(source)
            .expect_err("should fail")
            .issues
            .into_iter()
            .map(|i| i.to_string())
            .collect()
    }

    #[test]
    fn test_minimal_document() {
        let def = parse_macro("name: hello\n").unwrap();
        assert_eq!(def.name, "hello");
        assert_eq!(def.description, "");
        assert!(def.actions.is_empty());
        assert!(def.params.is_empty());
    }

    #[test]
    fn test_full_document() {
        let def = parse_macro(
            r#"
name: login
description: Log in
version: 1.2
params:
  user: { type: string, pattern: "[a-z]+" }
  retries: { type: integer, default: 3 }
  ratio: { type: float, default: 1 }
vars:
  greeting: "Hello {{ params.user }}"
actions:
  - action: keyboard.type
    name: greet
    text: "{{ vars.greeting }}"
    store_as: typed
  - action: repeat
    count: "{{ params.retries }}"
    as: i
    actions:
      - action: mouse.click
        when: i > 0
"#,
        )
        .unwrap();

        assert_eq!(def.version.as_deref(), Some("1.2"));
        let user = &def.params["user"];
        assert!(user.required);
        assert_eq!(user.pattern.as_ref().map(|p| p.as_str()), Some("[a-z]+"));
        let retries = &def.params["retries"];
        assert!(!retries.required);
        assert_eq!(retries.default, Some(Value::Int(3)));
        assert_eq!(def.params["ratio"].default, Some(Value::Float(1.0)));

        let first = &def.actions[0];
        assert_eq!(first.label.as_deref(), Some("greet"));
        match &first.kind {
            NodeKind::Primitive {
                action,
                fields,
                store_result,
            } => {
                assert_eq!(action, "keyboard.type");
                assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["text"]);
                assert_eq!(store_result.as_deref(), Some("typed"));
            }
            other => panic!("Expected primitive, got {:?}", other),
        }
        match &def.actions[1].kind {
            NodeKind::Repeat { binding, body, .. } => {
                assert_eq!(binding.as_deref(), Some("i"));
                assert_eq!(body[0].path, "actions[1].actions[0]");
                assert!(body[0].when.is_some());
            }
            other => panic!("Expected repeat, got {:?}", other),
        }
    }

    #[test]
    fn test_parameters_list_form() {
        let def = parse_macro(
            r#"
name: p
parameters:
  - user
  - { name: count, type: integer, default: 2 }
"#,
        )
        .unwrap();
        assert_eq!(def.params.keys().collect::<Vec<_>>(), vec!["user", "count"]);
        assert!(def.params["user"].required);
        assert_eq!(def.params["user"].param_type, ParamType::String);
    }

    #[test]
    fn test_all_violations_reported_in_one_pass() {
        let found = issues(
            r#"
name: broken
params:
  a: { type: tuple }
  b: { type: integer, default: "x" }
actions:
  - action: if
    condition: "true"
    then:
      - action: repeat
        actions: []
  - keyboard.type
  - action: while
    condition: "{{ true }}"
    max_iterations: 0
    actions: []
    extra: 1
"#,
        );
        assert_eq!(
            found,
            vec![
                "params.a.type: unknown type 'tuple' (expected string, integer, float, boolean or list)",
                "params.b.default: default must be of type integer, found string",
                "actions[0].then[0].count: missing required key",
                "actions[1]: action must be a mapping",
                "actions[2].max_iterations: must be a positive integer literal",
                "actions[2].extra: unknown key 'extra' for 'while'",
            ]
        );
    }

    #[test]
    fn test_reserved_names_rejected() {
        let found = issues(
            r#"
name: r
vars:
  env: 1
actions:
  - action: foreach
    items: [1]
    as: error
    actions: []
  - action: set-var
    name: params
    value: 1
"#,
        );
        assert_eq!(
            found,
            vec![
                "vars.env: 'env' is a reserved name",
                "actions[0].as: 'error' is a reserved name",
                "actions[1].name: 'params' is a reserved name",
            ]
        );
    }

    #[test]
    fn test_expression_syntax_error_carries_source() {
        let err = parse_macro(
            r#"
name: e
actions:
  - action: log
    message: "value: {{ 1 + }}"
"#,
        )
        .unwrap_err();
        assert_eq!(err.issues.len(), 1);
        let issue = &err.issues[0];
        assert_eq!(issue.path, "actions[0].message");
        let (source, parse_err) = issue.expression.as_ref().expect("expression");
        assert_eq!(source, "value: {{ 1 + }}");
        assert_eq!(parse_err.span().start, 14);
    }

    #[test]
    fn test_required_with_default_is_violation() {
        let found = issues(
            r#"
name: d
params:
  x: { type: integer, required: true, default: 1 }
"#,
        );
        assert_eq!(
            found,
            vec!["params.x.required: a required parameter cannot have a default"]
        );
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        let found = issues(
            r#"
name: slow
actions:
  - action: delay
    seconds: 1.0e30
  - action: shell
    command: "true"
    timeout: 1.0e30
"#,
        );
        assert_eq!(
            found,
            vec![
                "actions[0].seconds: must be a non-negative number of seconds",
                "actions[1].timeout: must be a positive number of seconds",
            ]
        );
    }

    #[test]
    fn test_missing_name_and_unknown_top_level_key() {
        let found = issues("description: x\nsteps: []\n");
        assert_eq!(found, vec!["steps: unknown key 'steps'", "name: missing required key"]);
    }

    #[test]
    fn test_invalid_yaml() {
        let found = issues("name: [unclosed\n");
        assert_eq!(found.len(), 1);
        assert!(found[0].starts_with("invalid YAML"));
    }

    #[test]
    fn test_control_nodes() {
        let def = parse_macro(
            r#"
name: c
actions:
  - action: try
    actions:
      - action: fail
        message: boom
    catch:
      - action: log
        level: warn
        message: "{{ error.message }}"
  - action: call
    macro: other
    args: { x: "{{ 1 }}" }
    store_result: out
  - action: delay
    duration: 0.5
  - action: shell
    command: echo hi
    check: false
  - action: return
    value: done
"#,
        )
        .unwrap();
        assert!(matches!(def.actions[0].kind, NodeKind::Try { .. }));
        assert_eq!(def.call_targets(), vec!["other"]);
        assert!(matches!(
            def.actions[2].kind,
            NodeKind::Delay {
                seconds: Field::Literal(Value::Float(_))
            }
        ));
        assert!(matches!(
            def.actions[3].kind,
            NodeKind::Shell {
                check: Field::Literal(Value::Bool(false)),
                ..
            }
        ));
        assert!(def.primitive_names().is_empty());
    }
}
