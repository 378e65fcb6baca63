//! Typed macro document

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;

use crate::expr::Field;
use crate::value::Value;

/// A sequence of actions, shared immutably between runs and frames
pub type Block = Arc<[ActionNode]>;

/// Names that address namespaces and can never be rebound
pub const RESERVED_NAMES: &[&str] = &["params", "vars", "env", "error"];

/// A parsed macro, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct MacroDefinition {
    pub name: String,
    pub description: String,
    pub version: Option<String>,
    pub params: IndexMap<String, ParamSpec>,
    /// Evaluated eagerly, in order, at run start
    pub vars: IndexMap<String, Field>,
    pub actions: Block,
    pub source_path: Option<PathBuf>,
}

impl MacroDefinition {
    /// Every primitive action name used anywhere in the document, in first-use order
    pub fn primitive_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_primitives(&self.actions, &mut names);
        names
    }

    /// Literal macro names targeted by `call` nodes
    pub fn call_targets(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_calls(&self.actions, &mut names);
        names
    }
}

fn collect_primitives<'a>(block: &'a [ActionNode], names: &mut Vec<&'a str>) {
    for node in block {
        if let NodeKind::Primitive { action, .. } = &node.kind {
            if !names.contains(&action.as_str()) {
                names.push(action);
            }
        }
        for child in node.kind.children() {
            collect_primitives(child, names);
        }
    }
}

fn collect_calls<'a>(block: &'a [ActionNode], names: &mut Vec<&'a str>) {
    for node in block {
        if let NodeKind::Call {
            macro_name: Field::Literal(Value::String(name)),
            ..
        } = &node.kind
        {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        for child in node.kind.children() {
            collect_calls(child, names);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    List,
}

impl ParamType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ParamType::String),
            "integer" => Some(ParamType::Integer),
            "float" => Some(ParamType::Float),
            "boolean" => Some(ParamType::Boolean),
            "list" => Some(ParamType::List),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::List => "list",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validation pattern anchored to the whole value
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})$", source))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub pattern: Option<Pattern>,
    pub description: String,
}

impl ParamSpec {
    /// Required string parameter without further constraints
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::String,
            required: true,
            default: None,
            pattern: None,
            description: String::new(),
        }
    }

    pub fn with_type(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }

    /// A default makes the parameter optional
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One node of the action tree
#[derive(Debug, Clone, PartialEq)]
pub struct ActionNode {
    /// Optional `name` label
    pub label: Option<String>,
    /// Optional `when` guard; falsy skips the node
    pub when: Option<Field>,
    pub kind: NodeKind,
    /// Location in the document, e.g. `actions[2].then[0]`
    pub path: String,
}

impl ActionNode {
    pub fn new(kind: NodeKind, path: impl Into<String>) -> Self {
        Self {
            label: None,
            when: None,
            kind,
            path: path.into(),
        }
    }

    /// Label if present, else the action name
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.kind.action_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Primitive {
        action: String,
        fields: IndexMap<String, Field>,
        store_result: Option<String>,
    },
    If {
        condition: Field,
        then: Block,
        otherwise: Block,
    },
    Repeat {
        count: Field,
        binding: Option<String>,
        body: Block,
    },
    While {
        condition: Field,
        max_iterations: u64,
        body: Block,
    },
    Foreach {
        items: Field,
        binding: String,
        index_binding: Option<String>,
        body: Block,
    },
    Try {
        body: Block,
        catch: Block,
    },
    Break,
    Continue,
    Call {
        macro_name: Field,
        args: IndexMap<String, Field>,
        store_result: Option<String>,
    },
    SetVar {
        name: String,
        value: Field,
    },
    Log {
        message: Field,
        level: LogLevel,
    },
    Fail {
        message: Field,
    },
    Delay {
        seconds: Field,
    },
    Shell {
        command: Field,
        timeout: Option<Field>,
        check: Field,
        store_result: Option<String>,
    },
    Return {
        value: Option<Field>,
    },
}

impl NodeKind {
    /// The `action` value naming this node
    pub fn action_name(&self) -> &str {
        match self {
            NodeKind::Primitive { action, .. } => action,
            NodeKind::If { .. } => "if",
            NodeKind::Repeat { .. } => "repeat",
            NodeKind::While { .. } => "while",
            NodeKind::Foreach { .. } => "foreach",
            NodeKind::Try { .. } => "try",
            NodeKind::Break => "break",
            NodeKind::Continue => "continue",
            NodeKind::Call { .. } => "call",
            NodeKind::SetVar { .. } => "set-var",
            NodeKind::Log { .. } => "log",
            NodeKind::Fail { .. } => "fail",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Shell { .. } => "shell",
            NodeKind::Return { .. } => "return",
        }
    }

    /// Nested blocks in document order
    pub fn children(&self) -> Vec<&Block> {
        match self {
            NodeKind::If {
                then, otherwise, ..
            } => vec![then, otherwise],
            NodeKind::Repeat { body, .. }
            | NodeKind::While { body, .. }
            | NodeKind::Foreach { body, .. } => vec![body],
            NodeKind::Try { body, catch } => vec![body, catch],
            _ => Vec::new(),
        }
    }

    /// Control-flow nodes run through frames and are not traced themselves
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            NodeKind::If { .. }
                | NodeKind::Repeat { .. }
                | NodeKind::While { .. }
                | NodeKind::Foreach { .. }
                | NodeKind::Try { .. }
        )
    }
}
