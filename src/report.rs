//! Terminal run results: JSON shape, plain-text summary, exit codes

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{ErrorDescriptor, ErrorKind};
use crate::value::Value;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// One completed leaf action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// Execution-order index within the run
    pub index: usize,
    /// Label if present, else the action name
    pub action: String,
    /// The `action` key of the node
    pub kind: String,
    pub path: String,
    pub elapsed_ms: u64,
}

/// Outcome of one macro run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub macro_name: String,
    pub state: RunState,
    /// `return` value, else the last stored value
    pub result: Option<Value>,
    /// Every `store_result` write, last write wins
    pub stores: IndexMap<String, Value>,
    pub trace: Vec<TraceEntry>,
    pub error: Option<ErrorDescriptor>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// A run that failed before its first action
    pub fn from_error(macro_name: impl Into<String>, error: ErrorDescriptor) -> Self {
        let now = Utc::now();
        Self {
            macro_name: macro_name.into(),
            state: if error.kind == ErrorKind::Cancelled {
                RunState::Aborted
            } else {
                RunState::Failed
            },
            result: None,
            stores: IndexMap::new(),
            trace: Vec::new(),
            error: Some(error),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn actions_completed(&self) -> usize {
        self.trace.len()
    }

    /// Process exit code; 0 only for a completed run
    pub fn exit_code(&self) -> i32 {
        match (&self.state, &self.error) {
            (RunState::Completed, _) => 0,
            (_, Some(error)) => error.exit_code(),
            (_, None) => 1,
        }
    }

    pub fn to_report(&self) -> JsonReport<'_> {
        JsonReport {
            success: self.success(),
            result: self.result.as_ref().unwrap_or(&Value::Null),
            error: self.error.as_ref().map(|error| JsonError {
                code: error.exit_code(),
                error_type: error.kind.type_name(),
                message: &error.message,
                action: error.action.as_deref(),
                action_index: error.action_index,
                context: &error.context,
            }),
            execution: JsonExecution {
                macro_name: &self.macro_name,
                started_at: self.started_at,
                failed_at: (!self.success()).then_some(self.finished_at),
                actions_completed: self.actions_completed(),
            },
        }
    }

    /// Pretty-printed JSON result
    pub fn to_json(&self) -> String {
        // Serializing plain maps, strings and numbers cannot fail
        serde_json::to_string_pretty(&self.to_report()).unwrap_or_default()
    }

    /// Human-readable summary
    ///
    /// One line on success. On failure the error line is followed by any
    /// schema issues or parameter failures, one per line.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        match (&self.state, &self.error) {
            (RunState::Completed, _) => {
                let _ = write!(
                    out,
                    "Macro '{}' completed ({} action(s))",
                    self.macro_name,
                    self.actions_completed()
                );
                if let Some(result) = self.result.as_ref().filter(|v| !v.is_null()) {
                    let _ = write!(out, ": {}", result);
                }
            }
            (state, Some(error)) => {
                let verb = if *state == RunState::Aborted {
                    "aborted"
                } else {
                    "failed"
                };
                let _ = write!(
                    out,
                    "Macro '{}' {}: {}: {}",
                    self.macro_name,
                    verb,
                    error.kind.type_name(),
                    error.message
                );
                if let Some(action) = &error.action {
                    let _ = write!(out, "\n  at action '{}'", action);
                    if let Some(index) = error.action_index {
                        let _ = write!(out, " (#{})", index);
                    }
                }
                for key in ["issues", "failures"] {
                    if let Some(Value::List(items)) = error.context.get(key) {
                        for item in items {
                            let _ = write!(out, "\n  - {}", item.render());
                        }
                    }
                }
                let mut cause = error.cause.as_deref();
                while let Some(inner) = cause {
                    let _ = write!(
                        out,
                        "\n  caused by {}: {}",
                        inner.kind.type_name(),
                        inner.message
                    );
                    cause = inner.cause.as_deref();
                }
            }
            (state, None) => {
                let _ = write!(out, "Macro '{}' {:?}", self.macro_name, state);
            }
        }
        out
    }
}

/// Stable JSON shape of a result
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub success: bool,
    pub result: &'a Value,
    pub error: Option<JsonError<'a>>,
    pub execution: JsonExecution<'a>,
}

#[derive(Debug, Serialize)]
pub struct JsonError<'a> {
    pub code: i32,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: &'a str,
    pub action: Option<&'a str>,
    pub action_index: Option<usize>,
    pub context: &'a IndexMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonExecution<'a> {
    #[serde(rename = "macro")]
    pub macro_name: &'a str,
    pub started_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub actions_completed: usize,
}
