//! deskpilot - declarative GUI automation macros
//!
//! This library parses YAML macro documents, binds their parameters and runs
//! their action trees against a registry of primitive desktop actions.
//!
//! # Example
//!
//! ```rust
//! use deskpilot::{run_macro, ActionOutcome, ActionRegistry, Value};
//! use indexmap::IndexMap;
//!
//! let mut registry = ActionRegistry::new();
//! registry
//!     .register_fn("echo", "Return the text argument", |args, _ctx| {
//!         Ok(ActionOutcome::value(args["text"].clone()))
//!     })
//!     .unwrap();
//!
//! let mut params = IndexMap::new();
//! params.insert("who".to_string(), Value::from("world"));
//!
//! let result = run_macro(
//!     r#"
//! name: greet
//! params:
//!   who: { type: string }
//! actions:
//!   - action: echo
//!     text: "hello {{ params.who }}"
//!     store_result: greeting
//! "#,
//!     &params,
//!     registry,
//! )
//! .unwrap();
//!
//! assert!(result.success());
//! assert_eq!(result.result, Some(Value::from("hello world")));
//! ```

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod params;
pub mod process;
pub mod registry;
pub mod report;
pub mod value;

use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

pub use config::{Config, ConfigError};
pub use document::{
    parse_macro, LibraryError, MacroDefinition, MacroLibrary, SchemaError, SchemaIssue,
};
pub use engine::{CancelToken, Engine, ExecutionContext, Run, StepEvent};
pub use error::{ErrorDescriptor, ErrorKind, ParseError};
pub use params::{bind, ParamValidationError};
pub use registry::{
    ActionArgs, ActionContext, ActionError, ActionErrorKind, ActionHandler, ActionOutcome,
    ActionRegistry, RegistryError,
};
pub use report::{ExecutionResult, RunState, TraceEntry};
pub use value::Value;

/// Errors that can occur while setting up a run
#[derive(Debug, Error)]
pub enum MacroError {
    /// The configuration file could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The macro could not be located or read
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// The macro document is malformed
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A registry could not be populated
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl MacroError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        ErrorDescriptor::from(self).exit_code()
    }
}

impl From<&MacroError> for ErrorDescriptor {
    fn from(err: &MacroError) -> Self {
        match err {
            MacroError::Library(LibraryError::NotFound { name }) => ErrorDescriptor::new(
                ErrorKind::MacroNotFound,
                format!("macro not found: {}", name),
            ),
            MacroError::Library(LibraryError::Schema { source, .. }) | MacroError::Schema(source) => {
                ErrorDescriptor::from(source.clone())
            }
            other => ErrorDescriptor::new(ErrorKind::Schema, other.to_string()),
        }
    }
}

/// Parse a macro from YAML and run it with a fresh engine
///
/// The engine uses default configuration and an empty macro library, so
/// `call` can only reach macros given by file path.
pub fn run_macro(
    source: &str,
    params: &IndexMap<String, Value>,
    registry: ActionRegistry,
) -> Result<ExecutionResult, MacroError> {
    let definition = parse_macro(source)?;
    let engine = Engine::new(registry, MacroLibrary::new(), Config::default());
    Ok(engine.execute(Arc::new(definition), params))
}
