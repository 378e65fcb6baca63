//! Macro execution engine
//!
//! [`Engine`] owns the registry, the macro library and the configuration;
//! each [`Run`] walks one macro's action tree on an explicit frame stack.

mod machine;
pub mod scope;
pub mod signal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::config::Config;
use crate::document::{MacroDefinition, MacroLibrary};
use crate::error::{ErrorDescriptor, ErrorKind};
use crate::expr::Host;
use crate::process::{self, CommandSpec};
use crate::registry::{ActionArgs, ActionContext, ActionRegistry};
use crate::report::ExecutionResult;
use crate::value::Value;

pub use machine::{Run, StepEvent};
pub use scope::ExecutionContext;
pub use signal::Signal;

/// Cooperative cancellation flag, checked between actions
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs macros against a registry of primitive actions
pub struct Engine {
    registry: ActionRegistry,
    library: MacroLibrary,
    config: Config,
}

impl Engine {
    pub fn new(registry: ActionRegistry, library: MacroLibrary, config: Config) -> Self {
        Self {
            registry,
            library,
            config,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn library(&self) -> &MacroLibrary {
        &self.library
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check every primitive the document uses against the registry
    pub fn check(&self, definition: &MacroDefinition) -> Result<(), ErrorDescriptor> {
        let unknown: Vec<Value> = definition
            .primitive_names()
            .into_iter()
            .filter(|name| !self.registry.contains(name))
            .map(|name| Value::String(format!("unknown action '{}'", name)))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ErrorDescriptor::new(
            ErrorKind::Schema,
            format!("macro '{}' uses unregistered actions", definition.name),
        )
        .with_context("issues", Value::List(unknown)))
    }

    /// Begin a run that the caller drives with [`Run::step`]
    pub fn start(&self, definition: Arc<MacroDefinition>, params: &IndexMap<String, Value>) -> Run<'_> {
        self.start_with_cancel(definition, params, CancelToken::new())
    }

    /// Begin a run observing an externally held cancellation token
    pub fn start_with_cancel(
        &self,
        definition: Arc<MacroDefinition>,
        params: &IndexMap<String, Value>,
        cancel: CancelToken,
    ) -> Run<'_> {
        Run::new(self, definition, params, None, cancel)
    }

    /// Run a macro to completion
    #[tracing::instrument(skip_all, fields(macro_name = %definition.name))]
    pub fn execute(
        &self,
        definition: Arc<MacroDefinition>,
        params: &IndexMap<String, Value>,
    ) -> ExecutionResult {
        self.start(definition, params).run_to_completion()
    }

    /// Resolve a macro by path or name through the library, then run it
    pub fn execute_named(&self, target: &str, params: &IndexMap<String, Value>) -> ExecutionResult {
        match self.library.resolve(target) {
            Ok(definition) => self.execute(definition, params),
            Err(err) => {
                tracing::warn!(target_macro = target, error = %err, "cannot load macro");
                ExecutionResult::from_error(target, err.into())
            }
        }
    }
}

/// Side effects available to expressions: `shell()` and `query()`
pub(crate) struct EngineHost<'a> {
    engine: &'a Engine,
    macro_name: &'a str,
    action_index: usize,
}

impl<'a> EngineHost<'a> {
    pub(crate) fn new(engine: &'a Engine, macro_name: &'a str, action_index: usize) -> Self {
        Self {
            engine,
            macro_name,
            action_index,
        }
    }
}

impl Host for EngineHost<'_> {
    fn shell(&self, command: &str, timeout: Duration) -> Result<String, String> {
        let spec = CommandSpec::shell(command, timeout)
            .with_display(self.engine.config.display.display.clone());
        process::run(&spec)
            .map(|output| output.stdout.trim().to_string())
            .map_err(|e| e.to_string())
    }

    fn query(&self, action: &str, args: ActionArgs) -> Result<Value, String> {
        let ctx = ActionContext {
            macro_name: self.macro_name,
            action_index: self.action_index,
            config: &self.engine.config,
        };
        self.engine
            .registry
            .invoke(action, &args, &ctx)
            .map(|outcome| outcome.value.unwrap_or(Value::Null))
            .map_err(|e| e.to_string())
    }
}
