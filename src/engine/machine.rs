//! The run loop: an explicit frame stack over the action tree

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::document::{ActionNode, Block, LogLevel, MacroDefinition, NodeKind};
use crate::engine::scope::ExecutionContext;
use crate::engine::signal::Signal;
use crate::engine::{CancelToken, Engine, EngineHost};
use crate::error::{ErrorDescriptor, ErrorKind};
use crate::expr::{EvalError, Evaluator, Field};
use crate::params;
use crate::process::{self, CommandSpec};
use crate::registry::{ActionContext, ActionError};
use crate::report::{ExecutionResult, RunState, TraceEntry};
use crate::value::Value;

const LOG_TARGET: &str = "deskpilot::macro_log";

/// What one call to [`Run::step`] did
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// A leaf action completed
    Executed(TraceEntry),
    /// A node's `when` guard was falsy
    Skipped { action: String, path: String },
    /// A node raised an error; `caught` when a `try` intercepted it
    Failed { error: ErrorDescriptor, caught: bool },
    /// The run is over
    Finished(RunState),
}

/// The node that opened a frame
#[derive(Debug, Clone)]
struct Origin {
    block: Block,
    index: usize,
}

impl Origin {
    fn node(&self) -> &ActionNode {
        &self.block[self.index]
    }
}

#[derive(Debug, Clone)]
enum FrameKind {
    Block,
    Repeat { count: u64, next: u64 },
    While { iterations: u64 },
    Foreach { items: Vec<Value>, next: usize },
    Try,
    Catch,
}

impl FrameKind {
    fn is_loop(&self) -> bool {
        matches!(
            self,
            FrameKind::Repeat { .. } | FrameKind::While { .. } | FrameKind::Foreach { .. }
        )
    }

    fn begin_iteration(&mut self) {
        match self {
            FrameKind::Repeat { next, .. } => *next += 1,
            FrameKind::While { iterations } => *iterations += 1,
            FrameKind::Foreach { next, .. } => *next += 1,
            _ => {}
        }
    }
}

/// One open block: its body, a cursor and the node that opened it
///
/// Every frame owns exactly one scope in the [`ExecutionContext`].
#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    body: Block,
    cursor: usize,
    origin: Option<Origin>,
}

impl Frame {
    fn exhausted(&self) -> bool {
        self.cursor >= self.body.len()
    }
}

/// A single execution of one macro
///
/// Drive it with [`Run::step`] (one action per call) or
/// [`Run::run_to_completion`].
pub struct Run<'e> {
    engine: &'e Engine,
    definition: Arc<MacroDefinition>,
    ctx: ExecutionContext,
    frames: Vec<Frame>,
    state: RunState,
    cancel: CancelToken,
    trace: Vec<TraceEntry>,
    stores: IndexMap<String, Value>,
    last_stored: Option<Value>,
    returned: Option<Value>,
    error: Option<ErrorDescriptor>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'e> Run<'e> {
    /// Bind params, check actions and evaluate `vars`; a failure here ends
    /// the run before its first action
    pub(crate) fn new(
        engine: &'e Engine,
        definition: Arc<MacroDefinition>,
        supplied: &IndexMap<String, Value>,
        parent: Option<&ExecutionContext>,
        cancel: CancelToken,
    ) -> Self {
        let mut call_chain = parent
            .map(|p| p.call_chain().to_vec())
            .unwrap_or_default();
        call_chain.push(definition.name.clone());
        let env = parent
            .map(ExecutionContext::env_snapshot)
            .unwrap_or_else(ExecutionContext::capture_env);

        let mut run = Self {
            engine,
            definition,
            ctx: ExecutionContext::new(env, call_chain),
            frames: Vec::new(),
            state: RunState::Running,
            cancel,
            trace: Vec::new(),
            stores: IndexMap::new(),
            last_stored: None,
            returned: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        tracing::debug!(
            macro_name = %run.definition.name,
            depth = run.ctx.call_chain().len(),
            "starting run"
        );
        if let Err(error) = run.prepare(supplied) {
            run.fail(error);
        }
        run
    }

    fn prepare(&mut self, supplied: &IndexMap<String, Value>) -> Result<(), ErrorDescriptor> {
        self.engine.check(&self.definition)?;
        let bound = params::bind(&self.definition.params, supplied)?;
        self.ctx.set_params(bound);

        let definition = Arc::clone(&self.definition);
        for (name, field) in &definition.vars {
            let value = self
                .eval_field(name, field)
                .map_err(|e| e.with_context("var", name.clone()))?;
            self.ctx.set_var(name.clone(), value);
        }

        self.push_frame(FrameKind::Block, Arc::clone(&definition.actions), None);
        Ok(())
    }

    pub fn definition(&self) -> &MacroDefinition {
        &self.definition
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        self.error.as_ref()
    }

    /// Token that aborts this run (and its sub-runs) at the next action
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute until one action completes, is skipped or fails, or the run ends
    pub fn step(&mut self) -> StepEvent {
        loop {
            if self.state.is_terminal() {
                return StepEvent::Finished(self.state);
            }
            let Some(frame) = self.frames.last_mut() else {
                self.complete();
                continue;
            };
            if frame.exhausted() {
                if let Err(error) = self.advance() {
                    return self.raise(error);
                }
                continue;
            }

            let body = Arc::clone(&frame.body);
            let index = frame.cursor;
            frame.cursor += 1;
            let node = &body[index];

            if self.cancel.is_cancelled() {
                let error = self.node_error(
                    node,
                    ErrorDescriptor::new(ErrorKind::Cancelled, "run cancelled"),
                );
                self.fail(error);
                continue;
            }

            if let Some(when) = &node.when {
                match self.eval_field("when", when) {
                    Ok(value) if !value.is_truthy() => {
                        tracing::debug!(action = node.display_name(), path = %node.path, "skipped");
                        return StepEvent::Skipped {
                            action: node.display_name().to_string(),
                            path: node.path.clone(),
                        };
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let error = self.node_error(node, error);
                        return self.raise(error);
                    }
                }
            }

            tracing::debug!(
                macro_name = %self.definition.name,
                action = node.display_name(),
                path = %node.path,
                "executing"
            );
            let started = Instant::now();
            let origin = Origin {
                block: Arc::clone(&body),
                index,
            };
            match self.execute(node, origin) {
                Signal::Error(error) => {
                    let error = self
                        .node_error(node, error)
                        .with_context("elapsed_ms", elapsed_ms(started) as i64);
                    return self.raise(error);
                }
                _ if node.kind.is_compound() => continue,
                signal => {
                    let entry = TraceEntry {
                        index: self.trace.len(),
                        action: node.display_name().to_string(),
                        kind: node.kind.action_name().to_string(),
                        path: node.path.clone(),
                        elapsed_ms: elapsed_ms(started),
                    };
                    self.trace.push(entry.clone());
                    self.unwind(signal);
                    return StepEvent::Executed(entry);
                }
            }
        }
    }

    /// Step until the run ends and report it
    pub fn run_to_completion(mut self) -> ExecutionResult {
        while !matches!(self.step(), StepEvent::Finished(_)) {}
        self.into_result()
    }

    pub fn into_result(self) -> ExecutionResult {
        ExecutionResult {
            macro_name: self.definition.name.clone(),
            state: self.state,
            result: self.returned.or(self.last_stored),
            stores: self.stores,
            trace: self.trace,
            error: self.error,
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        }
    }

    fn push_frame(&mut self, kind: FrameKind, body: Block, origin: Option<Origin>) {
        self.frames.push(Frame {
            kind,
            body,
            cursor: 0,
            origin,
        });
        self.ctx.push_scope();
    }

    fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.ctx.pop_scope();
        Some(frame)
    }

    /// Push a loop frame positioned before its first iteration
    fn push_loop(&mut self, kind: FrameKind, body: &Block, origin: Origin) {
        self.push_frame(kind, Arc::clone(body), Some(origin));
        if let Some(frame) = self.frames.last_mut() {
            frame.cursor = frame.body.len();
        }
    }

    fn in_loop(&self) -> bool {
        self.frames.iter().any(|frame| frame.kind.is_loop())
    }

    /// The top frame ran out of nodes: start the next loop iteration or close it
    fn advance(&mut self) -> Result<(), ErrorDescriptor> {
        let Some(frame) = self.frames.last() else {
            return Ok(());
        };
        let Some(origin) = frame.origin.clone() else {
            self.pop_frame();
            return Ok(());
        };
        let node = origin.node();

        let bindings = match (&frame.kind, &node.kind) {
            (FrameKind::Repeat { count, next }, NodeKind::Repeat { binding, .. }) => {
                (next < count).then(|| {
                    binding
                        .iter()
                        .map(|name| (name.clone(), Value::Int(*next as i64)))
                        .collect::<Vec<_>>()
                })
            }
            (
                FrameKind::Foreach { items, next },
                NodeKind::Foreach {
                    binding,
                    index_binding,
                    ..
                },
            ) => items.get(*next).map(|item| {
                let mut bound = vec![(binding.clone(), item.clone())];
                if let Some(index_binding) = index_binding {
                    bound.push((index_binding.clone(), Value::Int(*next as i64)));
                }
                bound
            }),
            (
                FrameKind::While { iterations },
                NodeKind::While {
                    condition,
                    max_iterations,
                    ..
                },
            ) => {
                let proceed = self
                    .eval_field("condition", condition)
                    .map_err(|e| self.node_error(node, e))?
                    .is_truthy();
                if proceed && *iterations >= *max_iterations {
                    return Err(self.node_error(
                        node,
                        ErrorDescriptor::new(
                            ErrorKind::LoopLimitExceeded,
                            format!("while loop exceeded {} iterations", max_iterations),
                        )
                        .with_context("max_iterations", *max_iterations as i64),
                    ));
                }
                proceed.then(Vec::new)
            }
            _ => None,
        };

        match bindings {
            None => {
                self.pop_frame();
            }
            Some(bindings) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.kind.begin_iteration();
                    frame.cursor = 0;
                }
                self.ctx.reset_scope();
                for (name, value) in bindings {
                    self.ctx.bind(name, value);
                }
            }
        }
        Ok(())
    }

    /// Propagate a non-error signal through the frames
    fn unwind(&mut self, signal: Signal) {
        match signal {
            Signal::Ok => {}
            Signal::Break => {
                while let Some(frame) = self.pop_frame() {
                    if frame.kind.is_loop() {
                        break;
                    }
                }
            }
            Signal::Continue => {
                while let Some(frame) = self.frames.last_mut() {
                    if frame.kind.is_loop() {
                        frame.cursor = frame.body.len();
                        break;
                    }
                    self.pop_frame();
                }
            }
            Signal::Return(value) => {
                if value.is_some() {
                    self.returned = value;
                }
                self.complete();
            }
            Signal::Error(error) => {
                self.unwind_error(error);
            }
        }
    }

    /// Pop frames up to the nearest `try` and enter its catch body; without
    /// one the run fails. Returns whether the error was caught.
    fn unwind_error(&mut self, error: ErrorDescriptor) -> bool {
        if error.kind.is_catchable() {
            while let Some(frame) = self.pop_frame() {
                if !matches!(frame.kind, FrameKind::Try) {
                    continue;
                }
                let Some(origin) = frame.origin else {
                    continue;
                };
                let NodeKind::Try { catch, .. } = &origin.node().kind else {
                    continue;
                };
                let catch = Arc::clone(catch);
                tracing::warn!(
                    macro_name = %self.definition.name,
                    error = %error,
                    "error caught by try"
                );
                self.push_frame(FrameKind::Catch, catch, Some(origin));
                self.ctx.bind("error", error.to_value());
                return true;
            }
        }
        self.fail(error);
        false
    }

    fn raise(&mut self, error: ErrorDescriptor) -> StepEvent {
        let caught = self.unwind_error(error.clone());
        StepEvent::Failed { error, caught }
    }

    fn node_error(&self, node: &ActionNode, error: ErrorDescriptor) -> ErrorDescriptor {
        error
            .with_action(node.display_name(), self.trace.len())
            .with_context("path", node.path.clone())
    }

    fn fail(&mut self, error: ErrorDescriptor) {
        self.state = if error.kind == ErrorKind::Cancelled {
            RunState::Aborted
        } else {
            RunState::Failed
        };
        tracing::warn!(
            macro_name = %self.definition.name,
            error = %error,
            actions_completed = self.trace.len(),
            "run failed"
        );
        self.error = Some(error);
        self.finish();
    }

    fn complete(&mut self) {
        self.state = RunState::Completed;
        tracing::info!(
            macro_name = %self.definition.name,
            actions_completed = self.trace.len(),
            "run completed"
        );
        self.finish();
    }

    fn finish(&mut self) {
        self.frames.clear();
        self.ctx.clear_scopes();
        self.finished_at = Some(Utc::now());
    }

    fn store(&mut self, name: &str, value: Value) {
        self.ctx.set_var(name, value.clone());
        self.stores.insert(name.to_string(), value.clone());
        self.last_stored = Some(value);
    }

    fn evaluate(&self, field: &Field) -> Result<Value, EvalError> {
        let host = EngineHost::new(self.engine, &self.definition.name, self.trace.len());
        let evaluator = Evaluator::new(&self.ctx, &host)
            .with_shell_timeout(self.engine.config().expression_shell_timeout());
        field.evaluate(&evaluator)
    }

    fn eval_field(&self, key: &str, field: &Field) -> Result<Value, ErrorDescriptor> {
        self.evaluate(field).map_err(|e| {
            ErrorDescriptor::from(e)
                .with_context("field", key)
                .with_context("expression", field.describe())
        })
    }

    fn execute(&mut self, node: &ActionNode, origin: Origin) -> Signal {
        match self.dispatch(node, origin) {
            Ok(signal) => signal,
            Err(error) => Signal::Error(error),
        }
    }

    fn dispatch(&mut self, node: &ActionNode, origin: Origin) -> Result<Signal, ErrorDescriptor> {
        match &node.kind {
            NodeKind::Primitive {
                action,
                fields,
                store_result,
            } => {
                let mut args = IndexMap::with_capacity(fields.len());
                for (key, field) in fields {
                    args.insert(key.clone(), self.eval_field(key, field)?);
                }
                let ctx = ActionContext {
                    macro_name: &self.definition.name,
                    action_index: self.trace.len(),
                    config: self.engine.config(),
                };
                let outcome = self.engine.registry().invoke(action, &args, &ctx)?;
                if let Some(name) = store_result {
                    self.store(name, outcome.value.unwrap_or(Value::Null));
                }
                Ok(Signal::Ok)
            }
            NodeKind::If {
                condition,
                then,
                otherwise,
            } => {
                let branch = if self.eval_field("condition", condition)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                if !branch.is_empty() {
                    self.push_frame(FrameKind::Block, Arc::clone(branch), Some(origin));
                }
                Ok(Signal::Ok)
            }
            NodeKind::Repeat { count, body, .. } => {
                let count = match self.eval_field("count", count)? {
                    Value::Int(n) if n >= 0 => n as u64,
                    other => {
                        return Err(ErrorDescriptor::new(
                            ErrorKind::Expression,
                            format!(
                                "repeat count must be a non-negative integer, got {} '{}'",
                                other.type_name(),
                                other.render()
                            ),
                        ))
                    }
                };
                self.push_loop(FrameKind::Repeat { count, next: 0 }, body, origin);
                Ok(Signal::Ok)
            }
            NodeKind::While { body, .. } => {
                self.push_loop(FrameKind::While { iterations: 0 }, body, origin);
                Ok(Signal::Ok)
            }
            NodeKind::Foreach { items, body, .. } => {
                let items = match self.eval_field("items", items)? {
                    Value::List(items) => items,
                    other => {
                        return Err(ErrorDescriptor::new(
                            ErrorKind::Expression,
                            format!("foreach items must be a list, got {}", other.type_name()),
                        ))
                    }
                };
                self.push_loop(FrameKind::Foreach { items, next: 0 }, body, origin);
                Ok(Signal::Ok)
            }
            NodeKind::Try { body, .. } => {
                self.push_frame(FrameKind::Try, Arc::clone(body), Some(origin));
                Ok(Signal::Ok)
            }
            NodeKind::Break | NodeKind::Continue => {
                if !self.in_loop() {
                    return Err(ErrorDescriptor::new(
                        ErrorKind::Structural,
                        format!("'{}' outside of a loop", node.kind.action_name()),
                    ));
                }
                Ok(match node.kind {
                    NodeKind::Break => Signal::Break,
                    _ => Signal::Continue,
                })
            }
            NodeKind::Call {
                macro_name,
                args,
                store_result,
            } => self.call(macro_name, args, store_result.as_deref()),
            NodeKind::SetVar { name, value } => {
                let value = self.eval_field("value", value)?;
                self.ctx.set_var(name.clone(), value);
                Ok(Signal::Ok)
            }
            NodeKind::Log { message, level } => {
                let message = self.eval_field("message", message)?.render();
                self.emit_log(*level, &message);
                Ok(Signal::Ok)
            }
            NodeKind::Fail { message } => {
                let message = self.eval_field("message", message)?.render();
                Err(ErrorDescriptor::new(ErrorKind::ExplicitFailure, message))
            }
            NodeKind::Delay { seconds } => {
                let value = self.eval_field("seconds", seconds)?;
                let duration = value
                    .as_f64()
                    .filter(|s| *s >= 0.0)
                    .and_then(|s| Duration::try_from_secs_f64(s).ok())
                    .ok_or_else(|| {
                        ErrorDescriptor::new(
                            ErrorKind::Expression,
                            format!(
                                "delay must be a non-negative number of seconds, got '{}'",
                                value.render()
                            ),
                        )
                    })?;
                thread::sleep(duration);
                Ok(Signal::Ok)
            }
            NodeKind::Shell {
                command,
                timeout,
                check,
                store_result,
            } => self.shell(command, timeout.as_ref(), check, store_result.as_deref()),
            NodeKind::Return { value } => {
                let value = value
                    .as_ref()
                    .map(|field| self.eval_field("value", field))
                    .transpose()?;
                Ok(Signal::Return(value))
            }
        }
    }

    fn call(
        &mut self,
        macro_name: &Field,
        args: &IndexMap<String, Field>,
        store_result: Option<&str>,
    ) -> Result<Signal, ErrorDescriptor> {
        let target = match self.eval_field("macro", macro_name)? {
            Value::String(name) if !name.trim().is_empty() => name,
            other => {
                return Err(ErrorDescriptor::new(
                    ErrorKind::Expression,
                    format!("call target must be a macro name, got {}", other.type_name()),
                ))
            }
        };
        let chain: Vec<Value> = self
            .ctx
            .call_chain()
            .iter()
            .map(|name| Value::from(name.as_str()))
            .chain(std::iter::once(Value::from(target.as_str())))
            .collect();
        let sub_macro_error = |message: String| {
            ErrorDescriptor::new(ErrorKind::SubMacro, message)
                .with_context("macro", target.clone())
                .with_context("call_chain", Value::List(chain.clone()))
        };

        let max_depth = self.engine.config().engine.max_call_depth;
        if self.ctx.call_chain().len() >= max_depth {
            return Err(sub_macro_error(format!(
                "call to '{}' exceeds the maximum call depth of {}",
                target, max_depth
            )));
        }

        let definition = self.engine.library().resolve(&target).map_err(|e| {
            sub_macro_error(format!("cannot call '{}': {}", target, e))
                .with_cause(ErrorDescriptor::from(e))
        })?;

        let mut supplied = IndexMap::with_capacity(args.len());
        for (key, field) in args {
            supplied.insert(key.clone(), self.eval_field(key, field)?);
        }

        tracing::debug!(caller = %self.definition.name, callee = %target, "calling macro");
        let result = Run::new(
            self.engine,
            definition,
            &supplied,
            Some(&self.ctx),
            self.cancel.clone(),
        )
        .run_to_completion();

        match (result.state, result.error) {
            (RunState::Completed, _) => {
                if let Some(name) = store_result {
                    self.store(name, result.result.unwrap_or(Value::Null));
                }
                Ok(Signal::Ok)
            }
            (RunState::Aborted, error) => Err(error
                .unwrap_or_else(|| ErrorDescriptor::new(ErrorKind::Cancelled, "run cancelled"))),
            (_, error) => {
                let inner = error.unwrap_or_else(|| {
                    ErrorDescriptor::new(ErrorKind::SubMacro, "sub-macro did not complete")
                });
                Err(
                    sub_macro_error(format!("macro '{}' failed: {}", target, inner.message))
                        .with_cause(inner),
                )
            }
        }
    }

    fn shell(
        &mut self,
        command: &Field,
        timeout: Option<&Field>,
        check: &Field,
        store_result: Option<&str>,
    ) -> Result<Signal, ErrorDescriptor> {
        let command = self.eval_field("command", command)?.render();
        let timeout = match timeout {
            None => self.engine.config().shell_timeout(),
            Some(field) => self
                .eval_field("timeout", field)?
                .as_f64()
                .filter(|secs| *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| {
                    ErrorDescriptor::new(
                        ErrorKind::Expression,
                        "shell timeout must be a positive number of seconds",
                    )
                })?,
        };
        let check = self.eval_field("check", check)?.is_truthy();

        let spec = CommandSpec::shell(&command, timeout)
            .with_display(self.engine.config().display.display.clone());
        let output = process::run(&spec).map_err(ActionError::from)?;
        if check && !output.success() {
            return Err(ActionError::failed(format!(
                "shell command exited with code {}",
                output.code
            ))
            .with_context("command", command)
            .with_context("exit_code", output.code as i64)
            .with_context("stderr", output.stderr.trim().to_string())
            .into());
        }
        if let Some(name) = store_result {
            self.store(name, Value::String(output.stdout.trim().to_string()));
        }
        Ok(Signal::Ok)
    }

    fn emit_log(&self, level: LogLevel, message: &str) {
        let name = self.definition.name.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(target: LOG_TARGET, macro_name = name, "{}", message),
            LogLevel::Debug => tracing::debug!(target: LOG_TARGET, macro_name = name, "{}", message),
            LogLevel::Info => tracing::info!(target: LOG_TARGET, macro_name = name, "{}", message),
            LogLevel::Warn => tracing::warn!(target: LOG_TARGET, macro_name = name, "{}", message),
            LogLevel::Error => tracing::error!(target: LOG_TARGET, macro_name = name, "{}", message),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
