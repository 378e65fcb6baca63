//! End-to-end runs of macro documents against a recording registry

use std::sync::{Arc, Mutex};

use deskpilot::{
    parse_macro, ActionError, ActionErrorKind, ActionOutcome, ActionRegistry, Config, Engine,
    ErrorKind, ExecutionResult, MacroLibrary, RunState, StepEvent, Value,
};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;

type Log = Arc<Mutex<Vec<String>>>;

/// `record` appends its `value` argument; `boom` fails; `find` reports a
/// missing element; `lookup` returns its `key` argument upper-cased
fn recording_registry() -> (ActionRegistry, Log) {
    let log: Log = Arc::default();
    let mut registry = ActionRegistry::new();

    let sink = Arc::clone(&log);
    registry
        .register_fn("record", "Record a value", move |args, _ctx| {
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            sink.lock().unwrap().push(value.render());
            Ok(ActionOutcome::value(value))
        })
        .unwrap();
    registry
        .register_fn("boom", "Always fails", |_args, _ctx| {
            Err(ActionError::failed("boom"))
        })
        .unwrap();
    registry
        .register_fn("find", "Never finds anything", |args, _ctx| {
            Err(ActionError::new(
                ActionErrorKind::ElementNotFound,
                format!("no element matching '{}'", args["target"].render()),
            ))
        })
        .unwrap();
    registry
        .register_fn("lookup", "Upper-case a key", |args, _ctx| {
            Ok(ActionOutcome::value(args["key"].render().to_uppercase()))
        })
        .unwrap();

    (registry, log)
}

fn engine(registry: ActionRegistry) -> Engine {
    Engine::new(registry, MacroLibrary::new(), Config::default())
}

fn run(source: &str, params: &[(&str, Value)]) -> (ExecutionResult, Vec<String>) {
    let (registry, log) = recording_registry();
    let result = run_with(&engine(registry), source, params);
    let recorded = log.lock().unwrap().clone();
    (result, recorded)
}

fn run_with(engine: &Engine, source: &str, params: &[(&str, Value)]) -> ExecutionResult {
    let definition = parse_macro(source).expect("document should parse");
    let params: IndexMap<String, Value> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    engine.execute(Arc::new(definition), &params)
}

fn error_kind(result: &ExecutionResult) -> ErrorKind {
    result.error.as_ref().expect("run should have failed").kind
}

#[test]
fn test_repeat_binds_iteration_index() {
    let (result, recorded) = run(
        r#"
name: counter
actions:
  - action: repeat
    count: 4
    as: i
    actions:
      - action: record
        value: "{{ i }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["0", "1", "2", "3"]);
    assert_eq!(result.actions_completed(), 4);
}

#[test]
fn test_repeat_zero_runs_nothing() {
    let (result, recorded) = run(
        r#"
name: nothing
actions:
  - action: repeat
    count: 0
    actions:
      - action: record
        value: never
"#,
        &[],
    );
    assert!(result.success());
    assert!(recorded.is_empty());
}

#[test]
fn test_while_true_hits_iteration_cap() {
    let (result, recorded) = run(
        r#"
name: forever
actions:
  - action: while
    condition: true
    max_iterations: 3
    actions:
      - action: record
        value: tick
"#,
        &[],
    );
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(error_kind(&result), ErrorKind::LoopLimitExceeded);
    assert_eq!(recorded, vec!["tick", "tick", "tick"]);
    let error = result.error.unwrap();
    assert_eq!(error.message, "while loop exceeded 3 iterations");
    assert_eq!(error.context["max_iterations"], Value::Int(3));
}

#[test]
fn test_while_condition_sees_vars() {
    let (result, recorded) = run(
        r#"
name: countdown
vars:
  n: 3
actions:
  - action: while
    condition: "vars.n > 0"
    max_iterations: 10
    actions:
      - action: record
        value: "{{ vars.n }}"
      - action: set-var
        name: n
        value: "{{ vars.n - 1 }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["3", "2", "1"]);
}

#[test]
fn test_loop_limit_is_not_caught() {
    let (result, recorded) = run(
        r#"
name: uncatchable
actions:
  - action: try
    actions:
      - action: while
        condition: true
        max_iterations: 1
        actions:
          - action: record
            value: tick
    catch:
      - action: record
        value: caught
"#,
        &[],
    );
    assert_eq!(error_kind(&result), ErrorKind::LoopLimitExceeded);
    assert_eq!(recorded, vec!["tick"]);
}

#[test]
fn test_foreach_with_index() {
    let (result, recorded) = run(
        r#"
name: each
actions:
  - action: foreach
    items: ["a", "b", "c"]
    as: item
    index_as: i
    actions:
      - action: record
        value: "{{ i }}:{{ item }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["0:a", "1:b", "2:c"]);
}

#[test]
fn test_foreach_over_non_list_fails() {
    let (result, _) = run(
        r#"
name: each
vars:
  items: "abc"
actions:
  - action: foreach
    items: "{{ vars.items }}"
    as: item
    actions: []
"#,
        &[],
    );
    assert_eq!(error_kind(&result), ErrorKind::Expression);
}

#[test]
fn test_continue_skips_rest_of_iteration() {
    let (result, recorded) = run(
        r#"
name: odd
actions:
  - action: foreach
    items: [1, 2, 3, 4]
    as: n
    actions:
      - action: if
        condition: "n % 2 == 0"
        then:
          - action: continue
      - action: record
        value: "{{ n }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["1", "3"]);
}

#[test]
fn test_catch_binds_error_only_inside_catch() {
    let (result, recorded) = run(
        r#"
name: recover
actions:
  - action: try
    actions:
      - action: fail
        message: boom
      - action: record
        value: unreachable
    catch:
      - action: record
        value: "{{ error.type }}:{{ error.message }}"
  - action: record
    value: "{{ error.message }}"
"#,
        &[],
    );
    assert_eq!(recorded, vec!["ExplicitFailure:boom"]);
    assert_eq!(error_kind(&result), ErrorKind::Expression);
    assert_eq!(result.actions_completed(), 1);
}

#[test]
fn test_successful_try_skips_catch() {
    let (result, recorded) = run(
        r#"
name: calm
actions:
  - action: try
    actions:
      - action: record
        value: fine
    catch:
      - action: record
        value: caught
  - action: record
    value: "{{ error }}"
"#,
        &[],
    );
    assert_eq!(recorded, vec!["fine"]);
    assert_eq!(error_kind(&result), ErrorKind::Expression);
}

#[test]
fn test_catch_sees_action_errors() {
    let (result, recorded) = run(
        r#"
name: recover
actions:
  - action: try
    actions:
      - action: boom
        name: explode
    catch:
      - action: record
        value: "{{ error.action }} {{ error.message }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["explode boom"]);
}

#[test]
fn test_error_in_catch_reaches_outer_try() {
    let (result, recorded) = run(
        r#"
name: nested
actions:
  - action: try
    actions:
      - action: try
        actions:
          - action: fail
            message: first
        catch:
          - action: fail
            message: "second after {{ error.message }}"
    catch:
      - action: record
        value: "{{ error.message }}"
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["second after first"]);
}

#[test]
fn test_break_inside_try_does_not_trigger_catch() {
    let (result, recorded) = run(
        r#"
name: early
actions:
  - action: try
    actions:
      - action: foreach
        items: [1, 2, 3]
        as: n
        actions:
          - action: if
            condition: "n == 2"
            then:
              - action: break
          - action: record
            value: "{{ n }}"
    catch:
      - action: record
        value: caught
  - action: record
    value: after
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["1", "after"]);
}

#[test]
fn test_break_outside_loop_is_structural() {
    let (result, recorded) = run(
        r#"
name: stray
actions:
  - action: try
    actions:
      - action: break
    catch:
      - action: record
        value: caught
"#,
        &[],
    );
    assert_eq!(error_kind(&result), ErrorKind::Structural);
    assert!(recorded.is_empty());
}

#[test]
fn test_call_to_undefined_macro() {
    let (result, recorded) = run(
        r#"
name: caller
actions:
  - action: record
    value: before
  - action: call
    macro: helper
  - action: record
    value: after
"#,
        &[],
    );
    assert_eq!(recorded, vec!["before"]);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::SubMacro);
    assert_eq!(error.root_cause().kind, ErrorKind::MacroNotFound);
    assert_eq!(error.action_index, Some(1));
    assert_eq!(result.exit_code(), 3);
}

#[test]
fn test_call_passes_args_and_stores_result() {
    let (registry, log) = recording_registry();
    let mut library = MacroLibrary::new();
    library
        .register_source(
            r#"
name: double
params:
  n: integer
actions:
  - action: record
    value: "in double: {{ params.n }}"
  - action: return
    value: "{{ params.n * 2 }}"
"#,
        )
        .unwrap();
    let engine = Engine::new(registry, library, Config::default());

    let result = run_with(
        &engine,
        r#"
name: caller
vars:
  secret: hidden
actions:
  - action: call
    macro: double
    args:
      n: "21"
    store_result: doubled
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(result.stores["doubled"], Value::Int(42));
    assert_eq!(result.result, Some(Value::Int(42)));
    assert_eq!(*log.lock().unwrap(), vec!["in double: 21"]);
}

#[test]
fn test_callee_does_not_see_caller_vars() {
    let (registry, _log) = recording_registry();
    let mut library = MacroLibrary::new();
    library
        .register_source(
            r#"
name: peek
actions:
  - action: return
    value: "{{ vars.secret }}"
"#,
        )
        .unwrap();
    let engine = Engine::new(registry, library, Config::default());

    let result = run_with(
        &engine,
        r#"
name: caller
vars:
  secret: hidden
actions:
  - action: call
    macro: peek
"#,
        &[],
    );
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SubMacro);
    assert_eq!(error.root_cause().kind, ErrorKind::Expression);
}

#[test]
fn test_sub_macro_failure_keeps_cause_exit_code() {
    let (registry, _log) = recording_registry();
    let mut library = MacroLibrary::new();
    library
        .register_source(
            r#"
name: click-ok
actions:
  - action: find
    target: OK button
"#,
        )
        .unwrap();
    let engine = Engine::new(registry, library, Config::default());

    let result = run_with(
        &engine,
        "name: caller\nactions:\n  - action: call\n    macro: click-ok\n",
        &[],
    );
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::SubMacro);
    assert_eq!(
        error.message,
        "macro 'click-ok' failed: no element matching 'OK button'"
    );
    assert_eq!(
        error.context["call_chain"],
        Value::List(vec![Value::from("caller"), Value::from("click-ok")])
    );
    assert_eq!(result.exit_code(), 5);
}

#[test]
fn test_recursive_calls_stop_at_max_depth() {
    let (registry, _log) = recording_registry();
    let mut library = MacroLibrary::new();
    library
        .register_source("name: again\nactions:\n  - action: call\n    macro: again\n")
        .unwrap();
    let engine = Engine::new(registry, library, Config::default().with_max_call_depth(3));

    let result = engine.execute_named("again", &IndexMap::new());
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::SubMacro);
    assert!(error
        .root_cause()
        .message
        .contains("exceeds the maximum call depth of 3"));
}

#[test]
fn test_set_var_from_param_arithmetic() {
    let source = r#"
name: inc
params:
  x: integer
actions:
  - action: set-var
    name: y
    value: "{{ params.x + 1 }}"
  - action: return
    value: "{{ vars.y }}"
"#;
    let (result, _) = run(source, &[("x", Value::Int(4))]);
    assert_eq!(result.result, Some(Value::Int(5)));

    let (result, _) = run(source, &[("x", Value::from("4"))]);
    assert_eq!(result.result, Some(Value::Int(5)));
}

#[test]
fn test_missing_env_var_is_expression_error() {
    let (result, recorded) = run(
        r#"
name: env
actions:
  - action: record
    value: "{{ env.DESKPILOT_TEST_SURELY_UNSET_VARIABLE }}"
"#,
        &[],
    );
    assert!(recorded.is_empty());
    assert_eq!(error_kind(&result), ErrorKind::Expression);
    assert_eq!(result.exit_code(), 1);
}

#[test]
fn test_vars_evaluate_in_order() {
    let (result, _) = run(
        r#"
name: ordered
vars:
  a: 2
  b: "{{ vars.a * 3 }}"
actions:
  - action: return
    value: "{{ vars.b }}"
"#,
        &[],
    );
    assert_eq!(result.result, Some(Value::Int(6)));
}

#[test]
fn test_vars_forward_reference_fails_before_actions() {
    let (result, recorded) = run(
        r#"
name: forward
vars:
  a: "{{ vars.b }}"
  b: 1
actions:
  - action: record
    value: never
"#,
        &[],
    );
    assert!(recorded.is_empty());
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Expression);
    assert_eq!(error.context["var"], Value::from("a"));
}

#[test]
fn test_missing_param_fails_before_actions() {
    let (result, recorded) = run(
        r#"
name: needs-user
params:
  user: string
actions:
  - action: record
    value: "{{ params.user }}"
"#,
        &[],
    );
    assert!(recorded.is_empty());
    assert_eq!(error_kind(&result), ErrorKind::ParamValidation);
    assert_eq!(result.exit_code(), 8);
}

#[test]
fn test_unknown_primitive_rejected_before_run() {
    let (result, recorded) = run(
        r#"
name: typo
actions:
  - action: record
    value: first
  - action: recrod
    value: second
"#,
        &[],
    );
    assert!(recorded.is_empty());
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Schema);
    assert_eq!(
        error.context["issues"],
        Value::List(vec![Value::from("unknown action 'recrod'")])
    );
}

#[test]
fn test_when_guard_skips_node() {
    let (result, recorded) = run(
        r#"
name: guarded
params:
  verbose:
    type: boolean
    default: false
actions:
  - action: record
    value: loud
    when: "params.verbose"
  - action: record
    value: quiet
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["quiet"]);
}

#[test]
fn test_result_is_last_stored_value() {
    let (result, _) = run(
        r#"
name: stores
actions:
  - action: lookup
    key: first
    store_result: a
  - action: lookup
    key: second
    store_as: b
"#,
        &[],
    );
    assert_eq!(result.result, Some(Value::from("SECOND")));
    assert_eq!(result.stores.keys().collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn test_element_not_found_exit_code_and_json() {
    let (result, _) = run(
        r#"
name: clicker
actions:
  - action: record
    value: ready
  - action: find
    name: locate ok
    target: OK
"#,
        &[],
    );
    assert_eq!(result.exit_code(), 5);

    let json: serde_json::Value = serde_json::from_str(&result.to_json()).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["result"], serde_json::Value::Null);
    assert_eq!(json["error"]["code"], 5);
    assert_eq!(json["error"]["type"], "ElementNotFound");
    assert_eq!(json["error"]["action"], "locate ok");
    assert_eq!(json["error"]["action_index"], 1);
    assert_eq!(json["execution"]["macro"], "clicker");
    assert_eq!(json["execution"]["actions_completed"], 1);
    assert!(json["execution"]["failed_at"].is_string());
}

#[test]
fn test_successful_json_has_no_error() {
    let (result, _) = run(
        "name: ok\nactions:\n  - action: return\n    value: 7\n",
        &[],
    );
    let json: serde_json::Value = serde_json::from_str(&result.to_json()).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["result"], 7);
    assert!(json["error"].is_null());
    assert!(json["execution"]["failed_at"].is_null());
}

#[test]
fn test_step_executes_one_action_at_a_time() {
    let (registry, log) = recording_registry();
    let engine = engine(registry);
    let definition = parse_macro(
        r#"
name: steps
actions:
  - action: record
    value: one
  - action: repeat
    count: 2
    actions:
      - action: record
        value: loop
  - action: record
    value: skipped
    when: false
"#,
    )
    .unwrap();
    let mut run = engine.start(Arc::new(definition), &IndexMap::new());

    match run.step() {
        StepEvent::Executed(entry) => {
            assert_eq!(entry.index, 0);
            assert_eq!(entry.path, "actions[0]");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(log.lock().unwrap().len(), 1);

    assert!(matches!(run.step(), StepEvent::Executed(ref e) if e.index == 1));
    assert!(matches!(run.step(), StepEvent::Executed(ref e) if e.index == 2));
    assert_eq!(log.lock().unwrap().len(), 3);
    assert!(matches!(run.step(), StepEvent::Skipped { .. }));
    assert_eq!(run.step(), StepEvent::Finished(RunState::Completed));
    assert_eq!(run.step(), StepEvent::Finished(RunState::Completed));
    assert_eq!(run.into_result().actions_completed(), 3);
}

#[test]
fn test_cancel_aborts_before_next_action() {
    let (registry, log) = recording_registry();
    let engine = engine(registry);
    let definition = parse_macro(
        r#"
name: cancellable
actions:
  - action: record
    value: one
  - action: try
    actions:
      - action: record
        value: two
    catch:
      - action: record
        value: caught
"#,
    )
    .unwrap();
    let mut run = engine.start(Arc::new(definition), &IndexMap::new());
    assert!(matches!(run.step(), StepEvent::Executed(_)));

    run.cancel_token().cancel();
    assert_eq!(run.step(), StepEvent::Finished(RunState::Aborted));

    let result = run.into_result();
    assert_eq!(result.state, RunState::Aborted);
    assert_eq!(error_kind(&result), ErrorKind::Cancelled);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["one"]);
}

#[test]
fn test_bare_name_falls_back_to_env() {
    let Ok(path) = std::env::var("PATH") else {
        return;
    };
    let (result, _) = run(
        "name: env\nactions:\n  - action: return\n    value: \"{{ PATH }}\"\n",
        &[],
    );
    assert_eq!(result.result, Some(Value::from(path)));

    let (result, _) = run(
        "name: env\nactions:\n  - action: return\n    value: \"{{ DESKPILOT_TEST_SURELY_UNSET_VARIABLE }}\"\n",
        &[],
    );
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Expression);
    assert!(error.message.contains("DESKPILOT_TEST_SURELY_UNSET_VARIABLE"));
}

#[test]
fn test_delay_and_log_run_in_order() {
    let (result, recorded) = run(
        r#"
name: paced
actions:
  - action: log
    message: "starting {{ 1 + 1 }}"
    level: info
  - action: delay
    seconds: 0.01
  - action: record
    value: done
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(recorded, vec!["done"]);
    let kinds: Vec<&str> = result.trace.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["log", "delay", "record"]);
}

#[test]
fn test_oversized_durations_fail_cleanly() {
    let (result, _) = run(
        r#"
name: forever
vars:
  big: 1.0e30
actions:
  - action: delay
    seconds: "{{ vars.big }}"
"#,
        &[],
    );
    assert_eq!(error_kind(&result), ErrorKind::Expression);

    let (result, _) = run(
        r#"
name: forever
vars:
  big: 1.0e30
actions:
  - action: shell
    command: "true"
    timeout: "{{ vars.big }}"
"#,
        &[],
    );
    assert_eq!(error_kind(&result), ErrorKind::Expression);
    assert_eq!(result.exit_code(), 1);
}

#[cfg(unix)]
#[test]
fn test_shell_nonzero_exit_fails_by_default() {
    let (result, _) = run(
        r#"
name: sh
actions:
  - action: shell
    command: "echo hi; echo oops >&2; exit 3"
"#,
        &[],
    );
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind.type_name(), "ActionFailed");
    assert_eq!(error.context["exit_code"], Value::Int(3));
    assert_eq!(error.context["stderr"], Value::from("oops"));
    assert_eq!(result.exit_code(), 7);
}

#[cfg(unix)]
#[test]
fn test_shell_unchecked_stores_trimmed_stdout() {
    let (result, _) = run(
        r#"
name: sh
actions:
  - action: shell
    command: "printf '  hello  \n'; exit 3"
    check: false
    store_result: out
"#,
        &[],
    );
    assert!(result.success());
    assert_eq!(result.stores["out"], Value::from("hello"));
    assert_eq!(result.result, Some(Value::from("hello")));
}
