//! Macro lookup through a macros directory

use std::fs;
use std::path::Path;

use deskpilot::{
    ActionOutcome, ActionRegistry, Config, Engine, ErrorKind, MacroLibrary, RunState, Value,
};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn write(dir: &Path, file: &str, content: &str) {
    fs::write(dir.join(file), content).unwrap();
}

fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry
        .register_fn("echo", "Return the text argument", |args, _ctx| {
            Ok(ActionOutcome::value(args["text"].clone()))
        })
        .unwrap();
    registry
}

fn macros_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "greet.yaml",
        r#"
name: greet
description: Say hello
params:
  who:
    type: string
    default: world
actions:
  - action: echo
    text: "hello {{ params.who }}"
    store_result: greeting
"#,
    );
    write(
        dir.path(),
        "welcome.yml",
        r#"
name: welcome
description: Greet twice through greet
actions:
  - action: call
    macro: greet
    args:
      who: team
    store_result: first
  - action: call
    macro: greet
    store_result: second
  - action: return
    value: "{{ vars.first }} / {{ vars.second }}"
"#,
    );
    write(
        dir.path(),
        "renamed-file.yaml",
        "name: hidden-name\ndescription: File name differs\nactions: []\n",
    );
    write(dir.path(), "notes.txt", "not a macro");
    dir
}

fn engine(dir: &Path) -> Engine {
    let config = Config::default().with_macros_dir(dir);
    let library = MacroLibrary::with_dir(dir);
    Engine::new(registry(), library, config)
}

#[test]
fn test_run_by_name() {
    let dir = macros_dir();
    let result = engine(dir.path()).execute_named("greet", &IndexMap::new());
    assert!(result.success());
    assert_eq!(result.result, Some(Value::from("hello world")));
}

#[test]
fn test_run_by_path() {
    let dir = macros_dir();
    let path = dir.path().join("greet.yaml");
    let mut params = IndexMap::new();
    params.insert("who".to_string(), Value::from("path"));

    let result = engine(dir.path()).execute_named(&path.to_string_lossy(), &params);
    assert_eq!(result.result, Some(Value::from("hello path")));
}

#[test]
fn test_calls_resolve_by_name() {
    let dir = macros_dir();
    let result = engine(dir.path()).execute_named("welcome", &IndexMap::new());
    assert!(result.success());
    assert_eq!(result.result, Some(Value::from("hello team / hello world")));
}

#[test]
fn test_name_found_by_scanning_documents() {
    let dir = macros_dir();
    let result = engine(dir.path()).execute_named("hidden-name", &IndexMap::new());
    assert_eq!(result.state, RunState::Completed);
}

#[test]
fn test_unknown_name_is_not_found() {
    let dir = macros_dir();
    let result = engine(dir.path()).execute_named("missing", &IndexMap::new());
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::MacroNotFound);
    assert_eq!(result.exit_code(), 3);
    assert_eq!(result.actions_completed(), 0);
}

#[test]
fn test_malformed_file_reports_schema_error() {
    let dir = macros_dir();
    write(
        dir.path(),
        "broken.yaml",
        "name: broken\nactions:\n  - action: echo\n    text: \"{{ 1 + }}\"\n",
    );
    let result = engine(dir.path()).execute_named("broken", &IndexMap::new());
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Schema);
    assert!(error.context.contains_key("issues"));
    assert!(error.context.contains_key("path"));
    assert_eq!(result.state, RunState::Failed);
}

#[test]
fn test_list_sorted_and_skips_bad_files() {
    let dir = macros_dir();
    write(dir.path(), "zz-broken.yaml", "name: [not, a, string]\n");

    let library = MacroLibrary::with_dir(dir.path());
    let names: Vec<(String, String)> = library
        .list()
        .unwrap()
        .into_iter()
        .map(|summary| (summary.name, summary.description))
        .collect();
    assert_eq!(
        names,
        vec![
            ("greet".to_string(), "Say hello".to_string()),
            ("hidden-name".to_string(), "File name differs".to_string()),
            ("welcome".to_string(), "Greet twice through greet".to_string()),
        ]
    );
}

#[test]
fn test_registered_macro_shadows_directory() {
    let dir = macros_dir();
    let mut library = MacroLibrary::with_dir(dir.path());
    library
        .register_source("name: greet\nactions:\n  - action: return\n    value: registered\n")
        .unwrap();
    let engine = Engine::new(registry(), library, Config::default());

    let result = engine.execute_named("greet", &IndexMap::new());
    assert_eq!(result.result, Some(Value::from("registered")));
}
