//! deskpilot CLI
//!
//! Usage:
//!   deskpilot run <MACRO> [-p key=value]... [--params-json JSON] [--step] [--json]
//!   deskpilot list
//!   deskpilot validate <MACRO>
//!   deskpilot actions
//!
//! Global options:
//!   --config <FILE>      Configuration file (TOML format)
//!   --macros-dir <DIR>   Directory searched for macros by name
//!   -v, --verbose        Debug logging on stderr

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use deskpilot::{
    ActionRegistry, Config, Engine, ErrorDescriptor, ExecutionResult, LibraryError, MacroDefinition,
    MacroError, MacroLibrary, StepEvent, Value,
};

#[derive(Parser)]
#[command(name = "deskpilot")]
#[command(about = "Declarative GUI automation macros")]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory searched for macros by name
    #[arg(long, global = true)]
    macros_dir: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a macro
    Run(RunArgs),
    /// List macros in the macros directory
    List,
    /// Parse a macro and check its actions without running it
    Validate {
        /// Macro file path or name
        target: String,
    },
    /// List registered primitive actions
    Actions,
}

#[derive(Args)]
struct RunArgs {
    /// Macro file path or name
    target: String,

    /// Parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    params: Vec<(String, String)>,

    /// Parameters as a JSON object; -p values take precedence
    #[arg(long)]
    params_json: Option<String>,

    /// Pause after every action until Enter is pressed ('q' aborts)
    #[arg(long)]
    step: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(MacroError::from(e).exit_code());
        }
    };
    init_logging(cli.verbose, &config.engine.log_level);

    let config = match cli.macros_dir {
        Some(dir) => config.with_macros_dir(dir),
        None => config,
    };
    let library = match config.macros_dir() {
        Some(dir) => MacroLibrary::with_dir(dir),
        None => MacroLibrary::new(),
    };
    let engine = Engine::new(ActionRegistry::with_builtins(), library, config);

    let code = match cli.command {
        Command::Run(args) => run(&engine, args),
        Command::List => list(&engine),
        Command::Validate { target } => validate(&engine, &target),
        Command::Actions => actions(&engine),
    };
    std::process::exit(code);
}

/// `RUST_LOG` wins, then `-v`, then `engine.log_level`
fn init_logging(verbose: bool, configured: &str) {
    let fallback = if verbose { "debug" } else { configured };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(engine: &Engine, args: RunArgs) -> i32 {
    let params = match collect_params(&args) {
        Ok(params) => params,
        Err(message) => {
            eprintln!("Error: {}", message);
            return 2;
        }
    };

    let definition = match load(engine, &args.target) {
        Ok(definition) => definition,
        Err(error) => {
            return emit(&ExecutionResult::from_error(&args.target, error), args.json);
        }
    };

    let result = if args.step {
        step_through(engine, definition, &params)
    } else {
        engine.execute(definition, &params)
    };
    emit(&result, args.json)
}

/// `--params-json` first, then `-p` pairs on top
fn collect_params(args: &RunArgs) -> Result<IndexMap<String, Value>, String> {
    let mut params = IndexMap::new();
    if let Some(json) = &args.params_json {
        let parsed: serde_json::Value =
            serde_json::from_str(json).map_err(|e| format!("invalid --params-json: {}", e))?;
        match Value::from(parsed) {
            Value::Map(map) => params.extend(map),
            _ => return Err("--params-json must be a JSON object".to_string()),
        }
    }
    for (key, value) in &args.params {
        params.insert(key.clone(), Value::String(value.clone()));
    }
    Ok(params)
}

/// Resolve a macro, printing expression errors with source context
fn load(engine: &Engine, target: &str) -> Result<Arc<MacroDefinition>, ErrorDescriptor> {
    engine.library().resolve(target).map_err(|err| {
        if let LibraryError::Schema { source, .. } = &err {
            for issue in source.issues.iter().filter(|i| i.expression.is_some()) {
                eprintln!("{}", issue.render());
            }
        }
        ErrorDescriptor::from(&MacroError::from(err))
    })
}

fn emit(result: &ExecutionResult, json: bool) -> i32 {
    if json {
        println!("{}", result.to_json());
    } else if result.success() {
        println!("{}", result.render_plain());
    } else {
        eprintln!("{}", result.render_plain());
    }
    result.exit_code()
}

fn step_through(
    engine: &Engine,
    definition: Arc<MacroDefinition>,
    params: &IndexMap<String, Value>,
) -> ExecutionResult {
    let mut run = engine.start(definition, params);
    let cancel = run.cancel_token();
    let mut lines = io::stdin().lock().lines();
    let mut interactive = true;

    loop {
        match run.step() {
            StepEvent::Finished(_) => break,
            StepEvent::Executed(entry) => eprint!(
                "[{}] {} ({}) done in {} ms",
                entry.index, entry.action, entry.path, entry.elapsed_ms
            ),
            StepEvent::Skipped { action, path } => eprint!("skipped {} ({})", action, path),
            StepEvent::Failed { error, caught } => {
                eprintln!("! {}", error);
                if !caught {
                    continue;
                }
                eprint!("  caught by try");
            }
        }
        if !interactive {
            eprintln!();
            continue;
        }
        eprint!(" [Enter to continue, q to abort] ");
        let _ = io::stderr().flush();
        match lines.next() {
            Some(Ok(line)) if line.trim().eq_ignore_ascii_case("q") => cancel.cancel(),
            Some(Ok(_)) => {}
            _ => interactive = false,
        }
    }
    run.into_result()
}

fn list(engine: &Engine) -> i32 {
    match engine.library().list() {
        Ok(macros) if macros.is_empty() => {
            match engine.library().dir() {
                Some(dir) => println!("No macros found in {}", dir.display()),
                None => println!("No macros found"),
            }
            0
        }
        Ok(macros) => {
            for summary in macros {
                println!("{:<24} {}", summary.name, summary.description);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            MacroError::from(e).exit_code()
        }
    }
}

fn validate(engine: &Engine, target: &str) -> i32 {
    let checked = load(engine, target).and_then(|definition| {
        engine.check(&definition)?;
        Ok(definition)
    });
    match checked {
        Ok(definition) => {
            println!(
                "{}: ok ({} top-level action(s), {} primitive(s))",
                definition.name,
                definition.actions.len(),
                definition.primitive_names().len()
            );
            0
        }
        Err(error) => {
            let result = ExecutionResult::from_error(target, error);
            eprintln!("{}", result.render_plain());
            result.exit_code()
        }
    }
}

fn actions(engine: &Engine) -> i32 {
    for (name, description) in engine.registry().describe() {
        println!("{:<20} {}", name, description);
    }
    0
}
