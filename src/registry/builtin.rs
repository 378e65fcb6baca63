//! Default desktop actions backed by X11 command line tools
//!
//! Input synthesis goes through `xdotool`, the clipboard through `xclip`,
//! window management through `wmctrl`, screenshots through `scrot` and
//! notifications through `notify-send`. Image matching and OCR are left to
//! host-registered handlers.

use crate::process::{self, CommandSpec};
use crate::registry::{
    ActionArgs, ActionContext, ActionError, ActionErrorKind, ActionHandler, ActionOutcome,
    ActionRegistry, ArgsExt,
};
use crate::value::Value;

/// One external command of an action
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.to_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self { argv, stdin: None }
    }

    fn with_stdin(mut self, input: String) -> Self {
        self.stdin = Some(input);
        self
    }
}

type BuildFn = fn(&ActionArgs) -> Result<Vec<Invocation>, ActionError>;

/// How the output of the last command becomes the action's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Unit,
    Stdout,
    MouseLocation,
    /// The `output` path written by the tool
    SavedFile,
}

/// Primitive action implemented by running tools in sequence
pub struct ToolAction {
    description: &'static str,
    build: BuildFn,
    output: Output,
    /// Exit status 1 means no matching window
    window_lookup: bool,
}

impl ToolAction {
    /// Commands this action would run for `args`
    pub fn plan(&self, args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
        (self.build)(args)
    }
}

impl ActionHandler for ToolAction {
    fn description(&self) -> &str {
        self.description
    }

    fn validate(&self, args: &ActionArgs) -> Result<(), ActionError> {
        self.plan(args).map(|_| ())
    }

    fn execute(
        &self,
        args: &ActionArgs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, ActionError> {
        let invocations = self.plan(args)?;
        let mut last_stdout = String::new();
        for invocation in invocations {
            let Some((program, rest)) = invocation.argv.split_first() else {
                continue;
            };
            let mut spec = CommandSpec::new(program.clone(), ctx.config.command_timeout())
                .args(rest.iter().cloned())
                .with_display(ctx.config.display.display.clone());
            if let Some(input) = invocation.stdin {
                spec = spec.with_stdin(input);
            }
            tracing::debug!(command = %spec.display_line(), "running tool");

            let output = process::run(&spec)?;
            if !output.success() {
                let kind = if self.window_lookup && output.code == 1 {
                    ActionErrorKind::WindowNotFound
                } else {
                    ActionErrorKind::Failed
                };
                return Err(ActionError::new(
                    kind,
                    format!("'{}' exited with code {}", spec.display_line(), output.code),
                )
                .with_context("exit_code", output.code as i64)
                .with_context("stderr", output.stderr.trim()));
            }
            last_stdout = output.stdout;
        }

        match self.output {
            Output::Unit => Ok(ActionOutcome::none()),
            Output::Stdout => Ok(ActionOutcome::value(last_stdout.trim())),
            Output::MouseLocation => parse_mouse_location(&last_stdout).map(ActionOutcome::value),
            Output::SavedFile => Ok(ActionOutcome::value(args.str_arg("output")?)),
        }
    }
}

/// Register every default action
pub fn register_builtins(registry: &mut ActionRegistry) {
    let actions: [(&str, ToolAction); 17] = [
        ("mouse.move", tool("Move the pointer to x, y", mouse_move)),
        ("mouse.click", tool("Click a mouse button", mouse_click)),
        ("mouse.click-at", tool("Move to x, y and click", mouse_click_at)),
        ("mouse.drag", tool("Drag from x1, y1 to x2, y2", mouse_drag)),
        ("mouse.scroll", tool("Scroll by amount (negative: up/left)", mouse_scroll)),
        (
            "mouse.position",
            ToolAction {
                output: Output::MouseLocation,
                ..tool("Current pointer position as {x, y}", mouse_position)
            },
        ),
        ("keyboard.type", tool("Type text", keyboard_type)),
        ("keyboard.key", tool("Press a key, optionally with modifiers", keyboard_key)),
        ("keyboard.hotkey", tool("Press a key combination such as ctrl+c", keyboard_hotkey)),
        (
            "clipboard.get",
            ToolAction {
                output: Output::Stdout,
                ..tool("Read the clipboard", clipboard_get)
            },
        ),
        ("clipboard.set", tool("Replace the clipboard text", clipboard_set)),
        ("notify", tool("Show a desktop notification", notify)),
        (
            "window.focus",
            ToolAction {
                window_lookup: true,
                ..tool("Activate the window whose title contains title", window_focus)
            },
        ),
        (
            "window.close",
            ToolAction {
                window_lookup: true,
                ..tool("Close the window whose title contains title", window_close)
            },
        ),
        (
            "window.active",
            ToolAction {
                output: Output::Stdout,
                ..tool("Title of the active window", window_active)
            },
        ),
        (
            "window.list",
            ToolAction {
                output: Output::Stdout,
                ..tool("wmctrl listing of open windows", window_list)
            },
        ),
        (
            "screen.capture",
            ToolAction {
                output: Output::SavedFile,
                ..tool("Save a screenshot to output, optionally of a region", screen_capture)
            },
        ),
    ];

    for (name, action) in actions {
        if let Err(err) = registry.register(name, action) {
            tracing::warn!(%err, "skipping builtin action");
        }
    }
}

fn tool(description: &'static str, build: BuildFn) -> ToolAction {
    ToolAction {
        description,
        build,
        output: Output::Unit,
        window_lookup: false,
    }
}

fn button_number(args: &ActionArgs) -> Result<String, ActionError> {
    let button = args.opt_str("button")?.unwrap_or_else(|| "left".to_string());
    match button.as_str() {
        "left" | "1" => Ok("1".to_string()),
        "middle" | "2" => Ok("2".to_string()),
        "right" | "3" => Ok("3".to_string()),
        other => Err(ActionError::invalid(format!("unknown mouse button '{}'", other))),
    }
}

fn click_count(args: &ActionArgs) -> Result<i64, ActionError> {
    let count = args.opt_int("count")?.unwrap_or(1);
    if count < 1 {
        return Err(ActionError::invalid("'count' must be at least 1"));
    }
    Ok(count)
}

/// First present key among aliases
fn int_alias(args: &ActionArgs, keys: &[&str]) -> Result<i64, ActionError> {
    for key in keys {
        if let Some(n) = args.opt_int(key)? {
            return Ok(n);
        }
    }
    Err(ActionError::invalid(format!(
        "missing required argument '{}'",
        keys.join("' or '")
    )))
}

fn mouse_move(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let (x, y) = (args.int_arg("x")?, args.int_arg("y")?);
    let relative = args.opt_bool("relative")?.unwrap_or(false);
    let argv = if relative {
        vec!["mousemove_relative".to_string(), "--".to_string(), x.to_string(), y.to_string()]
    } else {
        vec!["mousemove".to_string(), x.to_string(), y.to_string()]
    };
    Ok(vec![Invocation::new("xdotool", argv)])
}

fn click_args(args: &ActionArgs) -> Result<Vec<String>, ActionError> {
    let button = button_number(args)?;
    let count = click_count(args)?;
    let mut argv = vec!["click".to_string()];
    if count > 1 {
        argv.extend(["--repeat".to_string(), count.to_string()]);
    }
    argv.push(button);
    Ok(argv)
}

fn mouse_click(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    Ok(vec![Invocation::new("xdotool", click_args(args)?)])
}

fn mouse_click_at(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let (x, y) = (args.int_arg("x")?, args.int_arg("y")?);
    let mut argv = vec!["mousemove".to_string(), x.to_string(), y.to_string()];
    argv.extend(click_args(args)?);
    Ok(vec![Invocation::new("xdotool", argv)])
}

fn mouse_drag(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let x1 = int_alias(args, &["x1", "from_x"])?;
    let y1 = int_alias(args, &["y1", "from_y"])?;
    let x2 = int_alias(args, &["x2", "to_x"])?;
    let y2 = int_alias(args, &["y2", "to_y"])?;
    let button = button_number(args)?;
    Ok(vec![Invocation::new(
        "xdotool",
        [
            "mousemove".to_string(),
            x1.to_string(),
            y1.to_string(),
            "mousedown".to_string(),
            button.clone(),
            "mousemove".to_string(),
            x2.to_string(),
            y2.to_string(),
            "mouseup".to_string(),
            button,
        ],
    )])
}

fn mouse_scroll(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let amount = args.opt_int("amount")?.unwrap_or(3);
    let horizontal = args.opt_bool("horizontal")?.unwrap_or(false);
    if amount == 0 {
        return Ok(Vec::new());
    }
    // xdotool wheel buttons: 4 up, 5 down, 6 left, 7 right
    let button = match (horizontal, amount > 0) {
        (false, true) => "5",
        (false, false) => "4",
        (true, true) => "7",
        (true, false) => "6",
    };
    Ok(vec![Invocation::new(
        "xdotool",
        ["click", "--repeat", &amount.abs().to_string(), button],
    )])
}

fn mouse_position(_args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    Ok(vec![Invocation::new("xdotool", ["getmouselocation", "--shell"])])
}

fn parse_mouse_location(stdout: &str) -> Result<Value, ActionError> {
    let mut x = None;
    let mut y = None;
    for line in stdout.lines() {
        match line.split_once('=') {
            Some(("X", value)) => x = value.trim().parse::<i64>().ok(),
            Some(("Y", value)) => y = value.trim().parse::<i64>().ok(),
            _ => {}
        }
    }
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::map([("x", Value::Int(x)), ("y", Value::Int(y))])),
        _ => Err(ActionError::failed(format!(
            "unexpected getmouselocation output: {}",
            stdout.trim()
        ))),
    }
}

fn keyboard_type(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let text = args.str_arg("text")?;
    let mut argv = vec!["type".to_string()];
    if let Some(delay) = args.opt_int("delay")? {
        argv.extend(["--delay".to_string(), delay.to_string()]);
    }
    argv.extend(["--".to_string(), text]);
    Ok(vec![Invocation::new("xdotool", argv)])
}

/// Modifiers given as a list or a comma-separated string
fn modifiers(args: &ActionArgs) -> Result<Vec<String>, ActionError> {
    match args.opt("modifiers") {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()),
        Some(Value::List(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ActionError::invalid("'modifiers' must be strings"))
            })
            .collect(),
        Some(_) => Err(ActionError::invalid("'modifiers' must be a list or a string")),
    }
}

fn keyboard_key(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let key = args.str_arg("key")?;
    let mut combo = modifiers(args)?;
    combo.push(key);
    Ok(vec![Invocation::new("xdotool", ["key".to_string(), combo.join("+")])])
}

fn keyboard_hotkey(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let combo = match args.opt("combo").or_else(|| args.opt("keys")) {
        Some(Value::List(keys)) => keys.iter().map(Value::render).collect::<Vec<_>>().join("+"),
        Some(Value::String(s)) => s
            .split('+')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("+"),
        Some(_) => return Err(ActionError::invalid("'keys' must be a list or a string")),
        None => return Err(ActionError::invalid("missing required argument 'keys'")),
    };
    if combo.is_empty() {
        return Err(ActionError::invalid("'keys' must not be empty"));
    }
    Ok(vec![Invocation::new("xdotool", ["key".to_string(), combo])])
}

fn clipboard_get(_args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    Ok(vec![Invocation::new("xclip", ["-selection", "clipboard", "-o"])])
}

fn clipboard_set(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let text = args.str_arg("text")?;
    Ok(vec![
        Invocation::new("xclip", ["-selection", "clipboard", "-i"]).with_stdin(text)
    ])
}

fn notify(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let message = args.str_arg("message")?;
    let mut argv = Vec::new();
    if let Some(urgency) = args.opt_str("urgency")? {
        if !matches!(urgency.as_str(), "low" | "normal" | "critical") {
            return Err(ActionError::invalid(format!("unknown urgency '{}'", urgency)));
        }
        argv.extend(["--urgency".to_string(), urgency]);
    }
    if let Some(timeout) = args.opt_int("timeout")? {
        argv.extend(["--expire-time".to_string(), timeout.to_string()]);
    }
    if let Some(title) = args.opt_str("title")? {
        argv.push(title);
    }
    argv.push(message);
    Ok(vec![Invocation::new("notify-send", argv)])
}

fn window_focus(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let title = args.str_arg("title")?;
    Ok(vec![Invocation::new("wmctrl", ["-a".to_string(), title])])
}

fn window_close(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let title = args.str_arg("title")?;
    Ok(vec![Invocation::new("wmctrl", ["-c".to_string(), title])])
}

fn window_active(_args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    Ok(vec![Invocation::new("xdotool", ["getactivewindow", "getwindowname"])])
}

fn window_list(_args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    Ok(vec![Invocation::new("wmctrl", ["-lGpx"])])
}

fn screen_capture(args: &ActionArgs) -> Result<Vec<Invocation>, ActionError> {
    let output = args.str_arg("output")?;
    let mut argv = vec!["-o".to_string()];
    if let Some(region) = args.opt("region") {
        let parts: Vec<i64> = match region {
            Value::String(s) => s
                .split(',')
                .map(|p| p.trim().parse::<i64>())
                .collect::<Result<_, _>>()
                .map_err(|_| ActionError::invalid("'region' must be x,y,width,height"))?,
            Value::List(items) => items
                .iter()
                .map(|v| v.as_i64())
                .collect::<Option<_>>()
                .ok_or_else(|| ActionError::invalid("'region' must be x,y,width,height"))?,
            _ => return Err(ActionError::invalid("'region' must be x,y,width,height")),
        };
        if parts.len() != 4 {
            return Err(ActionError::invalid("'region' must be x,y,width,height"));
        }
        argv.extend([
            "-a".to_string(),
            parts
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
        ]);
    }
    argv.push(output);
    Ok(vec![Invocation::new("scrot", argv)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(pairs: &[(&str, Value)]) -> ActionArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn argv(action: &str, pairs: &[(&str, Value)]) -> Vec<Vec<String>> {
        let registry = ActionRegistry::with_builtins();
        assert!(registry.contains(action));
        let build = BUILDERS
            .iter()
            .find(|(name, _)| *name == action)
            .map(|(_, build)| *build)
            .expect("builder");
        build(&args(pairs))
            .expect("plans")
            .into_iter()
            .map(|inv| inv.argv)
            .collect()
    }

    const BUILDERS: &[(&str, BuildFn)] = &[
        ("mouse.click-at", mouse_click_at),
        ("mouse.drag", mouse_drag),
        ("mouse.scroll", mouse_scroll),
        ("keyboard.key", keyboard_key),
        ("keyboard.hotkey", keyboard_hotkey),
        ("keyboard.type", keyboard_type),
        ("screen.capture", screen_capture),
    ];

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_click_at_double_right() {
        assert_eq!(
            argv(
                "mouse.click-at",
                &[
                    ("x", Value::Int(10)),
                    ("y", Value::from("20")),
                    ("button", Value::from("right")),
                    ("count", Value::Int(2)),
                ]
            ),
            vec![strings(&[
                "xdotool", "mousemove", "10", "20", "click", "--repeat", "2", "3"
            ])]
        );
    }

    #[test]
    fn test_drag_accepts_aliases() {
        assert_eq!(
            argv(
                "mouse.drag",
                &[
                    ("from_x", Value::Int(1)),
                    ("from_y", Value::Int(2)),
                    ("x2", Value::Int(3)),
                    ("to_y", Value::Int(4)),
                ]
            ),
            vec![strings(&[
                "xdotool", "mousemove", "1", "2", "mousedown", "1", "mousemove", "3", "4",
                "mouseup", "1"
            ])]
        );
    }

    #[test]
    fn test_scroll_direction() {
        assert_eq!(
            argv("mouse.scroll", &[("amount", Value::Int(-2))]),
            vec![strings(&["xdotool", "click", "--repeat", "2", "4"])]
        );
        assert!(argv("mouse.scroll", &[("amount", Value::Int(0))]).is_empty());
    }

    #[test]
    fn test_keys() {
        assert_eq!(
            argv(
                "keyboard.key",
                &[("key", Value::from("t")), ("modifiers", Value::from("ctrl, shift"))]
            ),
            vec![strings(&["xdotool", "key", "ctrl+shift+t"])]
        );
        assert_eq!(
            argv(
                "keyboard.hotkey",
                &[(
                    "keys",
                    Value::List(vec![Value::from("ctrl"), Value::from("c")])
                )]
            ),
            vec![strings(&["xdotool", "key", "ctrl+c"])]
        );
    }

    #[test]
    fn test_type_text_is_not_parsed_as_option() {
        assert_eq!(
            argv("keyboard.type", &[("text", Value::from("--help"))]),
            vec![strings(&["xdotool", "type", "--", "--help"])]
        );
    }

    #[test]
    fn test_capture_region() {
        assert_eq!(
            argv(
                "screen.capture",
                &[
                    ("output", Value::from("/tmp/s.png")),
                    ("region", Value::from("0, 0, 100, 50")),
                ]
            ),
            vec![strings(&["scrot", "-o", "-a", "0,0,100,50", "/tmp/s.png"])]
        );
    }

    #[test]
    fn test_validation_rejects_bad_args() {
        let registry = ActionRegistry::with_builtins();
        let handler = registry.get("mouse.click").unwrap();
        let err = handler
            .validate(&args(&[("button", Value::from("thumb"))]))
            .unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::InvalidArguments);
        assert!(registry
            .get("mouse.move")
            .unwrap()
            .validate(&args(&[("x", Value::Int(1))]))
            .is_err());
    }

    #[test]
    fn test_parse_mouse_location() {
        let value = parse_mouse_location("X=12\nY=34\nSCREEN=0\nWINDOW=1\n").unwrap();
        assert_eq!(
            value,
            Value::map([("x", Value::Int(12)), ("y", Value::Int(34))])
        );
    }
}
