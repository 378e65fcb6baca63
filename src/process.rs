//! Blocking subprocess execution with a hard timeout

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Tools that talk to the X server and need `DISPLAY`
const X11_TOOLS: &[&str] = &["xdotool", "scrot", "maim", "wmctrl", "xclip", "xwininfo", "xprop"];

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("command '{program}' not found")]
    NotFound { program: String },

    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("command '{command}' failed with exit code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("I/O error running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Value for `DISPLAY` when the program is an X11 tool and the
    /// environment does not set one
    pub display: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout,
            display: None,
        }
    }

    /// `sh -c command`
    pub fn shell(command: &str, timeout: Duration) -> Self {
        Self::new("sh", timeout).arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Command line for messages
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a command to completion, killing it when the timeout elapses
///
/// A non-zero exit is not an error here; see [`run_checked`].
pub fn run(spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
    let command_line = spec.display_line();
    let io_err = |source: std::io::Error| ProcessError::Io {
        command: command_line.clone(),
        source,
    };

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(display) = &spec.display {
        if X11_TOOLS.contains(&spec.program.as_str()) && std::env::var_os("DISPLAY").is_none() {
            command.env("DISPLAY", display);
        }
    }

    tracing::trace!(command = %command_line, "spawning");
    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProcessError::NotFound {
            program: spec.program.clone(),
        },
        _ => io_err(e),
    })?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        // Written from a thread so a child that never reads cannot block us
        thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        });
    }

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = match wait_with_timeout(&mut child, spec.timeout).map_err(io_err)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::Timeout {
                command: command_line,
                timeout: spec.timeout,
            });
        }
    };

    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
    })
}

/// Run a command and turn a non-zero exit into [`ProcessError::Failed`]
pub fn run_checked(spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
    let output = run(spec)?;
    if !output.success() {
        return Err(ProcessError::Failed {
            command: spec.display_line(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_and_code() {
        let output = run(&CommandSpec::shell("echo hi; echo err >&2; exit 3", Duration::from_secs(5)))
            .unwrap();
        assert_eq!(output.stdout.trim(), "hi");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.code, 3);
    }

    #[test]
    fn test_stdin_is_forwarded() {
        let output = run(&CommandSpec::new("cat", Duration::from_secs(5)).with_stdin("piped")).unwrap();
        assert_eq!(output.stdout, "piped");
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let result = run(&CommandSpec::shell("sleep 5", Duration::from_millis(100)));
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program() {
        let result = run(&CommandSpec::new("deskpilot-no-such-tool", Duration::from_secs(1)));
        assert!(matches!(result, Err(ProcessError::NotFound { .. })));
    }

    #[test]
    fn test_run_checked_reports_failure() {
        let result = run_checked(&CommandSpec::shell("echo bad >&2; exit 1", Duration::from_secs(5)));
        match result {
            Err(ProcessError::Failed { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "bad");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }
}
