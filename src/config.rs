//! Runtime configuration loaded from TOML
//!
//! The file lives at `<config dir>/deskpilot/config.toml` unless a path is
//! given explicitly. Every key is optional; missing keys keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    /// Injected as `DISPLAY` for X11 tools when the environment has none
    pub display: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            display: ":0".to_string(),
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Tool-backed primitive actions
    pub command: f64,
    /// The `shell` action
    pub shell: f64,
    /// The `shell()` expression builtin
    pub expression_shell: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command: 30.0,
            shell: 60.0,
            expression_shell: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_call_depth: usize,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 16,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub macros_dir: Option<PathBuf>,
}

/// Immutable configuration threaded into the engine
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub display: DisplayConfig,
    pub timeouts: TimeoutConfig,
    pub engine: EngineConfig,
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("deskpilot").join("config.toml"))
    }

    /// Load an explicit file, or the default file if it exists, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Directory searched for macros by name
    pub fn macros_dir(&self) -> Option<PathBuf> {
        self.paths.macros_dir.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join("deskpilot").join("macros"))
        })
    }

    pub fn command_timeout(&self) -> Duration {
        seconds(self.timeouts.command)
    }

    pub fn shell_timeout(&self) -> Duration {
        seconds(self.timeouts.shell)
    }

    pub fn expression_shell_timeout(&self) -> Duration {
        seconds(self.timeouts.expression_shell)
    }

    /// Set the X11 display
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display.display = display.into();
        self
    }

    /// Set the macros directory
    pub fn with_macros_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.macros_dir = Some(dir.into());
        self
    }

    /// Set the maximum nesting of `call` actions
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.engine.max_call_depth = depth;
        self
    }

    /// Set the default timeout of the `shell` action in seconds
    pub fn with_shell_timeout(mut self, seconds: f64) -> Self {
        self.timeouts.shell = seconds;
        self
    }

    /// Set the default timeout of tool-backed actions in seconds
    pub fn with_command_timeout(mut self, seconds: f64) -> Self {
        self.timeouts.command = seconds;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("timeouts.command", self.timeouts.command),
            ("timeouts.shell", self.timeouts.shell),
            ("timeouts.expression_shell", self.timeouts.expression_shell),
        ];
        for (key, secs) in timeouts {
            if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("expected a positive number of seconds, got {}", secs),
                });
            }
        }
        if self.engine.max_call_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.max_call_depth",
                message: "must be at least 1".to_string(),
            });
        }
        if !matches!(
            self.engine.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            return Err(ConfigError::Invalid {
                key: "engine.log_level",
                message: format!("unknown level '{}'", self.engine.log_level),
            });
        }
        Ok(())
    }
}

/// Unrepresentable values from the `with_*` builders saturate
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
