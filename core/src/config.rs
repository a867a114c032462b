use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::error::Result;
use crate::process::ChannelMode;

pub const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 30_000;

/// Configuration for one backend, explicitly constructed and injected into
/// the session rather than read from process-wide statics. Loadable from a
/// TOML file for the CLI frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the backend executable. When relative or absent, the
    /// backend's default executable name is resolved via `PATH`.
    pub path: Option<PathBuf>,
    /// Extra arguments appended after the backend's own launch arguments.
    /// Accepts either a list or a single shell-quoted string in TOML.
    #[serde(deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Pipe keeps stdout/stderr separate; Pty is for backends that only emit
    /// prompts on an interactive terminal.
    pub channel: ChannelMode,
    /// Commands executed right after the login handshake, invisible to the
    /// user-facing history.
    pub autorun_scripts: Vec<String>,
    /// Ask the backend for LaTeX output where it supports it.
    pub typesetting: bool,
    pub login_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            working_dir: None,
            channel: ChannelMode::Pipe,
            autorun_scripts: Vec::new(),
            typesetting: false,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
        }
    }
}

impl BackendConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        List(Vec<String>),
        Line(String),
    }

    match Args::deserialize(deserializer)? {
        Args::List(args) => Ok(args),
        Args::Line(line) => {
            shlex::split(&line).ok_or_else(|| serde::de::Error::custom("unbalanced quotes"))
        }
    }
}

/// Resolve the executable a backend should spawn. An explicitly configured
/// absolute path must exist; anything else is looked up on `PATH`.
pub fn resolve_executable(configured: Option<&Path>, default_name: &str) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_absolute() => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(EngineError::MissingExecutable {
                    path: path.to_path_buf(),
                })
            }
        }
        Some(path) => which::which(path).map_err(|_| EngineError::MissingExecutable {
            path: path.to_path_buf(),
        }),
        None => which::which(default_name).map_err(|_| EngineError::MissingExecutable {
            path: PathBuf::from(default_name),
        }),
    }
}
