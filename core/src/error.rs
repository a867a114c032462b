use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start backend `{backend}`: {source}")]
    Spawn {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("backend executable `{path}` not found or not executable")]
    MissingExecutable { path: PathBuf },
    #[error("invalid prompt pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },
    #[error("failed to write to backend stdin")]
    WriteToStdin,
    #[error("session is not connected to a backend process")]
    NotConnected,
    #[error("session has failed and will not be restarted")]
    SessionFailed,
    #[error("backend produced no prompt within {timeout_ms}ms during login")]
    LoginTimeout { timeout_ms: u64 },
    #[error("no continuation request is outstanding for this expression")]
    NoPendingQuestion,
    #[error("failed to prepare backend init file: {source}")]
    InitFile {
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn spawn(backend: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Spawn {
            backend: backend.into(),
            source,
        }
    }

    pub(crate) fn pattern(pattern: impl Into<String>, source: regex_lite::Error) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
