//! Shared data types for the abacus execution engine.
//!
//! This crate carries no I/O: it defines the status enums, result payloads
//! and observable event payloads exchanged between the engine
//! (`abacus-core`) and its frontends. Everything here is serde-serializable
//! so worksheet persistence layers can store it as-is.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle of one backend session.
///
/// `Running` holds exactly while the command queue is non-empty and the head
/// expression has not reached a terminal status. `Failed` is entered only by
/// the double-crash guard and is terminal: no further commands are accepted
/// and no respawn is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Done,
    Failed,
}

/// Status of one submitted command.
///
/// Transitions are monotonic and one-directional:
/// `Queued → Computing → {Done, Error, Interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExpressionStatus {
    Queued,
    Computing,
    Done,
    Error,
    Interrupted,
}

impl ExpressionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Interrupted)
    }
}

/// Whether an expression keeps its results around after finishing or is a
/// fire-and-forget bookkeeping command whose owner drops it on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishingBehavior {
    DoNotDelete,
    DeleteOnFinish,
}

/// One typed output artifact produced by an expression.
///
/// Rendering (LaTeX → image, EPS → PDF, ...) happens outside the engine;
/// these variants only carry the data a renderer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpressionResult {
    Text {
        text: String,
    },
    /// LaTeX markup plus the plain-text fallback the backend printed.
    Latex {
        latex: String,
        plain: String,
    },
    Html {
        html: String,
        plain: String,
    },
    /// Help/documentation text, which several backends deliver on the error
    /// channel even though it is not an error.
    Help {
        text: String,
    },
    Image {
        path: PathBuf,
    },
    Eps {
        path: PathBuf,
    },
    Error {
        message: String,
    },
}

impl ExpressionResult {
    /// The plain-text rendition of this result, if it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Help { text } => Some(text),
            Self::Latex { plain, .. } | Self::Html { plain, .. } => Some(plain),
            Self::Error { message } => Some(message),
            Self::Image { .. } | Self::Eps { .. } => None,
        }
    }
}

/// Fire-and-forget notifications a session broadcasts to its listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    LoginStarted,
    LoginDone,
    StatusChanged { status: SessionStatus },
    Error { message: String },
}

/// Fire-and-forget notifications an expression broadcasts to its listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExpressionEvent {
    StatusChanged { status: ExpressionStatus },
    GotResult,
    /// The backend paused mid-computation and is waiting for an answer.
    NeedsAdditionalInformation { question: String },
    /// The backend echoed the output label this expression was assigned.
    IdChanged { id: u64 },
}
