use abacus_protocol::ExpressionResult;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::process::SpawnSpec;
use crate::variables::VariableProtocol;

/// What to do with a command before it is handed to the queue.
///
/// Backends get the chance to reject or answer a command without ever
/// touching the child process; `Run` is the normal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedCommand {
    /// Write this text (terminator already applied) to the process.
    Run { text: String },
    /// The command is trivially complete, e.g. consists only of comments.
    Done { results: Vec<ExpressionResult> },
    /// The command is malformed and never reaches the process.
    Error { message: String },
    /// The command is the backend's own quit command; the session should run
    /// its logout sequence instead of queuing it.
    Logout,
}

/// Result of feeding the cumulative output buffer to a backend's parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// No completion marker yet; keep accumulating.
    Incomplete,
    /// The backend paused and is waiting for an answer to `question`.
    /// `consumed` bytes of the buffer belong to this pause and are dropped.
    NeedsInformation { question: String, consumed: usize },
    /// The completion prompt arrived; the expression is finished.
    Finished(FinishedParse),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinishedParse {
    /// Bytes of the buffer owned by this expression, including its prompt.
    /// Everything after them already belongs to the next expression.
    pub consumed: usize,
    /// Output label id the backend echoed, if it did.
    pub id: Option<u64>,
    pub results: Vec<ExpressionResult>,
    /// When set the expression finishes as `Error` instead of `Done`.
    pub error: Option<String>,
}

/// Per-call context for [`BackendStrategy::parse_output`].
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// The command this output belongs to. Some backends interpret output
    /// differently per command kind (help requests, variable listings).
    pub command: &'a str,
    /// Everything the process printed to stderr since the command was sent.
    /// Empty in pty mode.
    pub stderr: &'a str,
}

/// Everything that differs between backends, collected in one data-driven
/// profile object. Sessions hold a strategy and stay completely generic:
/// adding a backend means implementing this trait, not subclassing the
/// session machinery.
pub trait BackendStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Executable, arguments and channel mode for this backend.
    fn spawn_spec(&self, config: &BackendConfig) -> Result<SpawnSpec>;

    /// Scan the startup output for the first ready prompt. Returns the number
    /// of buffer bytes the login handshake consumed, or `None` while the
    /// backend is still starting up.
    fn login_complete(&self, buffer: &str) -> Option<usize>;

    /// Pre-process a user command, applying the statement terminator and any
    /// rewrites, or short-circuiting it entirely.
    fn prepare(&self, command: &str) -> PreparedCommand;

    /// Inspect the cumulative output buffer for the in-flight expression.
    fn parse_output(&self, buffer: &str, ctx: ParseContext<'_>) -> ParseOutcome;

    /// Turn an answer to a continuation question into the bytes to send
    /// (without the trailing newline, which the session appends).
    fn format_information(&self, answer: &str) -> String {
        answer.to_string()
    }

    /// Command that asks the backend to exit cleanly, if it has one.
    fn logout_command(&self) -> Option<String> {
        None
    }

    /// Single internal command that runs the configured autorun scripts.
    fn autorun_command(&self, scripts: &[String]) -> Option<String> {
        if scripts.is_empty() {
            None
        } else {
            Some(scripts.join("; "))
        }
    }

    /// Internal command toggling typeset (LaTeX) output, where supported.
    fn typesetting_command(&self, _enable: bool) -> Option<String> {
        None
    }

    /// Variable introspection protocol, for backends that have one.
    fn variables(&self) -> Option<&dyn VariableProtocol> {
        None
    }
}
