use regex_lite::Regex;

use crate::error::EngineError;
use crate::error::Result;

/// Byte range of a match inside the cumulative output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// The backend is idle and ready for the next command.
    Completion,
    /// The backend paused mid-computation and wants more input.
    Continuation,
    /// A marker the backend prints in front of error diagnostics.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptHit {
    pub kind: PromptKind,
    pub span: Span,
}

/// Detects prompts in a backend's output stream.
///
/// Matching always runs over the whole accumulated buffer, never over
/// individual read chunks: a marker can arrive split across an arbitrary
/// chunk boundary and only becomes visible once both halves are buffered.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    completion: Regex,
    continuation: Option<Regex>,
    error: Option<Regex>,
}

impl PromptMatcher {
    pub fn new(completion: &str) -> Result<Self> {
        Ok(Self {
            completion: compile(completion)?,
            continuation: None,
            error: None,
        })
    }

    pub fn with_continuation(mut self, pattern: &str) -> Result<Self> {
        self.continuation = Some(compile(pattern)?);
        Ok(self)
    }

    pub fn with_error(mut self, pattern: &str) -> Result<Self> {
        self.error = Some(compile(pattern)?);
        Ok(self)
    }

    /// The earliest prompt occurrence in `buffer`, if any. When two patterns
    /// match at the same position the more specific one (error, then
    /// continuation) wins over the completion prompt.
    pub fn find(&self, buffer: &str) -> Option<PromptHit> {
        let mut best: Option<PromptHit> = None;
        let candidates = [
            (PromptKind::Error, self.error.as_ref()),
            (PromptKind::Continuation, self.continuation.as_ref()),
            (PromptKind::Completion, Some(&self.completion)),
        ];
        for (kind, regex) in candidates {
            let Some(regex) = regex else { continue };
            let Some(m) = regex.find(buffer) else { continue };
            let span = Span {
                start: m.start(),
                end: m.end(),
            };
            let replace = match best {
                None => true,
                Some(current) => span.start < current.span.start,
            };
            if replace {
                best = Some(PromptHit { kind, span });
            }
        }
        best
    }

    /// Like [`find`](Self::find), restricted to the completion prompt.
    pub fn find_completion(&self, buffer: &str) -> Option<Span> {
        self.completion.find(buffer).map(|m| Span {
            start: m.start(),
            end: m.end(),
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| EngineError::pattern(pattern, err))
}
