use std::sync::Arc;

use abacus_protocol::ExpressionResult;

use crate::backend::BackendStrategy;
use crate::backend::FinishedParse;
use crate::backend::ParseContext;
use crate::backend::ParseOutcome;
use crate::backend::PreparedCommand;
use crate::config::BackendConfig;
use crate::config::resolve_executable;
use crate::error::Result;
use crate::process::SpawnSpec;
use crate::prompt::PromptHit;
use crate::prompt::PromptKind;
use crate::prompt::PromptMatcher;
use crate::variables::VariableProtocol;

/// Regex-configured profile for line-oriented interpreters.
///
/// Everything backend-specific is data: executable name, launch arguments,
/// prompt patterns and an optional statement terminator. Good enough for
/// simple REPL-style backends and for scripted fake backends in tests;
/// anything with a richer output protocol gets its own strategy.
#[derive(Clone)]
pub struct GenericStrategy {
    name: String,
    executable: String,
    launch_args: Vec<String>,
    prompts: PromptMatcher,
    terminator: Option<char>,
    logout: Option<String>,
    variables: Option<Arc<dyn VariableProtocol>>,
}

impl std::fmt::Debug for GenericStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericStrategy")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .finish()
    }
}

impl GenericStrategy {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        launch_args: Vec<String>,
        completion_pattern: &str,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            executable: executable.into(),
            launch_args,
            prompts: PromptMatcher::new(completion_pattern)?,
            terminator: None,
            logout: None,
            variables: None,
        })
    }

    pub fn with_continuation(mut self, pattern: &str) -> Result<Self> {
        self.prompts = self.prompts.with_continuation(pattern)?;
        Ok(self)
    }

    pub fn with_error_marker(mut self, pattern: &str) -> Result<Self> {
        self.prompts = self.prompts.with_error(pattern)?;
        Ok(self)
    }

    pub fn with_terminator(mut self, terminator: char) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn with_logout_command(mut self, command: impl Into<String>) -> Self {
        self.logout = Some(command.into());
        self
    }

    pub fn with_variables(mut self, protocol: Arc<dyn VariableProtocol>) -> Self {
        self.variables = Some(protocol);
        self
    }
}

impl BackendStrategy for GenericStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn spawn_spec(&self, config: &BackendConfig) -> Result<SpawnSpec> {
        let program = resolve_executable(config.path.as_deref(), &self.executable)?;
        let mut args = self.launch_args.clone();
        args.extend(config.args.iter().cloned());
        Ok(SpawnSpec {
            program,
            args,
            cwd: config.working_dir.clone(),
            mode: config.channel,
        })
    }

    fn login_complete(&self, buffer: &str) -> Option<usize> {
        self.prompts.find_completion(buffer).map(|span| span.end)
    }

    fn prepare(&self, command: &str) -> PreparedCommand {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return PreparedCommand::Done {
                results: Vec::new(),
            };
        }
        if let Some(logout) = &self.logout {
            if trimmed == logout {
                return PreparedCommand::Logout;
            }
        }
        // One command, one prompt: inner newlines would produce a prompt per
        // line and desynchronize the queue.
        let mut text = trimmed.replace('\n', " ");
        if let Some(terminator) = self.terminator {
            if !text.ends_with(terminator) {
                text.push(terminator);
            }
        }
        PreparedCommand::Run { text }
    }

    fn parse_output(&self, buffer: &str, ctx: ParseContext<'_>) -> ParseOutcome {
        let Some(PromptHit { kind, span }) = self.prompts.find(buffer) else {
            return ParseOutcome::Incomplete;
        };
        match kind {
            PromptKind::Continuation => ParseOutcome::NeedsInformation {
                question: buffer[..span.start].trim().to_string(),
                consumed: span.end,
            },
            PromptKind::Error | PromptKind::Completion => {
                // An error marker anywhere before the completion prompt turns
                // the whole output into a diagnostic.
                let completion = match self.prompts.find_completion(buffer) {
                    Some(completion) => completion,
                    None => return ParseOutcome::Incomplete,
                };
                let output = buffer[..completion.start].trim();
                let mut error = None;
                let mut results = Vec::new();
                if kind == PromptKind::Error {
                    error = Some(buffer[span.end..completion.start].trim().to_string());
                } else if !ctx.stderr.trim().is_empty() {
                    error = Some(ctx.stderr.trim().to_string());
                } else if !output.is_empty() {
                    results.push(ExpressionResult::Text {
                        text: output.to_string(),
                    });
                }
                ParseOutcome::Finished(FinishedParse {
                    consumed: completion.end,
                    id: None,
                    results,
                    error,
                })
            }
        }
    }

    fn logout_command(&self) -> Option<String> {
        self.logout.clone()
    }

    fn variables(&self) -> Option<&dyn VariableProtocol> {
        self.variables.as_deref()
    }
}
