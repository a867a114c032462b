use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use abacus_protocol::SessionEvent;
use abacus_protocol::SessionStatus;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::backend::BackendStrategy;
use crate::backend::ParseContext;
use crate::backend::ParseOutcome;
use crate::backend::PreparedCommand;
use crate::config::BackendConfig;
use crate::error::EngineError;
use crate::error::Result;
use crate::expression::Expression;
use crate::process::ProcessChannel;
use crate::process::ProcessEvent;
use crate::variables::VariableModel;

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// A second crash while this window is open is treated as unrecoverable.
const CRASH_COOLDOWN: Duration = Duration::from_secs(1);
/// How long a backend gets to honor its quit command before being killed.
const LOGOUT_GRACE: Duration = Duration::from_secs(1);

/// The live connection to one backend process plus its command queue.
///
/// The backend stream has no framing: correctness rests entirely on strict
/// serialization. Commands go out one at a time, and the results for command
/// N are fully delivered before command N+1 is written. All queue mutation
/// and parsing happens under one state mutex, so there is a single logical
/// writer even though I/O arrives from the channel's reader tasks.
pub struct Session {
    strategy: Arc<dyn BackendStrategy>,
    config: BackendConfig,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
    state: TokioMutex<SessionState>,
    variables: VariableModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connected,
    /// Entered by the double-crash guard; terminal.
    Failed,
}

struct SessionState {
    phase: Phase,
    channel: Option<ProcessChannel>,
    queue: VecDeque<Arc<Expression>>,
    /// True once the head expression's bytes have been written; only then is
    /// incoming output attributed to it.
    head_written: bool,
    /// Cumulative stdout since the head command was written.
    cache: String,
    /// Cumulative stderr; consulted when the head completes.
    stderr_cache: String,
    /// Incremented per spawn; events from a previous process are stale.
    epoch: u64,
    /// Crash-cooldown flag (see CRASH_COOLDOWN).
    recovering: bool,
    logging_out: bool,
}

impl Session {
    pub fn new(strategy: Arc<dyn BackendStrategy>, config: BackendConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::Done);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            strategy,
            config,
            status_tx,
            events_tx,
            state: TokioMutex::new(SessionState {
                phase: Phase::Disconnected,
                channel: None,
                queue: VecDeque::new(),
                head_written: false,
                cache: String::new(),
                stderr_cache: String::new(),
                epoch: 0,
                recovering: false,
                logging_out: false,
            }),
            variables: VariableModel::default(),
        })
    }

    pub fn backend_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn variable_model(&self) -> &VariableModel {
        &self.variables
    }

    /// Spawn the backend and run the login handshake: wait (bounded) for the
    /// first ready prompt, then queue the initialization commands ahead of
    /// anything submitted concurrently. Idempotent on a connected session.
    ///
    /// Boxed: the crash-recovery respawn task re-enters login from inside
    /// the supervision future.
    pub fn login(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.login_inner())
    }

    async fn login_inner(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Connected => return Ok(()),
            Phase::Failed => return Err(EngineError::SessionFailed),
            Phase::Disconnected => {}
        }
        self.emit(SessionEvent::LoginStarted);

        let spec = self.strategy.spawn_spec(&self.config)?;
        debug!(backend = self.strategy.name(), program = %spec.program.display(), "spawning backend");
        let (channel, mut events) = ProcessChannel::spawn(spec).await?;

        let deadline = Duration::from_millis(self.config.login_timeout_ms);
        let mut startup = String::new();
        let consumed = timeout(deadline, async {
            loop {
                match events.recv().await {
                    Some(ProcessEvent::Stdout(bytes)) => {
                        startup.push_str(&String::from_utf8_lossy(&bytes));
                        if let Some(consumed) = self.strategy.login_complete(&startup) {
                            return Ok(consumed);
                        }
                    }
                    Some(ProcessEvent::Stderr(bytes)) => {
                        debug!(
                            backend = self.strategy.name(),
                            "startup stderr: {}",
                            String::from_utf8_lossy(&bytes)
                        );
                    }
                    Some(ProcessEvent::Exited(code)) => {
                        return Err(EngineError::spawn(
                            self.strategy.name(),
                            anyhow::anyhow!("backend exited during startup (code {code})"),
                        ));
                    }
                    None => {
                        return Err(EngineError::spawn(
                            self.strategy.name(),
                            anyhow::anyhow!("backend output channel closed during startup"),
                        ));
                    }
                }
            }
        })
        .await
        .map_err(|_| EngineError::LoginTimeout {
            timeout_ms: self.config.login_timeout_ms,
        })??;

        state.epoch += 1;
        let epoch = state.epoch;
        state.channel = Some(channel);
        state.phase = Phase::Connected;
        state.head_written = false;
        state.cache = startup.split_off(consumed.min(startup.len()));
        state.stderr_cache.clear();
        state.logging_out = false;

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.supervise(events, epoch).await;
        });

        // Initialization commands run ahead of anything queued concurrently.
        let mut init = Vec::new();
        if let Some(cmd) = self.strategy.typesetting_command(self.config.typesetting) {
            init.push(cmd);
        }
        if let Some(cmd) = self.strategy.autorun_command(&self.config.autorun_scripts) {
            init.push(cmd);
        }
        for cmd in init.into_iter().rev() {
            let expr = Expression::internal(cmd, FinishingBehavior::DeleteOnFinish);
            state.queue.push_front(expr);
        }

        self.emit(SessionEvent::LoginDone);
        self.update_status(&mut state);
        self.run_next(&mut state).await;
        Ok(())
    }

    /// Ask the backend to quit, killing it after a grace period. Anything
    /// still queued is cancelled.
    pub async fn logout(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.begin_logout(&mut state).await
    }

    /// Submit a command. Returns immediately; the expression completes
    /// asynchronously in queue order.
    pub async fn evaluate(
        self: &Arc<Self>,
        command: impl Into<String>,
        behavior: FinishingBehavior,
    ) -> Result<Arc<Expression>> {
        self.enqueue(Expression::new(command.into(), behavior)).await
    }

    /// Submit an engine-internal bookkeeping command. Identical queue
    /// discipline, hidden from user-facing history.
    pub async fn evaluate_internal(
        self: &Arc<Self>,
        command: impl Into<String>,
        behavior: FinishingBehavior,
    ) -> Result<Arc<Expression>> {
        self.enqueue(Expression::internal(command.into(), behavior)).await
    }

    async fn enqueue(self: &Arc<Self>, expr: Arc<Expression>) -> Result<Arc<Expression>> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Failed => return Err(EngineError::SessionFailed),
            Phase::Disconnected => return Err(EngineError::NotConnected),
            Phase::Connected => {}
        }
        state.queue.push_back(Arc::clone(&expr));
        self.update_status(&mut state);
        self.run_next(&mut state).await;
        Ok(expr)
    }

    /// Interrupt the in-flight computation: signal the process, mark the
    /// head and everything queued behind it Interrupted, and drop the
    /// accumulator. A backend in an interrupted state cannot be trusted to
    /// sequence the rest of the queue.
    pub async fn interrupt(&self) {
        let mut state = self.state.lock().await;
        if state.queue.is_empty() {
            return;
        }
        if state.head_written {
            if let Some(channel) = &state.channel {
                channel.interrupt();
            }
        }
        self.cancel_queue(&mut state);
    }

    /// Interrupt one expression. For the head this is a full interrupt; an
    /// expression still waiting in the queue is simply removed without
    /// touching the process.
    pub async fn interrupt_expression(&self, expr: &Arc<Expression>) {
        let mut state = self.state.lock().await;
        let is_head = state
            .queue
            .front()
            .is_some_and(|head| Arc::ptr_eq(head, expr));
        if is_head {
            if state.head_written {
                if let Some(channel) = &state.channel {
                    channel.interrupt();
                }
            }
            self.cancel_queue(&mut state);
        } else {
            state.queue.retain(|queued| !Arc::ptr_eq(queued, expr));
            expr.set_status(ExpressionStatus::Interrupted);
            self.update_status(&mut state);
        }
    }

    /// Answer an outstanding continuation question of the head expression.
    /// The answer goes straight to the process; it is not a queue entry.
    pub async fn add_information(&self, answer: &str) -> Result<()> {
        let state = self.state.lock().await;
        let head = state
            .queue
            .front()
            .cloned()
            .ok_or(EngineError::NoPendingQuestion)?;
        head.take_pending_question()
            .ok_or(EngineError::NoPendingQuestion)?;
        let mut text = self.strategy.format_information(answer);
        text.push('\n');
        let channel = state.channel.as_ref().ok_or(EngineError::NotConnected)?;
        channel.write(text.into_bytes()).await?;
        Ok(())
    }

    /// Issue the backend's variable introspection command and refresh the
    /// model from its response. No-op for backends without that protocol.
    pub async fn refresh_variables(self: &Arc<Self>) -> Result<()> {
        let command = match self.strategy.variables() {
            Some(protocol) => protocol.refresh_command(),
            None => return Ok(()),
        };
        let expr = self
            .evaluate_internal(command, FinishingBehavior::DeleteOnFinish)
            .await?;
        let status = expr.wait_terminal().await;
        if status != ExpressionStatus::Done {
            return Ok(());
        }
        let text: String = expr
            .results()
            .iter()
            .filter_map(|result| result.as_text().map(String::from))
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(protocol) = self.strategy.variables() {
            self.variables.replace(protocol.parse_listing(&text));
        }
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut events: mpsc::Receiver<ProcessEvent>, epoch: u64) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(bytes) => self.on_stdout(epoch, bytes).await,
                ProcessEvent::Stderr(bytes) => self.on_stderr(epoch, bytes).await,
                ProcessEvent::Exited(code) => {
                    self.on_exited(epoch, code).await;
                    break;
                }
            }
        }
    }

    async fn on_stdout(self: &Arc<Self>, epoch: u64, bytes: Vec<u8>) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        state.cache.push_str(&String::from_utf8_lossy(&bytes));
        if state.head_written {
            self.parse_head(&mut state).await;
        }
    }

    async fn on_stderr(&self, epoch: u64, bytes: Vec<u8>) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        state
            .stderr_cache
            .push_str(&String::from_utf8_lossy(&bytes));
    }

    async fn on_exited(self: &Arc<Self>, epoch: u64, code: i32) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        state.channel = None;
        state.phase = Phase::Disconnected;
        state.head_written = false;
        state.cache.clear();
        state.stderr_cache.clear();

        if state.logging_out {
            debug!(backend = self.strategy.name(), code, "backend exited after logout");
            state.logging_out = false;
            self.update_status(&mut state);
            return;
        }

        warn!(backend = self.strategy.name(), code, "backend exited unexpectedly");
        self.emit(SessionEvent::Error {
            message: format!("backend process exited unexpectedly (code {code})"),
        });

        // The head can no longer be answered; everything behind it is moot.
        if let Some(head) = state.queue.pop_front() {
            head.set_error_message(format!(
                "backend process exited unexpectedly (code {code})"
            ));
            head.set_status(ExpressionStatus::Error);
        }
        for expr in state.queue.drain(..) {
            expr.set_status(ExpressionStatus::Interrupted);
        }
        self.variables.clear();

        if state.recovering {
            error!(
                backend = self.strategy.name(),
                "second crash within the cooldown window; giving up"
            );
            state.phase = Phase::Failed;
            self.emit(SessionEvent::Error {
                message: "backend crashed twice in quick succession; session disabled".to_string(),
            });
            self.update_status(&mut state);
            return;
        }

        state.recovering = true;
        self.update_status(&mut state);
        drop(state);

        let cooldown = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CRASH_COOLDOWN).await;
            let mut state = cooldown.state.lock().await;
            if state.phase != Phase::Failed {
                state.recovering = false;
            }
        });

        let respawn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = respawn.login().await {
                error!(backend = respawn.strategy.name(), %err, "respawn after crash failed");
                let mut state = respawn.state.lock().await;
                state.phase = Phase::Failed;
                respawn.emit(SessionEvent::Error {
                    message: format!("failed to restart backend: {err}"),
                });
                respawn.update_status(&mut state);
            }
        });
    }

    async fn parse_head(self: &Arc<Self>, state: &mut SessionState) {
        let Some(head) = state.queue.front().cloned() else {
            return;
        };
        let outcome = self.strategy.parse_output(
            &state.cache,
            ParseContext {
                command: head.command(),
                stderr: &state.stderr_cache,
            },
        );
        match outcome {
            ParseOutcome::Incomplete => {}
            ParseOutcome::NeedsInformation { question, consumed } => {
                state.cache.drain(..consumed.min(state.cache.len()));
                debug!(backend = self.strategy.name(), %question, "backend requests more input");
                head.ask_question(question);
            }
            ParseOutcome::Finished(parsed) => {
                state.cache.drain(..parsed.consumed.min(state.cache.len()));
                state.stderr_cache.clear();
                state.head_written = false;
                if let Some(id) = parsed.id {
                    head.set_id(id);
                }
                for result in parsed.results {
                    head.add_result(result);
                }
                match parsed.error {
                    Some(message) => {
                        head.set_error_message(message);
                        head.set_status(ExpressionStatus::Error);
                    }
                    None => head.set_status(ExpressionStatus::Done),
                }
                state.queue.pop_front();
                self.run_next(state).await;
            }
        }
    }

    /// Write the head command, short-circuiting entries the backend can
    /// answer without the process. Loops because a short-circuited head
    /// exposes the next entry.
    async fn run_next(self: &Arc<Self>, state: &mut SessionState) {
        loop {
            if state.head_written {
                return;
            }
            let Some(head) = state.queue.front().cloned() else {
                self.update_status(state);
                return;
            };
            match self.strategy.prepare(head.command()) {
                PreparedCommand::Run { mut text } => {
                    let Some(channel) = state.channel.as_ref() else {
                        return;
                    };
                    text.push('\n');
                    state.cache.clear();
                    state.stderr_cache.clear();
                    state.head_written = true;
                    head.set_status(ExpressionStatus::Computing);
                    debug!(backend = self.strategy.name(), command = head.command(), "writing command");
                    if channel.write(text.into_bytes()).await.is_err() {
                        warn!(backend = self.strategy.name(), "write to backend failed");
                    }
                    return;
                }
                PreparedCommand::Done { results } => {
                    // Never touches the process; a write would desynchronize
                    // the prompt matcher.
                    for result in results {
                        head.add_result(result);
                    }
                    head.set_status(ExpressionStatus::Done);
                    state.queue.pop_front();
                }
                PreparedCommand::Error { message } => {
                    head.set_error_message(message);
                    head.set_status(ExpressionStatus::Error);
                    state.queue.pop_front();
                }
                PreparedCommand::Logout => {
                    state.queue.pop_front();
                    head.set_status(ExpressionStatus::Done);
                    if let Err(err) = self.begin_logout(state).await {
                        warn!(backend = self.strategy.name(), %err, "logout failed");
                    }
                    return;
                }
            }
            self.update_status(state);
        }
    }

    async fn begin_logout(self: &Arc<Self>, state: &mut SessionState) -> Result<()> {
        for expr in state.queue.drain(..) {
            expr.set_status(ExpressionStatus::Interrupted);
        }
        state.head_written = false;
        state.cache.clear();
        state.stderr_cache.clear();
        self.variables.clear();
        self.update_status(state);

        let Some(channel) = state.channel.as_ref() else {
            state.phase = Phase::Disconnected;
            return Ok(());
        };
        state.logging_out = true;
        if let Some(mut command) = self.strategy.logout_command() {
            command.push('\n');
            channel.write(command.into_bytes()).await?;
        }

        let session = Arc::clone(self);
        let epoch = state.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(LOGOUT_GRACE).await;
            let state = session.state.lock().await;
            if state.epoch == epoch {
                if let Some(channel) = &state.channel {
                    debug!(backend = session.strategy.name(), "backend ignored quit; killing");
                    channel.kill();
                }
            }
        });
        Ok(())
    }

    fn cancel_queue(&self, state: &mut SessionState) {
        for expr in state.queue.drain(..) {
            expr.set_status(ExpressionStatus::Interrupted);
        }
        state.head_written = false;
        state.cache.clear();
        state.stderr_cache.clear();
        self.update_status(state);
    }

    fn update_status(&self, state: &mut SessionState) {
        let status = if state.phase == Phase::Failed {
            SessionStatus::Failed
        } else if state.queue.is_empty() {
            SessionStatus::Done
        } else {
            SessionStatus::Running
        };
        if *self.status_tx.borrow() != status {
            // send_replace: the value must be stored even with no
            // subscribed receiver.
            self.status_tx.send_replace(status);
            self.emit(SessionEvent::StatusChanged { status });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}
