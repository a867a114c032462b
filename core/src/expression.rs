use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use abacus_protocol::ExpressionEvent;
use abacus_protocol::ExpressionResult;
use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One command submitted to a session, together with everything the backend
/// produced for it. Shared between the session's supervision task and any
/// number of frontend observers, so all mutation goes through `&self`.
///
/// The status is monotonic: once a terminal status is reached no setter can
/// move the expression again, which makes late interrupts and stray parser
/// callbacks harmless no-ops.
#[derive(Debug)]
pub struct Expression {
    command: String,
    finishing: FinishingBehavior,
    internal: bool,
    status_tx: watch::Sender<ExpressionStatus>,
    events_tx: broadcast::Sender<ExpressionEvent>,
    state: StdMutex<ExpressionState>,
}

#[derive(Debug, Default)]
struct ExpressionState {
    /// Output label id assigned by the backend, echoed back with the result.
    id: Option<u64>,
    results: Vec<ExpressionResult>,
    error_message: Option<String>,
    pending_question: Option<String>,
}

impl Expression {
    pub fn new(command: impl Into<String>, finishing: FinishingBehavior) -> Arc<Self> {
        Self::build(command.into(), finishing, false)
    }

    /// An internal bookkeeping expression: runs through the same queue as
    /// everything else but is hidden from user-facing history.
    pub fn internal(command: impl Into<String>, finishing: FinishingBehavior) -> Arc<Self> {
        Self::build(command.into(), finishing, true)
    }

    fn build(command: String, finishing: FinishingBehavior, internal: bool) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ExpressionStatus::Queued);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            command,
            finishing,
            internal,
            status_tx,
            events_tx,
            state: StdMutex::new(ExpressionState::default()),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn finishing_behavior(&self) -> FinishingBehavior {
        self.finishing
    }

    pub fn status(&self) -> ExpressionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ExpressionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExpressionEvent> {
        self.events_tx.subscribe()
    }

    pub fn id(&self) -> Option<u64> {
        self.lock_state().id
    }

    pub fn results(&self) -> Vec<ExpressionResult> {
        self.lock_state().results.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock_state().error_message.clone()
    }

    /// The question the backend is currently waiting on, if any.
    pub fn pending_question(&self) -> Option<String> {
        self.lock_state().pending_question.clone()
    }

    /// Advance the status. Backward and post-terminal transitions are
    /// silently dropped.
    pub fn set_status(&self, status: ExpressionStatus) {
        let current = self.status();
        if current == status || current.is_terminal() || rank(status) < rank(current) {
            debug!(%current, requested = %status, "ignoring status transition");
            return;
        }
        // send_replace: a plain send drops the value when no receiver is
        // subscribed, and the status must advance regardless of observers.
        self.status_tx.send_replace(status);
        self.emit(ExpressionEvent::StatusChanged { status });
    }

    pub fn add_result(&self, result: ExpressionResult) {
        self.lock_state().results.push(result);
        self.emit(ExpressionEvent::GotResult);
    }

    pub fn set_error_message(&self, message: impl Into<String>) {
        self.lock_state().error_message = Some(message.into());
    }

    pub fn set_id(&self, id: u64) {
        self.lock_state().id = Some(id);
        self.emit(ExpressionEvent::IdChanged { id });
    }

    /// Record a continuation request from the backend.
    pub fn ask_question(&self, question: impl Into<String>) {
        let question = question.into();
        self.lock_state().pending_question = Some(question.clone());
        self.emit(ExpressionEvent::NeedsAdditionalInformation { question });
    }

    /// Clear the outstanding question; returns it if one was pending.
    pub fn take_pending_question(&self) -> Option<String> {
        self.lock_state().pending_question.take()
    }

    /// Wait until the expression reaches a terminal status.
    pub async fn wait_terminal(&self) -> ExpressionStatus {
        let mut rx = self.subscribe_status();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    fn emit(&self, event: ExpressionEvent) {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.events_tx.send(event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ExpressionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn rank(status: ExpressionStatus) -> u8 {
    match status {
        ExpressionStatus::Queued => 0,
        ExpressionStatus::Computing => 1,
        ExpressionStatus::Done | ExpressionStatus::Error | ExpressionStatus::Interrupted => 2,
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        let expr = Expression::new("5+5;", FinishingBehavior::DoNotDelete);
        assert_eq!(expr.status(), ExpressionStatus::Queued);

        expr.set_status(ExpressionStatus::Computing);
        assert_eq!(expr.status(), ExpressionStatus::Computing);

        // Backward transition is dropped.
        expr.set_status(ExpressionStatus::Queued);
        assert_eq!(expr.status(), ExpressionStatus::Computing);

        expr.set_status(ExpressionStatus::Done);
        assert_eq!(expr.status(), ExpressionStatus::Done);

        // Terminal status is sticky; a late interrupt is a no-op.
        expr.set_status(ExpressionStatus::Interrupted);
        assert_eq!(expr.status(), ExpressionStatus::Done);
    }

    #[test]
    fn status_advances_without_any_subscriber() {
        // The constructor drops the initial watch receiver; transitions must
        // be stored even while nobody observes them.
        let expr = Expression::new("5+5;", FinishingBehavior::DoNotDelete);
        expr.set_status(ExpressionStatus::Computing);
        expr.set_status(ExpressionStatus::Done);
        assert_eq!(expr.status(), ExpressionStatus::Done);
    }

    #[tokio::test]
    async fn wait_terminal_sees_a_completion_that_predates_the_subscription() {
        let expr = Expression::new("5+5;", FinishingBehavior::DoNotDelete);
        expr.set_status(ExpressionStatus::Interrupted);
        assert_eq!(expr.wait_terminal().await, ExpressionStatus::Interrupted);
    }

    #[test]
    fn short_circuit_from_queued_to_done() {
        let expr = Expression::new("/* comment only */", FinishingBehavior::DoNotDelete);
        expr.set_status(ExpressionStatus::Done);
        assert_eq!(expr.status(), ExpressionStatus::Done);
        assert!(expr.results().is_empty());
    }

    #[tokio::test]
    async fn events_are_broadcast_to_subscribers() {
        let expr = Expression::new("5+5;", FinishingBehavior::DoNotDelete);
        let mut events = expr.subscribe_events();

        expr.set_status(ExpressionStatus::Computing);
        expr.set_id(1);
        expr.add_result(ExpressionResult::Text {
            text: "10".to_string(),
        });
        expr.set_status(ExpressionStatus::Done);

        assert_eq!(
            events.recv().await.unwrap(),
            ExpressionEvent::StatusChanged {
                status: ExpressionStatus::Computing
            }
        );
        assert_eq!(events.recv().await.unwrap(), ExpressionEvent::IdChanged { id: 1 });
        assert_eq!(events.recv().await.unwrap(), ExpressionEvent::GotResult);
        assert_eq!(
            events.recv().await.unwrap(),
            ExpressionEvent::StatusChanged {
                status: ExpressionStatus::Done
            }
        );
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_completion() {
        let expr = Expression::new("integrate(x, x);", FinishingBehavior::DoNotDelete);
        let waiter = {
            let expr = Arc::clone(&expr);
            tokio::spawn(async move { expr.wait_terminal().await })
        };
        expr.set_status(ExpressionStatus::Computing);
        expr.set_status(ExpressionStatus::Error);
        assert_eq!(waiter.await.unwrap(), ExpressionStatus::Error);
    }

    #[test]
    fn question_round_trip() {
        let expr = Expression::new("integrate(x^n, x);", FinishingBehavior::DoNotDelete);
        expr.ask_question("Is n equal to -1?");
        assert_eq!(expr.pending_question().as_deref(), Some("Is n equal to -1?"));
        assert_eq!(
            expr.take_pending_question().as_deref(),
            Some("Is n equal to -1?")
        );
        assert_eq!(expr.take_pending_question(), None);
    }
}
