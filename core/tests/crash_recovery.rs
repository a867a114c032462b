#![cfg(unix)]
#![expect(clippy::expect_used)]

mod common;

use abacus_core::EngineError;
use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use abacus_protocol::SessionEvent;
use abacus_protocol::SessionStatus;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

use crate::common::FAKE_BACKEND;
use crate::common::WAIT;
use crate::common::result_texts;
use crate::common::start_session;
use crate::common::wait_for_event;

#[tokio::test]
async fn crash_fails_the_head_cancels_the_queue_and_respawns() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;
    let mut events = session.subscribe_events();

    let head = session
        .evaluate("crash", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate crash");
    let queued = session
        .evaluate("1+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate queued");

    // Never left stuck in Computing.
    let status = timeout(WAIT, head.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Error);
    assert!(head.error_message().is_some());

    let status = timeout(WAIT, queued.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Interrupted);

    wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::Error { .. })
    })
    .await;
    // One automatic respawn brings the session back.
    wait_for_event(&mut events, |event| matches!(event, SessionEvent::LoginDone)).await;

    let expr = session
        .evaluate("0+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate after respawn");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["1"]);
}

#[tokio::test]
async fn second_crash_within_cooldown_is_fatal() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;
    let mut events = session.subscribe_events();
    let mut status_rx = session.subscribe_status();

    let first = session
        .evaluate("crash", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate first crash");
    timeout(WAIT, first.wait_terminal()).await.expect("terminal");
    wait_for_event(&mut events, |event| matches!(event, SessionEvent::LoginDone)).await;

    // Well inside the cooldown window.
    let second = session
        .evaluate("crash", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate second crash");
    let status = timeout(WAIT, second.wait_terminal())
        .await
        .expect("terminal");
    assert_eq!(status, ExpressionStatus::Error);

    timeout(WAIT, async {
        while *status_rx.borrow_and_update() != SessionStatus::Failed {
            status_rx.changed().await.expect("status channel");
        }
    })
    .await
    .expect("session never reached Failed");

    // No third respawn: the session refuses further work.
    let err = session
        .evaluate("0+1", FinishingBehavior::DoNotDelete)
        .await
        .err()
        .expect("evaluate must fail");
    assert_matches!(err, EngineError::SessionFailed);
}
