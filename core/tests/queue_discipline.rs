#![cfg(unix)]
#![expect(clippy::expect_used)]

mod common;

use std::time::Duration;

use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use abacus_protocol::SessionStatus;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

use crate::common::FAKE_BACKEND;
use crate::common::WAIT;
use crate::common::result_texts;
use crate::common::start_session;
use crate::common::wait_for_question;

#[tokio::test]
async fn results_arrive_in_submission_order() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    // Back-to-back, without waiting in between.
    let e1 = session
        .evaluate("0+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 0+1");
    let e2 = session
        .evaluate("1+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 1+1");
    let e3 = session
        .evaluate("1+2", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 1+2");

    for expr in [&e1, &e2, &e3] {
        let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
        assert_eq!(status, ExpressionStatus::Done);
    }
    assert_eq!(result_texts(&e1), vec!["1"]);
    assert_eq!(result_texts(&e2), vec!["2"]);
    assert_eq!(result_texts(&e3), vec!["3"]);

    let mut status_rx = session.subscribe_status();
    timeout(WAIT, async {
        while *status_rx.borrow_and_update() != SessionStatus::Done {
            status_rx.changed().await.expect("status channel");
        }
    })
    .await
    .expect("session did not go idle");
}

#[tokio::test]
async fn embedded_comment_does_not_alter_parse_boundaries() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;
    let expr = session
        .evaluate("2+2 #comment", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["4"]);
}

#[tokio::test]
async fn backend_error_is_reported_and_queue_continues() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    let bad = session
        .evaluate("1/0", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 1/0");
    let status = timeout(WAIT, bad.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Error);
    let message = bad.error_message().expect("error message");
    assert!(message.contains("bad expression"), "got: {message}");
    assert!(bad.results().is_empty());

    // The queue keeps running after a per-expression error.
    let good = session
        .evaluate("2+3", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 2+3");
    let status = timeout(WAIT, good.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&good), vec!["5"]);
}

#[tokio::test]
async fn continuation_question_resumes_with_added_information() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    let expr = session
        .evaluate("ask", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate ask");

    let question = wait_for_question(&expr).await;
    assert_eq!(question, "factor?");
    assert_eq!(expr.status(), ExpressionStatus::Computing);

    session.add_information("21").await.expect("add information");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["42"]);
}

#[tokio::test]
async fn internal_expressions_serialize_like_user_commands() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    let user1 = session
        .evaluate("1+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");
    let internal = session
        .evaluate_internal("2+2", FinishingBehavior::DeleteOnFinish)
        .await
        .expect("evaluate internal");
    let user2 = session
        .evaluate("3+3", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");

    for expr in [&user1, &internal, &user2] {
        let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
        assert_eq!(status, ExpressionStatus::Done);
    }
    assert_eq!(result_texts(&user1), vec!["2"]);
    assert_eq!(result_texts(&internal), vec!["4"]);
    assert_eq!(result_texts(&user2), vec!["6"]);

    assert!(internal.is_internal());
    assert!(!user1.is_internal());
}

#[tokio::test]
async fn variable_refresh_runs_through_the_queue() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    session.refresh_variables().await.expect("refresh variables");
    let model = session.variable_model();
    assert_eq!(
        model.get("a").and_then(|var| var.value),
        Some("1".to_string())
    );
    assert_eq!(
        model.get("b").and_then(|var| var.value),
        Some("2".to_string())
    );

    // The internal listing command observed ordinary queue discipline.
    let expr = session
        .evaluate("4+4", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate after refresh");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["8"]);
}

#[tokio::test]
async fn empty_command_never_reaches_the_process() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    let empty = session
        .evaluate("   ", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate blank");
    // Completes synchronously, zero results.
    assert_eq!(empty.status(), ExpressionStatus::Done);
    assert!(empty.results().is_empty());

    // The prompt matcher is still in sync with the process.
    let expr = session
        .evaluate("5+5", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate 5+5");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["10"]);
}

#[tokio::test]
async fn login_is_idempotent_on_a_connected_session() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    session.login().await.expect("second login");
    session.login().await.expect("third login");

    let expr = session
        .evaluate("1+2", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["3"]);
}

#[tokio::test]
async fn interrupting_a_queued_expression_leaves_the_head_alone() {
    let (_dir, session) = start_session(FAKE_BACKEND).await;

    let head = session
        .evaluate("slow", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate slow");
    let queued = session
        .evaluate("0+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate queued");

    session.interrupt_expression(&queued).await;
    assert_eq!(queued.status(), ExpressionStatus::Interrupted);

    // The in-flight head still completes normally.
    let status = timeout(WAIT, head.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&head), vec!["done"]);
}

#[tokio::test]
async fn prompt_marker_split_across_chunks_still_matches() {
    // The prompt arrives in two writes with a pause in between; only the
    // cumulative buffer ever contains the full marker.
    let script = r#"#!/bin/sh
printf 'ABACUS:'
sleep 0.2
printf '0> \n'
n=1
while IFS= read -r line; do
  cmd=${line%;}
  printf '%s\n' "$(( $cmd ))"
  printf 'ABACUS:'
  sleep 0.2
  printf '%s> \n' "$n"
  n=$((n+1))
done
"#;
    let (_dir, session) = start_session(script).await;
    let expr = session
        .evaluate("0+1", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");
    let status = timeout(Duration::from_secs(15), expr.wait_terminal())
        .await
        .expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["1"]);
}
