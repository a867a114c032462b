#![cfg(unix)]
#![expect(clippy::expect_used)]

mod common;

use std::sync::Arc;

use abacus_core::Session;
use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use abacus_core::process::ChannelMode;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

use crate::common::WAIT;
use crate::common::config_for;
use crate::common::fake_strategy;
use crate::common::result_texts;
use crate::common::write_script;

/// Same protocol as the pipe-mode fake, but run on a pseudo-terminal, the
/// way backends that only prompt on an interactive tty are driven. Echo is
/// turned off so the commands we write do not come back as output.
const PTY_BACKEND: &str = r#"#!/bin/sh
stty -echo 2>/dev/null
printf 'ABACUS:0> \n'
n=1
while IFS= read -r line; do
  cmd=${line%;}
  printf '%s\n' "$(( $cmd ))"
  printf 'ABACUS:%s> \n' "$n"
  n=$((n+1))
done
"#;

#[tokio::test]
async fn pty_mode_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, PTY_BACKEND);
    let mut config = config_for(&script);
    config.channel = ChannelMode::Pty;

    let session = Session::new(Arc::new(fake_strategy()), config);
    timeout(WAIT, session.login())
        .await
        .expect("login timed out")
        .expect("login failed");

    let expr = session
        .evaluate("3+4", FinishingBehavior::DoNotDelete)
        .await
        .expect("evaluate");
    let status = timeout(WAIT, expr.wait_terminal()).await.expect("terminal");
    assert_eq!(status, ExpressionStatus::Done);
    assert_eq!(result_texts(&expr), vec!["7"]);

    session.logout().await.expect("logout");
}
