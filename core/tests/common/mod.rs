#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use abacus_core::BackendConfig;
use abacus_core::Session;
use abacus_core::backends::GenericStrategy;
use abacus_core::expression::Expression;
use abacus_core::variables::Variable;
use abacus_core::variables::VariableProtocol;
use abacus_protocol::SessionEvent;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(10);

/// Scripted stand-in for a CAS: evaluates shell arithmetic, knows a handful
/// of trigger commands and speaks the `ABACUS:<n>> ` prompt protocol.
pub const FAKE_BACKEND: &str = r#"#!/bin/sh
printf 'ABACUS:0> \n'
n=1
while IFS= read -r line; do
  cmd=${line%;}
  cmd=${cmd%%#*}
  case "$cmd" in
    crash*)
      exit 3
      ;;
    ask*)
      printf 'factor? INPUT? \n'
      IFS= read -r ans
      ans=${ans%;}
      printf '%s\n' "$(( $ans * 2 ))"
      ;;
    slow*)
      sleep 1
      printf 'done\n'
      ;;
    vars*)
      printf 'a=1 b=2\n'
      ;;
    *)
      if out=$( ( printf '%s\n' "$(( $cmd ))" ) 2>/dev/null ); then
        printf '%s\n' "$out"
      else
        printf 'ERR: bad expression\n'
      fi
      ;;
  esac
  printf 'ABACUS:%s> \n' "$n"
  n=$((n+1))
done
"#;

pub fn write_script(dir: &TempDir, contents: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-backend.sh");
    std::fs::write(&path, contents).expect("write fake backend script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Listing protocol matching the fake backend's `vars` command, which
/// prints `name=value` pairs on one line.
pub struct FakeVariables;

impl VariableProtocol for FakeVariables {
    fn refresh_command(&self) -> String {
        "vars".to_string()
    }

    fn parse_listing(&self, text: &str) -> Vec<Variable> {
        text.split_whitespace()
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some(Variable {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                })
            })
            .collect()
    }
}

pub fn fake_strategy() -> GenericStrategy {
    GenericStrategy::new("fake", "fake-backend.sh", Vec::new(), r"ABACUS:\d+> ")
        .expect("completion pattern")
        .with_continuation(r"INPUT\? ")
        .expect("continuation pattern")
        .with_error_marker(r"(?m)^ERR: ")
        .expect("error pattern")
        .with_terminator(';')
        .with_variables(Arc::new(FakeVariables))
}

pub fn config_for(script: &Path) -> BackendConfig {
    BackendConfig {
        path: Some(script.to_path_buf()),
        ..BackendConfig::default()
    }
}

/// Write `script`, spawn it behind a fresh session and complete the login
/// handshake. The TempDir must stay alive for the session's lifetime.
pub async fn start_session(script: &str) -> (TempDir, Arc<Session>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_script(&dir, script);
    let session = Session::new(Arc::new(fake_strategy()), config_for(&path));
    timeout(WAIT, session.login())
        .await
        .expect("login timed out")
        .expect("login failed");
    (dir, session)
}

pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F)
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event");
}

pub async fn wait_for_question(expr: &Arc<Expression>) -> String {
    timeout(WAIT, async {
        loop {
            if let Some(question) = expr.pending_question() {
                return question;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for continuation question")
}

pub fn result_texts(expr: &Expression) -> Vec<String> {
    expr.results()
        .iter()
        .filter_map(|result| result.as_text().map(String::from))
        .collect()
}
