//! `abacus` — a line-oriented REPL driving a CAS backend through the
//! execution engine. Stands in for a full notebook frontend.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use abacus_core::BackendConfig;
use abacus_core::BackendStrategy;
use abacus_core::Session;
use abacus_core::backends::MaximaStrategy;
use abacus_core::expression::Expression;
use abacus_protocol::ExpressionResult;
use abacus_protocol::ExpressionStatus;
use abacus_protocol::FinishingBehavior;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::io::Stdin;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "abacus",
    about = "Evaluate commands against a computer-algebra backend.",
    disable_help_subcommand = true
)]
struct Cli {
    /// Backend to drive.
    #[arg(long, default_value = "maxima")]
    backend: String,

    /// TOML file with the backend configuration.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Evaluate a single command and exit instead of starting the REPL.
    #[arg(short = 'c', long = "command", value_name = "TEXT")]
    command: Option<String>,

    /// Request LaTeX-typeset results where the backend supports it.
    #[arg(long)]
    typesetting: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BackendConfig::load(path)?,
        None => BackendConfig::default(),
    };
    if cli.typesetting {
        config.typesetting = true;
    }

    let strategy: Arc<dyn BackendStrategy> = match cli.backend.as_str() {
        "maxima" => Arc::new(MaximaStrategy::new()?),
        other => bail!("unsupported backend `{other}`"),
    };

    let session = Session::new(strategy, config);
    session.login().await?;
    debug!(backend = session.backend_name(), "session ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let exit_code = match cli.command {
        Some(command) => run_expression(&session, &command, &mut lines).await?,
        None => {
            repl(&session, &mut lines).await?;
            0
        }
    };
    session.logout().await?;
    std::process::exit(exit_code);
}

async fn repl(session: &Arc<Session>, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    loop {
        print!("{}> ", session.backend_name());
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            ":quit" | ":q" => break,
            ":vars" => {
                session.refresh_variables().await?;
                for variable in session.variable_model().snapshot() {
                    match variable.value {
                        Some(value) => println!("{} = {}", variable.name, value),
                        None => println!("{}", variable.name),
                    }
                }
            }
            command => match run_expression(session, command, lines).await {
                Ok(_) => {}
                Err(err) => {
                    eprintln!("error: {err}");
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Evaluate one command, answering continuation questions from stdin and
/// mapping Ctrl-C to a session interrupt. Returns a process exit code.
async fn run_expression(
    session: &Arc<Session>,
    command: &str,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<i32> {
    let expr = session
        .evaluate(command, FinishingBehavior::DoNotDelete)
        .await?;
    let mut status_rx = expr.subscribe_status();
    let mut events = expr.subscribe_events();

    loop {
        if status_rx.borrow_and_update().is_terminal() {
            break;
        }
        if let Some(question) = expr.pending_question() {
            print!("{question} ");
            std::io::stdout().flush()?;
            let Some(answer) = lines.next_line().await? else {
                session.interrupt().await;
                break;
            };
            session.add_information(answer.trim()).await?;
            continue;
        }
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            // Wakes the loop when a continuation question arrives.
            _ = events.recv() => {}
            _ = tokio::signal::ctrl_c() => {
                session.interrupt().await;
            }
        }
    }

    Ok(print_outcome(&expr))
}

fn print_outcome(expr: &Expression) -> i32 {
    match expr.status() {
        ExpressionStatus::Done => {
            for result in expr.results() {
                match &result {
                    ExpressionResult::Image { path } | ExpressionResult::Eps { path } => {
                        println!("[{}]", path.display());
                    }
                    other => {
                        if let Some(text) = other.as_text() {
                            println!("{text}");
                        }
                    }
                }
            }
            0
        }
        ExpressionStatus::Error => {
            if let Some(message) = expr.error_message() {
                eprintln!("error: {message}");
            }
            1
        }
        ExpressionStatus::Interrupted => {
            eprintln!("interrupted");
            130
        }
        ExpressionStatus::Queued | ExpressionStatus::Computing => 1,
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
