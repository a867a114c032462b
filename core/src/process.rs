use std::fmt;
use std::io::ErrorKind;
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::EngineError;
use crate::error::Result;

const READ_CHUNK_SIZE: usize = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const WRITER_CHANNEL_CAPACITY: usize = 128;
#[cfg(unix)]
const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal

/// How the child's standard streams are wired up.
///
/// `Pipe` keeps stdout and stderr separate, which the engine needs for
/// backends that report diagnostics on stderr. `Pty` merges everything into
/// one stream and is for backends whose CLIs only print prompts when they
/// believe they are talking to an interactive terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Pipe,
    Pty,
}

/// What to spawn. Built by a backend strategy from its `BackendConfig`.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub mode: ChannelMode,
}

/// Byte-level events delivered by the channel. Chunks arrive in arbitrary
/// sizes, never aligned to lines or protocol markers; consumers must
/// accumulate across events. `Exited` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    /// Only emitted in `Pipe` mode; a pty merges stderr into stdout.
    Stderr(Vec<u8>),
    Exited(i32),
}

/// Owns exactly one child process: asynchronous byte delivery through an
/// event receiver, synchronous-looking writes through an internal writer
/// task, and signal-based interruption. All spawned tasks are torn down on
/// drop, and the child is killed if it is still alive, so no handles leak
/// on any exit path.
pub struct ProcessChannel {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
    pty_killer: Option<StdMutex<Box<dyn ChildKiller + Send + Sync>>>,
    exited: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    // Dropping the master closes the pty; keep it alive with the channel.
    // Behind a mutex because MasterPty is not Sync and the channel is
    // shared across tasks.
    _pty_master: Option<StdMutex<Box<dyn MasterPty + Send>>>,
}

impl fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessChannel")
            .field("pid", &self.pid)
            .field("exited", &self.exited.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProcessChannel {
    pub async fn spawn(spec: SpawnSpec) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        match spec.mode {
            ChannelMode::Pipe => Self::spawn_pipe(spec).await,
            ChannelMode::Pty => Self::spawn_pty(spec),
        }
    }

    async fn spawn_pipe(spec: SpawnSpec) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        let backend = spec.program.display().to_string();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|err| EngineError::spawn(&backend, err.into()))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::spawn(&backend, anyhow::anyhow!("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::spawn(&backend, anyhow::anyhow!("stderr not piped")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::spawn(&backend, anyhow::anyhow!("stdin not piped")))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(4);

        tasks.push(spawn_pipe_reader(stdout, event_tx.clone(), ProcessEvent::Stdout));
        tasks.push(spawn_pipe_reader(stderr, event_tx.clone(), ProcessEvent::Stderr));

        let mut stdin = stdin;
        tasks.push(tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        }));

        let wait_exited = Arc::clone(&exited);
        tasks.push(tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(_) => -1,
            };
            wait_exited.store(true, Ordering::SeqCst);
            let _ = event_tx.send(ProcessEvent::Exited(code)).await;
        }));

        Ok((
            Self {
                writer_tx,
                pid,
                pty_killer: None,
                exited,
                tasks,
                _pty_master: None,
            },
            event_rx,
        ))
    }

    fn spawn_pty(spec: SpawnSpec) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        let backend = spec.program.display().to_string();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| EngineError::spawn(&backend, err))?;

        let mut command_builder = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            command_builder.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            command_builder.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(command_builder)
            .map_err(|err| EngineError::spawn(&backend, err))?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(3);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| EngineError::spawn(&backend, err))?;
        let reader_tx = event_tx.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_tx
                            .blocking_send(ProcessEvent::Stdout(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
        }));

        let writer = pair
            .master
            .take_writer()
            .map_err(|err| EngineError::spawn(&backend, err))?;
        let writer = Arc::new(StdMutex::new(writer));
        tasks.push(tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let result = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        use std::io::Write;
                        guard.write_all(&bytes)?;
                        guard.flush()?;
                    }
                    std::io::Result::Ok(())
                })
                .await;
                if !matches!(result, Ok(Ok(()))) {
                    break;
                }
            }
        }));

        let wait_exited = Arc::clone(&exited);
        tasks.push(tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            wait_exited.store(true, Ordering::SeqCst);
            let _ = event_tx.blocking_send(ProcessEvent::Exited(code));
        }));

        Ok((
            Self {
                writer_tx,
                pid,
                pty_killer: Some(StdMutex::new(killer)),
                exited,
                tasks,
                _pty_master: Some(StdMutex::new(pair.master)),
            },
            event_rx,
        ))
    }

    /// Send raw bytes to the child's input stream. The caller is responsible
    /// for the one-command-in-flight discipline; the channel itself does no
    /// queuing beyond the writer task's mailbox.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        self.writer_tx
            .send(bytes)
            .await
            .map_err(|_| EngineError::WriteToStdin)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Interrupt the current computation (SIGINT). Falls back to writing
    /// Ctrl-C into a pty when the pid is unknown.
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_signal(pid, libc::SIGINT);
            return;
        }
        if self.pty_killer.is_some() {
            let _ = self.writer_tx.try_send(vec![0x03]);
        } else {
            warn!("no way to interrupt backend process");
        }
    }

    /// Ask the child to exit gracefully (SIGTERM).
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_signal(pid, libc::SIGTERM);
            return;
        }
        self.kill();
    }

    /// Kill the child immediately.
    pub fn kill(&self) {
        if let Some(killer) = &self.pty_killer {
            if let Ok(mut killer) = killer.lock() {
                let _ = killer.kill();
            }
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_signal(pid, libc::SIGKILL);
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if !self.has_exited() {
            debug!(pid = ?self.pid, "killing backend process on channel drop");
            self.kill();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_pipe_reader<R>(
    mut stream: R,
    tx: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_CODE_SIGNAL_BASE + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
