//! Raw child-process channel: spawn, pipe stdio, forward stdout bytes
//! verbatim, and shut down with a graceful-then-forceful escalation.

use crate::core::config::data::ProcessConfig;
use crate::mcp::error::TransportError;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// How long a child gets to exit after the graceful signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
pub enum ProcessEvent {
    /// Bytes exactly as the child wrote them; no framing applied.
    Stdout(Vec<u8>),
    Error(TransportError),
    Exited(Option<i32>),
}

pub struct ChildProcess {
    label: String,
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    shutdown_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exited: Arc<AtomicBool>,
}

impl ChildProcess {
    /// Spawns the process and attaches its pipes. Resolves as soon as the OS
    /// has created it; readiness of the program itself is not awaited.
    pub fn spawn(
        config: &ProcessConfig,
        label: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), TransportError> {
        debug!(
            server_id = %label,
            command = %config.command,
            args = ?config.args,
            "Spawning tool provider process"
        );
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|err| TransportError::Spawn {
            command: config.command.clone(),
            reason: err.to_string(),
        })?;
        let missing = |stream: &str| {
            TransportError::Channel(format!("{label}: {stream} was not captured"))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let process = Self {
            label: label.to_string(),
            pid: child.id(),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            shutdown_tx: std::sync::Mutex::new(Some(shutdown_tx)),
            exited: Arc::new(AtomicBool::new(false)),
        };

        let stdout_done = spawn_stdout_reader(stdout, events_tx.clone());
        spawn_stderr_drain(stderr, label.to_string());
        spawn_waiter(
            child,
            label.to_string(),
            shutdown_rx,
            process.stdin.clone(),
            process.exited.clone(),
            stdout_done,
            events_tx,
        );

        Ok((process, events_rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Writes raw bytes to the child's stdin. Fails with
    /// [`TransportError::ProcessUnavailable`] once the child has exited or
    /// its stdin is gone; the caller decides where to report it.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.has_exited() {
            return Err(self.unavailable("process has exited"));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.unavailable("stdin is closed"))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|err| self.unavailable(&err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| self.unavailable(&err.to_string()))
    }

    fn unavailable(&self, reason: &str) -> TransportError {
        TransportError::ProcessUnavailable(format!("{}: {reason}", self.label))
    }

    /// Closes stdin, signals the child to terminate, and kills it if it is
    /// still running after [`SHUTDOWN_GRACE`]. Calling this again is a no-op.
    /// A write blocked on a full pipe does not hold this up: stdin is then
    /// left to close when the child dies.
    pub async fn close(&self) {
        let shutdown = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(shutdown) = shutdown else {
            return;
        };
        if let Ok(mut guard) = self.stdin.try_lock() {
            if let Some(mut stdin) = guard.take() {
                let _ = stdin.shutdown().await;
            }
        }
        let _ = shutdown.send(());
    }
}

fn spawn_stdout_reader(
    mut stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if events.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = events.send(ProcessEvent::Error(TransportError::Channel(format!(
                        "stdout read failed: {err}"
                    ))));
                    break;
                }
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, label: String) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if !line.trim().is_empty() {
                warn!(server_id = %label, "{line}");
            }
        }
    });
}

fn spawn_waiter(
    mut child: Child,
    label: String,
    shutdown_rx: oneshot::Receiver<()>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exited: Arc<AtomicBool>,
    stdout_done: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    tokio::spawn(async move {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = shutdown_rx => None,
        };
        let (status, requested) = match waited {
            Some(status) => (status, false),
            None => (terminate(&mut child, &label).await, true),
        };
        exited.store(true, Ordering::SeqCst);
        stdin.lock().await.take();
        // Let buffered output reach the consumer before the exit event.
        let _ = tokio::time::timeout(Duration::from_millis(250), stdout_done).await;

        match status {
            Ok(status) => {
                debug!(server_id = %label, %status, "Tool provider exited");
                if let Some(err) = exit_error(&label, status, requested) {
                    let _ = events.send(ProcessEvent::Error(err));
                }
                let _ = events.send(ProcessEvent::Exited(status.code()));
            }
            Err(err) => {
                let _ = events.send(ProcessEvent::Error(TransportError::Channel(format!(
                    "{label}: wait failed: {err}"
                ))));
                let _ = events.send(ProcessEvent::Exited(None));
            }
        }
    });
}

fn exit_error(label: &str, status: ExitStatus, requested: bool) -> Option<TransportError> {
    match status.code() {
        Some(code) if code != 0 && !requested => Some(TransportError::ProcessUnavailable(
            format!("{label} exited with code {code}"),
        )),
        _ => None,
    }
}

async fn terminate(child: &mut Child, label: &str) -> std::io::Result<ExitStatus> {
    send_graceful_signal(child, label);
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                server_id = %label,
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Tool provider ignored termination; killing"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_graceful_signal(child: &Child, label: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(server_id = %label, error = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_child: &Child, label: &str) {
    // Closed stdin is the only graceful request available here.
    debug!(server_id = %label, "Waiting for tool provider to exit after stdin close");
}
