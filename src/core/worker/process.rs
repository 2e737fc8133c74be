//! Worker units backed by child processes.
//!
//! The coordinator writes [`WorkerRequest`] lines to the child's stdin and
//! reads [`WorkerMessage`] lines from its stdout. The child announces itself
//! with a `ready` line before accepting work; [`serve_stdio`] implements the
//! child side. A supervisor task per child owns the process handle and turns
//! its exit status into a [`WorkerEvent::Exited`]. A line that does not
//! decode is reported as [`WorkerEvent::Faulted`] and the child is killed.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{EventSender, WorkerFactory, WorkerUnit};
use crate::config::DispatcherConfig;
use crate::core::error::DispatchError;
use crate::core::executor::WorkerExecutor;
use crate::core::protocol::{decode_line, encode_line, WorkerEvent, WorkerMessage, WorkerRequest};
use crate::core::task::{Task, TaskMeta, WorkerId};

/// How long to keep reading buffered replies after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra time `stop` waits for the supervisor beyond the grace period.
const SUPERVISOR_SLACK: Duration = Duration::from_millis(500);

/// Spawns [`ProcessWorker`]s from a worker program.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    spawn_timeout: Duration,
}

impl ProcessWorkerFactory {
    /// Factory for `program` with the default spawn timeout.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::from_config(program, &DispatcherConfig::default())
    }

    /// Factory for `program` using the spawn timeout from `config`.
    pub fn from_config(program: impl Into<PathBuf>, config: &DispatcherConfig) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            spawn_timeout: config.worker_spawn_timeout(),
        }
    }

    /// Append a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set how long to wait for the ready handshake.
    #[must_use]
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }
}

enum Control {
    Task(String),
    Stop(Duration),
    Kill,
}

/// A worker unit running as a child process.
pub struct ProcessWorker<P> {
    id: WorkerId,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
    supervisor: Option<JoinHandle<()>>,
    _payload: PhantomData<fn(P)>,
}

impl<P> ProcessWorker<P> {
    /// OS process id of the child, if it was still running when spawned.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl<P, R> WorkerFactory<P, R> for ProcessWorkerFactory
where
    P: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    type Unit = ProcessWorker<P>;

    async fn spawn(&self, id: WorkerId, events: EventSender<R>) -> Result<ProcessWorker<P>, DispatchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::Spawn(format!("{}: {e}", self.program.display())))?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DispatchError::Spawn(format!("{id}: stdio pipes unavailable")));
        };

        // Returning early drops `child`, which kills it.
        let mut lines = BufReader::new(stdout).lines();
        match tokio::time::timeout(self.spawn_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => match decode_line::<WorkerMessage<R>>(&line) {
                Ok(WorkerMessage::Ready) => {}
                Ok(_) => {
                    return Err(DispatchError::Spawn(format!("{id}: expected ready handshake")));
                }
                Err(e) => return Err(DispatchError::Spawn(format!("{id}: bad handshake: {e}"))),
            },
            Ok(Ok(None)) => {
                return Err(DispatchError::Spawn(format!("{id} exited before becoming ready")));
            }
            Ok(Err(e)) => return Err(DispatchError::Spawn(format!("{id}: {e}"))),
            Err(_) => {
                return Err(DispatchError::Spawn(format!("{id} did not become ready in time")));
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(id, child, stdin, lines, control_rx, events));
        debug!(worker_id = %id, pid = ?pid, "process worker ready");

        Ok(ProcessWorker {
            id,
            pid,
            control: control_tx,
            supervisor: Some(supervisor),
            _payload: PhantomData,
        })
    }
}

#[async_trait]
impl<P: Serialize + Send + 'static> WorkerUnit<P> for ProcessWorker<P> {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, task: Task<P>) -> Result<(), DispatchError> {
        let line = encode_line(&WorkerRequest::from(task))?;
        self.control
            .send(Control::Task(line))
            .map_err(|_| DispatchError::WorkerUnavailable(self.id))
    }

    fn kill(&mut self) {
        let _ = self.control.send(Control::Kill);
    }

    async fn stop(mut self, grace: Duration) {
        let _ = self.control.send(Control::Stop(grace));
        if let Some(supervisor) = self.supervisor.take() {
            if tokio::time::timeout(grace + SUPERVISOR_SLACK, supervisor).await.is_err() {
                warn!(worker_id = %self.id, "process supervisor did not finish after stop");
            }
        }
    }
}

async fn supervise<R>(
    id: WorkerId,
    mut child: Child,
    stdin: ChildStdin,
    mut lines: Lines<BufReader<ChildStdout>>,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: EventSender<R>,
) where
    R: DeserializeOwned + Send + 'static,
{
    let mut stdin = Some(stdin);
    let mut stdout_open = true;
    let mut control_open = true;
    let mut kill_at: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            biased;
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => {
                    if let Err(reason) = forward(id, &line, &events) {
                        warn!(worker_id = %id, reason = %reason, "malformed worker line; killing worker");
                        let _ = events.send((id, WorkerEvent::Faulted { reason }));
                        stdout_open = false;
                        start_kill(id, &mut child);
                    }
                }
                Ok(None) => stdout_open = false,
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "worker stdout read failed");
                    stdout_open = false;
                }
            },
            ctl = control.recv(), if control_open => match ctl {
                Some(Control::Task(line)) => {
                    if let Some(pipe) = stdin.as_mut() {
                        if let Err(e) = write_line(pipe, &line).await {
                            warn!(worker_id = %id, error = %e, "failed to write task to worker");
                        }
                    }
                }
                Some(Control::Stop(grace)) => {
                    // EOF on stdin asks the child to finish and exit.
                    stdin = None;
                    kill_at = Some(Instant::now() + grace);
                }
                Some(Control::Kill) => start_kill(id, &mut child),
                None => {
                    control_open = false;
                    start_kill(id, &mut child);
                }
            },
            () = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                warn!(worker_id = %id, "worker did not exit within grace period - killing");
                kill_at = None;
                start_kill(id, &mut child);
            }
            status = child.wait() => break status,
        }
    };

    if stdout_open {
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(reason) = forward(id, &line, &events) {
                    warn!(worker_id = %id, reason = %reason, "dropping malformed line from exited worker");
                }
            }
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }

    let (code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(e) => {
            warn!(worker_id = %id, error = %e, "failed to read worker exit status");
            (None, None)
        }
    };
    debug!(worker_id = %id, exit_code = ?code, signal = ?signal, "process worker exited");
    let _ = events.send((id, WorkerEvent::Exited { code }));
}

fn start_kill(id: WorkerId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(worker_id = %id, error = %e, "kill failed; worker already gone");
    }
}

/// Exit code is `None` for a signalled child; the signal number is only
/// available on Unix.
#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Pass one stdout line on as an event. Returns the decode error for lines
/// that are not valid messages.
fn forward<R: DeserializeOwned>(id: WorkerId, line: &str, events: &EventSender<R>) -> Result<(), String> {
    if line.trim().is_empty() {
        return Ok(());
    }
    let message = decode_line::<WorkerMessage<R>>(line).map_err(|e| match e {
        DispatchError::Protocol(reason) => reason,
        other => other.to_string(),
    })?;
    if matches!(message, WorkerMessage::Ready) {
        debug!(worker_id = %id, "ignoring repeated ready handshake");
    } else {
        let _ = events.send((id, WorkerEvent::Message(message)));
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

/// Child-side loop for a process worker.
///
/// Announces readiness on stdout, then answers each task line from stdin
/// with one result or failure line until stdin closes. Logging must go to
/// stderr; stdout carries only protocol lines.
///
/// # Errors
///
/// Returns `DispatchError::Protocol` on stdio failure or an unparsable
/// request. The process should then exit non-zero so the coordinator
/// replaces it.
pub async fn serve_stdio<P, R, E>(executor: E) -> Result<(), DispatchError>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let stdio_err = |e: std::io::Error| DispatchError::Protocol(format!("stdio: {e}"));

    let mut stdout = tokio::io::stdout();
    write_line(&mut stdout, &encode_line(&WorkerMessage::<R>::Ready)?)
        .await
        .map_err(stdio_err)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(stdio_err)? {
        if line.trim().is_empty() {
            continue;
        }
        let WorkerRequest::Task {
            id,
            created_at_ms,
            payload,
        } = decode_line::<WorkerRequest<P>>(&line)?;
        let meta = TaskMeta { id, created_at_ms };

        let message = match executor.execute(payload, meta).await {
            Ok(value) => WorkerMessage::Result { id, value },
            Err(error) => WorkerMessage::Failure { id, error },
        };
        write_line(&mut stdout, &encode_line(&message)?)
            .await
            .map_err(stdio_err)?;
    }
    Ok(())
}
