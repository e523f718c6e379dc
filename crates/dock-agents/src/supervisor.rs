use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dock_types::{AgentKind, StreamKind};

use crate::plan_extract::plan_block_complete;
use crate::{extract_plan, AgentCatalog, AgentError, OutputRing, PlanExtract};

pub const CANCEL_GRACE: Duration = Duration::from_secs(5);
const STREAM_CLOSE_WAIT: Duration = Duration::from_secs(10);

/// One framed chunk of child output. Streams are per-stream FIFO and never
/// merged; interleaving clients use the stream tag and `ts`.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub execution_id: String,
    pub stream: StreamKind,
    pub data: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AgentFrame {
    Output(OutputFrame),
    /// Emitted exactly once per ring-buffer overflow burst.
    Truncated {
        execution_id: String,
        stream: StreamKind,
    },
}

/// Live (or exited) agent subprocess. The waiter task owns the `Child`; this
/// handle signals it and watches the exit code.
#[derive(Debug)]
pub struct AgentHandle {
    pub pid: u32,
    pub execution_id: String,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    hard_kill: CancellationToken,
    lines_rx: Option<mpsc::UnboundedReceiver<String>>,
    ring: Arc<Mutex<OutputRing>>,
}

impl AgentHandle {
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub async fn transcript(&self) -> String {
        self.ring.lock().await.snapshot_lossy()
    }

    pub async fn write_stdin_line(&self, line: &str) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            AgentError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Cloneable writer for interactive input. Writes are serialised on one
    /// handle; concurrent callers queue on the lock.
    pub fn stdin_writer(&self) -> AgentStdin {
        AgentStdin {
            inner: self.stdin.clone(),
        }
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    pub async fn wait_exit(&mut self, timeout: Duration) -> Result<i32, AgentError> {
        let mut rx = self.exit_rx.clone();
        wait_exit_rx(&mut rx, timeout).await
    }

    /// Polite terminate, 5 s grace, then hard kill. Returns the exit code.
    pub async fn cancel(&mut self) -> i32 {
        if let Some(code) = self.exit_code() {
            return code;
        }
        self.terminate_politely();
        match self.wait_exit(CANCEL_GRACE).await {
            Ok(code) => code,
            Err(_) => {
                warn!(pid = self.pid, "agent ignored terminate; killing");
                self.hard_kill.cancel();
                self.wait_exit(CANCEL_GRACE).await.unwrap_or(-9)
            }
        }
    }

    #[cfg(unix)]
    fn terminate_politely(&self) {
        // SAFETY: plain kill(2) on a pid we spawned; failure is harmless.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn terminate_politely(&self) {
        self.hard_kill.cancel();
    }

    fn take_lines(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines_rx.take()
    }

    fn restore_lines(&mut self, rx: mpsc::UnboundedReceiver<String>) {
        self.lines_rx = Some(rx);
    }
}

#[derive(Clone)]
pub struct AgentStdin {
    inner: Arc<Mutex<Option<ChildStdin>>>,
}

impl AgentStdin {
    pub async fn write_line(&self, line: &str) -> Result<(), AgentError> {
        let mut guard = self.inner.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            AgentError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// A plan-mode agent run: the extracted plan plus the child handle, which may
/// still be alive awaiting an interactive approval on stdin.
#[derive(Debug)]
pub struct PlanSession {
    pub execution_id: String,
    pub kind: AgentKind,
    pub extract: PlanExtract,
    pub transcript: String,
    pub awaits_interactive_approval: bool,
    pub handle: AgentHandle,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub transcript: String,
}

/// Orchestrates one external subprocess per execution, hiding per-agent CLI
/// variants behind the mode tables at the bottom of this file.
#[derive(Clone)]
pub struct AgentSupervisor {
    catalog: AgentCatalog,
    max_buffer_bytes: usize,
    exec_timeout: Duration,
}

impl AgentSupervisor {
    pub fn new(catalog: AgentCatalog, max_buffer_bytes: usize, exec_timeout_ms: u64) -> Self {
        Self {
            catalog,
            max_buffer_bytes,
            exec_timeout: Duration::from_millis(exec_timeout_ms),
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    /// Spawns the agent in plan mode and reads its transcript until the plan
    /// block is explicitly complete (end marker) or the child exits cleanly.
    pub async fn start_plan(
        &self,
        kind: AgentKind,
        prompt: &str,
        workdir: &Path,
        execution_id: &str,
        frames_tx: mpsc::Sender<AgentFrame>,
    ) -> Result<PlanSession, AgentError> {
        let binary = self.catalog.locate(kind).await?;
        let mut handle = self
            .spawn(
                &binary.path,
                plan_mode_args(kind),
                Some(prompt),
                workdir,
                execution_id,
                frames_tx,
                true,
            )
            .await?;
        info!(agent = kind.as_str(), pid = handle.pid, "plan-mode agent started");

        let mut lines_rx = match handle.take_lines() {
            Some(rx) => rx,
            None => {
                return Err(AgentError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "stdout reader missing",
                )))
            }
        };
        let transcript = self
            .collect_plan_block(&mut handle, &mut lines_rx)
            .await
            .map_err(|error| {
                debug!(pid = handle.pid, "plan collection failed: {error}");
                error
            })?;
        handle.restore_lines(lines_rx);

        let extract = extract_plan(&transcript);
        let awaits_interactive_approval = handle.is_running();
        Ok(PlanSession {
            execution_id: execution_id.to_string(),
            kind,
            extract,
            transcript,
            awaits_interactive_approval,
            handle,
        })
    }

    /// Writes the approval record to the planning child's stdin, then waits
    /// for it to apply the plan and exit. Nonzero exits are reported in the
    /// outcome, not as errors; the caller decides what a failure means.
    pub async fn approve_interactively(
        &self,
        session: &mut PlanSession,
        directive: Option<&str>,
        abort: CancellationToken,
    ) -> Result<ExecOutcome, AgentError> {
        session
            .handle
            .write_stdin_line(&approval_record(true, directive))
            .await?;
        let mut exit_rx = session.handle.exit_receiver();
        let waited = tokio::select! {
            waited = wait_exit_rx(&mut exit_rx, self.exec_timeout) => waited,
            _ = abort.cancelled() => {
                session.handle.cancel().await;
                return Err(AgentError::Aborted);
            }
        };
        let exit_code = match waited {
            Ok(code) => code,
            Err(AgentError::Timeout) => {
                session.handle.cancel().await;
                return Err(AgentError::Timeout);
            }
            Err(other) => return Err(other),
        };
        Ok(ExecOutcome {
            exit_code,
            transcript: session.handle.transcript().await,
        })
    }

    /// Writes a rejection with feedback; the child may then stream a fresh
    /// plan block, which replaces the session's extract.
    pub async fn reject(
        &self,
        session: &mut PlanSession,
        feedback: &str,
    ) -> Result<(), AgentError> {
        session
            .handle
            .write_stdin_line(&approval_record(false, Some(feedback)))
            .await?;
        let Some(mut lines_rx) = session.handle.take_lines() else {
            return Ok(());
        };
        let transcript = self
            .collect_plan_block(&mut session.handle, &mut lines_rx)
            .await?;
        session.handle.restore_lines(lines_rx);
        session.extract = extract_plan(&transcript);
        session.transcript = transcript;
        session.awaits_interactive_approval = session.handle.is_running();
        Ok(())
    }

    /// Direct execution with no interactive approval path: stdin is closed
    /// after the prompt and the child runs to completion.
    pub async fn start_one_shot(
        &self,
        kind: AgentKind,
        prompt: &str,
        workdir: &Path,
        execution_id: &str,
        frames_tx: mpsc::Sender<AgentFrame>,
        extra_args: &[String],
        abort: CancellationToken,
    ) -> Result<ExecOutcome, AgentError> {
        let binary = self.catalog.locate(kind).await?;
        let mut args: Vec<String> = exec_mode_args(kind).iter().map(|a| a.to_string()).collect();
        args.extend(extra_args.iter().cloned());
        let mut handle = self
            .spawn(
                &binary.path,
                &args,
                Some(prompt),
                workdir,
                execution_id,
                frames_tx,
                false,
            )
            .await?;
        info!(agent = kind.as_str(), pid = handle.pid, "one-shot agent started");

        let mut exit_rx = handle.exit_receiver();
        let waited = tokio::select! {
            waited = wait_exit_rx(&mut exit_rx, self.exec_timeout) => waited,
            _ = abort.cancelled() => {
                handle.cancel().await;
                return Err(AgentError::Aborted);
            }
        };
        let exit_code = match waited {
            Ok(code) => code,
            Err(AgentError::Timeout) => {
                handle.cancel().await;
                return Err(AgentError::Timeout);
            }
            Err(other) => return Err(other),
        };
        Ok(ExecOutcome {
            exit_code,
            transcript: handle.transcript().await,
        })
    }

    async fn collect_plan_block(
        &self,
        handle: &mut AgentHandle,
        lines_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<String, AgentError> {
        let mut transcript = String::new();
        let deadline = tokio::time::sleep(self.exec_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                maybe_line = lines_rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            transcript.push_str(&line);
                            transcript.push('\n');
                            if plan_block_complete(&transcript) {
                                break;
                            }
                        }
                        None => {
                            // Stream closed: the plan is whatever was said
                            // before a clean exit.
                            let code = handle.wait_exit(STREAM_CLOSE_WAIT).await?;
                            if code != 0 {
                                return Err(AgentError::PlanFailed { exit_code: code });
                            }
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    handle.cancel().await;
                    return Err(AgentError::Timeout);
                }
            }
        }
        if let Some(code) = handle.exit_code() {
            if code != 0 {
                return Err(AgentError::PlanFailed { exit_code: code });
            }
        }
        Ok(transcript)
    }

    async fn spawn<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        prompt: Option<&str>,
        workdir: &Path,
        execution_id: &str,
        frames_tx: mpsc::Sender<AgentFrame>,
        keep_stdin: bool,
    ) -> Result<AgentHandle, AgentError> {
        let mut command = Command::new(program);
        for arg in args {
            command.arg(arg.as_ref());
        }
        let mut child = command
            .current_dir(workdir)
            .env("NO_COLOR", "1")
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let pid = child.id().unwrap_or(0);
        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Io(io::Error::new(io::ErrorKind::Other, "no stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Io(io::Error::new(io::ErrorKind::Other, "no stderr")))?;

        if let (Some(stdin), Some(prompt)) = (stdin.as_mut(), prompt) {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }
        if !keep_stdin {
            stdin.take();
        }

        let ring = Arc::new(Mutex::new(OutputRing::new(self.max_buffer_bytes)));
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let hard_kill = CancellationToken::new();

        tokio::spawn(pump_stream(
            BufReader::new(stdout),
            StreamKind::Stdout,
            execution_id.to_string(),
            frames_tx.clone(),
            ring.clone(),
            Some(lines_tx),
        ));
        tokio::spawn(pump_stream(
            BufReader::new(stderr),
            StreamKind::Stderr,
            execution_id.to_string(),
            frames_tx,
            ring.clone(),
            None,
        ));

        let waiter_kill = hard_kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = waiter_kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            let _ = exit_tx.send(Some(code));
        });

        Ok(AgentHandle {
            pid,
            execution_id: execution_id.to_string(),
            stdin: Arc::new(Mutex::new(stdin)),
            exit_rx,
            hard_kill,
            lines_rx: Some(lines_rx),
            ring,
        })
    }
}

async fn wait_exit_rx(
    rx: &mut watch::Receiver<Option<i32>>,
    timeout: Duration,
) -> Result<i32, AgentError> {
    if let Some(code) = *rx.borrow() {
        return Ok(code);
    }
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok((*rx.borrow()).unwrap_or(-1));
                }
                if let Some(code) = *rx.borrow() {
                    return Ok(code);
                }
            }
            _ = &mut deadline => return Err(AgentError::Timeout),
        }
    }
}

async fn pump_stream<R>(
    mut reader: BufReader<R>,
    stream: StreamKind,
    execution_id: String,
    frames_tx: mpsc::Sender<AgentFrame>,
    ring: Arc<Mutex<OutputRing>>,
    lines_tx: Option<mpsc::UnboundedSender<String>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let new_burst = {
            let mut ring = ring.lock().await;
            ring.push(line.as_bytes())
        };
        if new_burst {
            let _ = frames_tx
                .send(AgentFrame::Truncated {
                    execution_id: execution_id.clone(),
                    stream,
                })
                .await;
        }
        let _ = frames_tx
            .send(AgentFrame::Output(OutputFrame {
                execution_id: execution_id.clone(),
                stream,
                data: line.clone(),
                ts: Utc::now(),
            }))
            .await;
        if let Some(lines_tx) = &lines_tx {
            let _ = lines_tx.send(line.trim_end_matches('\n').to_string());
        }
    }
}

fn plan_mode_args(kind: AgentKind) -> &'static [&'static str] {
    match kind {
        AgentKind::ClaudeCode => &["--print", "--permission-mode", "plan"],
        AgentKind::Codex => &["exec", "--sandbox", "read-only"],
        AgentKind::Gemini => &["--approval-mode", "plan"],
    }
}

fn exec_mode_args(kind: AgentKind) -> &'static [&'static str] {
    match kind {
        AgentKind::ClaudeCode => &["--print", "--permission-mode", "acceptEdits"],
        AgentKind::Codex => &["exec", "--full-auto"],
        AgentKind::Gemini => &["--approval-mode", "auto-edit"],
    }
}

/// The predetermined approval/rejection record written to an interactive
/// child's stdin. One line of JSON, the same shape for every agent kind.
fn approval_record(approved: bool, note: Option<&str>) -> String {
    json!({
        "type": "approval",
        "approved": approved,
        "note": note,
    })
    .to_string()
}
