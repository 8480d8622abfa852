//! Line-framed stdio transport.
//!
//! Owns the server child process and its pipes:
//! - Writing one frame (one JSON object + `\n`) to stdin from a single writer task
//! - Reading one complete frame at a time from stdout
//! - Draining stderr into the log, never into the protocol
//! - Cooperative-then-forced shutdown

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::ServerConfig;
use super::errors::McpError;

/// Frame separator.
const RECORD_SEPARATOR: u8 = b'\n';

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How often shutdown checks whether the child has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the child to be reaped after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Frame Sink ─────────────────────────────────────────────────────────────

/// Anything frames can be written to.
///
/// Implementations must write each frame atomically with respect to other
/// writers. Dropping a `write_frame` future must never leave part of a frame
/// on the wire: once accepted, a frame is written whole.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: &[u8]) -> Result<(), McpError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// One queued line and where to report how writing it went.
struct WriteRequest {
    line: Vec<u8>,
    done: oneshot::Sender<Result<(), McpError>>,
}

/// Child process plus the write half of its stdio.
///
/// Stdin belongs to a writer task; callers only enqueue lines, so a caller
/// that gives up never cuts a frame short. The read half is handed out
/// separately as a [`FrameReader`].
pub struct StdioTransport {
    command: String,
    pid: Option<u32>,
    frames: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Child>,
    stderr_tail: StderrTail,
    shut_down: AtomicBool,
}

impl StdioTransport {
    /// Launch the server process.
    ///
    /// The child inherits the ambient environment with `config.env` layered
    /// on top. It is killed if the transport is dropped without `shutdown`.
    pub fn start(config: &ServerConfig) -> Result<(Self, FrameReader), McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args).envs(&config.env);

        if let Some(ref dir) = config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            command: config.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            command: config.command.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            command: config.command.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            stderr_tail.drain(config.command.clone(), stderr);
        }

        let (frames, queue) = mpsc::unbounded_channel();
        let writer = spawn_writer(config.command.clone(), stdin, queue);

        let pid = child.id();
        tracing::info!(
            command = %config.display_command(),
            pid = ?pid,
            "server process started"
        );

        let transport = Self {
            command: config.command.clone(),
            pid,
            frames: Mutex::new(Some(frames)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            stderr_tail,
            shut_down: AtomicBool::new(false),
        };

        Ok((transport, FrameReader::new(stdout)))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one frame followed by the record separator.
    ///
    /// The frame must not itself contain a separator. Resolves once the
    /// writer task has flushed it. Dropping the future does not withdraw a
    /// frame that was already queued.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), McpError> {
        if frame.contains(&RECORD_SEPARATOR) {
            return Err(McpError::protocol("frame contains a record separator"));
        }

        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame);
        line.push(RECORD_SEPARATOR);

        let (done, written) = oneshot::channel();
        let queued = lock(&self.frames)
            .as_ref()
            .map(|frames| frames.send(WriteRequest { line, done }).is_ok())
            .unwrap_or(false);
        if !queued {
            return Err(McpError::transport("server stdin is closed"));
        }

        written
            .await
            .map_err(|_| McpError::transport("server stdin closed before the frame was written"))?
    }

    /// Non-blocking check of whether the child is still running.
    pub fn is_alive(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Recent stderr output, oldest line first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Like [`stderr_tail`](Self::stderr_tail), but first gives the drain
    /// task up to `wait` to reach the end of the pipe. Meant for after
    /// `shutdown`, when the last lines may still be in flight.
    pub async fn final_stderr(&self, wait: Duration) -> String {
        self.stderr_tail.settle(wait).await;
        self.stderr_tail.snapshot()
    }

    /// Stop the child: close stdin, then SIGTERM, then SIGKILL once `grace`
    /// has run out.
    ///
    /// Idempotent. Never waits on a blocked write. Returns the exit code when
    /// the child exited normally.
    pub async fn shutdown(&self, grace: Duration) -> Option<i32> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return self.try_exit().and_then(|s| s.code());
        }

        // Closing stdin is the first termination request. Aborting the
        // writer drops stdin even when a write is stuck on a full pipe.
        drop(lock(&self.frames).take());
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }

        if let Some(status) = self.try_exit() {
            tracing::info!(command = %self.command, code = ?status.code(), "server already exited");
            return status.code();
        }

        // Half the grace period for stdin close, half for SIGTERM.
        let phase = grace / 2;
        if let Some(status) = self.wait_exit(phase).await {
            tracing::info!(command = %self.command, code = ?status.code(), "server exited after stdin close");
            return status.code();
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                request_termination(pid);
            }
        }

        if let Some(status) = self.wait_exit(grace - phase).await {
            tracing::info!(command = %self.command, code = ?status.code(), "server stopped");
            return status.code();
        }

        tracing::warn!(
            command = %self.command,
            grace_ms = grace.as_millis() as u64,
            "server did not exit within grace period, killing"
        );
        if let Err(e) = lock(&self.child).start_kill() {
            tracing::error!(command = %self.command, error = %e, "kill failed");
        }
        self.wait_exit(REAP_TIMEOUT).await.and_then(|s| s.code())
    }

    fn try_exit(&self) -> Option<ExitStatus> {
        match lock(&self.child).try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(command = %self.command, error = %e, "try_wait failed");
                None
            }
        }
    }

    /// Poll for exit without holding the child lock across a sleep, so
    /// `is_alive` stays non-blocking during shutdown.
    async fn wait_exit(&self, within: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(status) = self.try_exit() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl FrameSink for StdioTransport {
    async fn write_frame(&self, frame: &[u8]) -> Result<(), McpError> {
        StdioTransport::write_frame(self, frame).await
    }
}

/// Sole owner of stdin. Writes queued lines in order, each one whole.
///
/// Stdin closes when the queue's last sender is dropped or the task is
/// aborted.
fn spawn_writer(
    command: String,
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(WriteRequest { line, done }) = queue.recv().await {
            let written = write_line(&mut stdin, &line).await;
            if let Err(ref e) = written {
                tracing::debug!(server = %command, error = %e, "stdin write failed");
            }
            let _ = done.send(written);
        }
    })
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> Result<(), McpError> {
    stdin
        .write_all(line)
        .await
        .map_err(|e| McpError::transport(format!("failed to write to stdin: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| McpError::transport(format!("failed to flush stdin: {e}")))
}

/// Send SIGTERM to the child.
#[cfg(unix)]
fn request_termination(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = ?e, "SIGTERM failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Frame Reader ────────────────────────────────────────────────────────────

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrame {
    /// One complete frame, separator stripped.
    Frame(Vec<u8>),
    /// The pipe closed.
    Eof,
}

/// Read half of the transport.
pub struct FrameReader {
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            reader: BufReader::new(stdout),
            buf: Vec::new(),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// Blank lines are skipped. Bytes left without a separator when the pipe
    /// closes are dropped and reported as EOF.
    pub async fn read_frame(&mut self) -> Result<ReadFrame, McpError> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(RECORD_SEPARATOR, &mut self.buf)
                .await
                .map_err(|e| McpError::transport(format!("failed to read from stdout: {e}")))?;

            if n == 0 {
                return Ok(ReadFrame::Eof);
            }

            if self.buf.last() != Some(&RECORD_SEPARATOR) {
                tracing::warn!(bytes = n, "discarding unterminated frame at end of stream");
                return Ok(ReadFrame::Eof);
            }

            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(ReadFrame::Frame(std::mem::take(&mut self.buf)));
        }
    }
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Bounded buffer of the child's most recent stderr lines.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    finished: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

impl StderrTail {
    fn drain(&self, command: String, stderr: ChildStderr) {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(target: "mcp_stdio::server_stderr", server = %command, "{line}");
                if let Ok(mut lines) = tail.lines.lock() {
                    if lines.len() == STDERR_TAIL_LINES {
                        lines.pop_front();
                    }
                    lines.push_back(line);
                }
            }
            tail.finished.store(true, Ordering::SeqCst);
            tail.closed.notify_one();
        });
    }

    /// Wait up to `wait` for the stderr pipe to close.
    async fn settle(&self, wait: Duration) {
        let _ = tokio::time::timeout(wait, async {
            while !self.finished.load(Ordering::SeqCst) {
                self.closed.notified().await;
            }
        })
        .await;
    }

    fn snapshot(&self) -> String {
        self.lines
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let config = ServerConfig::new("nonexistent_command_that_does_not_exist_abc123");
        match StdioTransport::start(&config) {
            Err(McpError::Spawn { command, .. }) => {
                assert_eq!(command, "nonexistent_command_that_does_not_exist_abc123");
            }
            Err(other) => panic!("expected Spawn, got {other}"),
            Ok(_) => panic!("expected spawn to fail"),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_through_cat() {
        let (transport, mut reader) = StdioTransport::start(&ServerConfig::new("cat")).unwrap();

        transport.write_frame(br#"{"id":1,"method":"ping"}"#).await.unwrap();
        transport.write_frame(br#"{"id":2,"method":"ping"}"#).await.unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            ReadFrame::Frame(br#"{"id":1,"method":"ping"}"#.to_vec())
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            ReadFrame::Frame(br#"{"id":2,"method":"ping"}"#.to_vec())
        );

        assert_eq!(transport.shutdown(Duration::from_secs(2)).await, Some(0));
        assert_eq!(reader.read_frame().await.unwrap(), ReadFrame::Eof);
    }

    #[tokio::test]
    async fn test_frame_with_separator_rejected() {
        let (transport, _reader) = StdioTransport::start(&ServerConfig::new("cat")).unwrap();
        let err = transport.write_frame(b"{\"a\":\n1}").await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
        transport.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_partial_trailing_frame_is_never_returned() {
        let (_transport, mut reader) =
            StdioTransport::start(&sh(r#"printf '\n{"a":1}\r\n\n{"partial"'"#)).unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            ReadFrame::Frame(br#"{"a":1}"#.to_vec())
        );
        assert_eq!(reader.read_frame().await.unwrap(), ReadFrame::Eof);
    }

    #[tokio::test]
    async fn test_env_overlay_merges_over_ambient() {
        let config = sh(r#"printf '%s|%s\n' "$MCP_STDIO_OVERLAY" "${PATH:+ambient}""#)
            .with_env("MCP_STDIO_OVERLAY", "override");
        let (_transport, mut reader) = StdioTransport::start(&config).unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            ReadFrame::Frame(b"override|ambient".to_vec())
        );
    }

    #[tokio::test]
    async fn test_stderr_is_not_protocol_data() {
        let (transport, mut reader) =
            StdioTransport::start(&sh(r#"echo 'warming up' >&2; echo '{"id":1,"result":{}}'"#)).unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            ReadFrame::Frame(br#"{"id":1,"result":{}}"#.to_vec())
        );
        assert_eq!(reader.read_frame().await.unwrap(), ReadFrame::Eof);

        // The drain task runs concurrently; give it a moment.
        for _ in 0..50 {
            if !transport.stderr_tail().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.stderr_tail(), "warming up");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (transport, _reader) = StdioTransport::start(&ServerConfig::new("cat")).unwrap();
        assert!(transport.is_alive());

        assert_eq!(transport.shutdown(Duration::from_secs(2)).await, Some(0));
        assert_eq!(transport.shutdown(Duration::from_secs(2)).await, Some(0));
        assert!(!transport.is_alive());

        let err = transport.write_frame(b"{}").await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_force_kills_stubborn_child() {
        let (transport, _reader) =
            StdioTransport::start(&sh("trap '' TERM; while :; do sleep 1; done")).unwrap();

        let code = transport.shutdown(Duration::from_millis(200)).await;
        assert_eq!(code, None, "killed by signal, no exit code");
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_liveness_after_exit() {
        let (transport, _reader) = StdioTransport::start(&sh("exit 0")).unwrap();
        let mut alive = true;
        for _ in 0..100 {
            alive = transport.is_alive();
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive);
    }

    fn big_frame() -> Vec<u8> {
        format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{{"blob":"{}"}}}}"#,
            "x".repeat(1 << 20)
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_abandoned_write_is_still_a_whole_frame() {
        let (transport, mut reader) = StdioTransport::start(&sh("sleep 1; cat")).unwrap();
        let frame = big_frame();

        let reading = tokio::spawn(async move {
            let first = reader.read_frame().await.unwrap();
            let second = reader.read_frame().await.unwrap();
            (first, second)
        });

        // The child is not reading yet, so this gives up mid-write.
        let abandoned = tokio::time::timeout(Duration::from_millis(100), transport.write_frame(&frame)).await;
        assert!(abandoned.is_err());

        let ping = br#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;
        tokio::time::timeout(Duration::from_secs(10), transport.write_frame(ping))
            .await
            .expect("ping was not written")
            .unwrap();

        let (first, second) = tokio::time::timeout(Duration::from_secs(10), reading)
            .await
            .expect("frames were not echoed")
            .unwrap();
        assert_eq!(first, ReadFrame::Frame(frame));
        assert_eq!(second, ReadFrame::Frame(ping.to_vec()));

        transport.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_stuck_write() {
        let (transport, _reader) =
            StdioTransport::start(&sh("trap '' TERM; while :; do sleep 1; done")).unwrap();
        let transport = Arc::new(transport);

        let writing = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.write_frame(&big_frame()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writing.is_finished(), "the child never reads, so the write must be stuck");

        let code = tokio::time::timeout(
            Duration::from_secs(3),
            transport.shutdown(Duration::from_millis(200)),
        )
        .await
        .expect("shutdown waited on the stuck write");
        assert_eq!(code, None);
        assert!(!transport.is_alive());

        let err = writing.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_liveness_answers_during_shutdown() {
        let (transport, _reader) =
            StdioTransport::start(&sh("trap '' TERM; while :; do sleep 1; done")).unwrap();
        let transport = Arc::new(transport);

        let stopping = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.shutdown(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let asked = std::time::Instant::now();
        assert!(transport.is_alive());
        assert!(asked.elapsed() < Duration::from_millis(100));

        stopping.await.unwrap();
        assert!(!transport.is_alive());
    }
}
