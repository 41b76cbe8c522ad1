//! Subprocess orchestration with three coupled timeouts.
//!
//! `first_byte`: the child must produce output on stdout or stderr or it is
//! killed. `idle`: reset on every chunk. `total`: hard ceiling. All kills go
//! through one `terminate` path: SIGTERM, a 500 ms grace wait, then SIGKILL
//! with a bounded wait for exit, so racing "aborted" against "exited" cannot
//! leak a child.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use homie_core::error::{HomieError, Result};

#[derive(Debug, Clone, Copy)]
pub struct SpawnTimeouts {
    pub first_byte: Duration,
    pub idle: Duration,
    pub total: Duration,
}

impl Default for SpawnTimeouts {
    fn default() -> Self {
        Self {
            first_byte: Duration::from_secs(15),
            idle: Duration::from_secs(45),
            total: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOut {
    FirstByte,
    Idle,
    Total,
}

impl TimedOut {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimedOut::FirstByte => "first_byte",
            TimedOut::Idle => "idle",
            TimedOut::Total => "total",
        }
    }
}

#[derive(Debug)]
pub struct SpawnResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: Option<TimedOut>,
}

impl SpawnResult {
    pub fn success(&self) -> bool {
        self.timed_out.is_none() && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Stdout,
    Stderr,
}

const GRACE_BEFORE_SIGKILL: Duration = Duration::from_millis(500);
const EXIT_WAIT_AFTER_SIGKILL: Duration = Duration::from_secs(2);
const EXIT_WAIT_AFTER_EOF: Duration = Duration::from_secs(5);

/// Spawn `cmd`, optionally feed `stdin_data`, and read both output streams
/// under the timeout regime. `on_chunk` observes every chunk in arrival
/// order: streaming backends use it for deltas and for the "no retry after
/// output" rule.
pub async fn spawn_with_timeouts(
    mut cmd: Command,
    stdin_data: Option<String>,
    timeouts: SpawnTimeouts,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(ChunkSource, &str),
) -> Result<SpawnResult> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| HomieError::Internal(format!("failed to spawn subprocess: {e}")))?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| HomieError::Internal(format!("failed to write stdin: {e}")))?;
            drop(stdin);
        }
    } else {
        drop(child.stdin.take());
    }

    let (tx, mut rx) = mpsc::channel::<(ChunkSource, String)>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, ChunkSource::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, ChunkSource::Stderr, tx.clone());
    }
    drop(tx);

    let start = Instant::now();
    let total_deadline = start + timeouts.total;
    let first_byte_deadline = start + timeouts.first_byte;
    let mut idle_deadline = start + timeouts.idle;
    let mut saw_output = false;

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    loop {
        let (deadline, which) = {
            let mut d = total_deadline;
            let mut w = TimedOut::Total;
            if !saw_output && first_byte_deadline < d {
                d = first_byte_deadline;
                w = TimedOut::FirstByte;
            }
            if saw_output && idle_deadline < d {
                d = idle_deadline;
                w = TimedOut::Idle;
            }
            (d, w)
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("subprocess cancelled; terminating child");
                terminate(&mut child).await;
                return Err(HomieError::Cancelled);
            }
            maybe = rx.recv() => match maybe {
                Some((source, text)) => {
                    saw_output = true;
                    idle_deadline = Instant::now() + timeouts.idle;
                    match source {
                        ChunkSource::Stdout => stdout_buf.push_str(&text),
                        ChunkSource::Stderr => stderr_buf.push_str(&text),
                    }
                    on_chunk(source, &text);
                }
                None => {
                    // Both streams hit EOF; collect the exit status.
                    let exit_code = match tokio::time::timeout(EXIT_WAIT_AFTER_EOF, child.wait()).await {
                        Ok(Ok(status)) => status.code(),
                        Ok(Err(e)) => {
                            warn!(error = %e, "wait failed after EOF");
                            None
                        }
                        Err(_) => {
                            warn!("child did not exit after closing its streams; killing");
                            terminate(&mut child).await;
                            None
                        }
                    };
                    debug!(?exit_code, "subprocess finished");
                    return Ok(SpawnResult {
                        stdout: stdout_buf,
                        stderr: stderr_buf,
                        exit_code,
                        timed_out: None,
                    });
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(kind = which.as_str(), "subprocess timeout; terminating child");
                terminate(&mut child).await;
                // Drain whatever the readers already buffered.
                while let Ok((source, text)) = rx.try_recv() {
                    match source {
                        ChunkSource::Stdout => stdout_buf.push_str(&text),
                        ChunkSource::Stderr => stderr_buf.push_str(&text),
                    }
                }
                return Ok(SpawnResult {
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                    exit_code: None,
                    timed_out: Some(which),
                });
            }
        }
    }
}

fn spawn_reader(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    source: ChunkSource,
    tx: mpsc::Sender<(ChunkSource, String)>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send((source, text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// SIGTERM, grace wait, then SIGKILL with a bounded wait. Idempotent: a
/// child that already exited makes every step a cheap no-op.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(GRACE_BEFORE_SIGKILL, child.wait())
        .await
        .is_err()
    {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(EXIT_WAIT_AFTER_SIGKILL, child.wait()).await;
    }
}

/// Line-buffered NDJSON/JSONL parser. Unparseable lines (progress noise,
/// ANSI control output) are skipped; the trailing unterminated buffer can be
/// flushed at stream close.
#[derive(Default)]
pub struct NdjsonBuffer {
    buf: String,
}

impl NdjsonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete JSON line parsed from it.
    pub fn push(&mut self, chunk: &str) -> Vec<serde_json::Value> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(v) => out.push(v),
                Err(_) => debug!(len = line.len(), "skipping unparseable stream line"),
            }
        }
        out
    }

    /// Parse whatever is left in the buffer (stream closed mid-line).
    pub fn flush(&mut self) -> Option<serde_json::Value> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        serde_json::from_str(rest).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn fast_timeouts(first_ms: u64, idle_ms: u64, total_ms: u64) -> SpawnTimeouts {
        SpawnTimeouts {
            first_byte: Duration::from_millis(first_ms),
            idle: Duration::from_millis(idle_ms),
            total: Duration::from_millis(total_ms),
        }
    }

    #[tokio::test]
    async fn clean_exit_collects_output() {
        let cancel = CancellationToken::new();
        let result = spawn_with_timeouts(
            sh("echo out; echo err >&2"),
            None,
            SpawnTimeouts::default(),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let cancel = CancellationToken::new();
        let result = spawn_with_timeouts(
            sh("cat"),
            Some("ping".to_string()),
            SpawnTimeouts::default(),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "ping");
    }

    #[tokio::test]
    async fn silent_child_hits_first_byte() {
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        let result = spawn_with_timeouts(
            sh("sleep 5"),
            None,
            fast_timeouts(100, 5_000, 10_000),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.timed_out, Some(TimedOut::FirstByte));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn stalling_child_hits_idle() {
        let cancel = CancellationToken::new();
        let result = spawn_with_timeouts(
            sh("echo started; sleep 5"),
            None,
            fast_timeouts(2_000, 150, 10_000),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.timed_out, Some(TimedOut::Idle));
        assert!(result.stdout.contains("started"));
    }

    #[tokio::test]
    async fn chatty_child_hits_total() {
        let cancel = CancellationToken::new();
        let result = spawn_with_timeouts(
            sh("while true; do echo tick; sleep 0.05; done"),
            None,
            fast_timeouts(2_000, 2_000, 400),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(result.timed_out, Some(TimedOut::Total));
        assert!(result.stdout.contains("tick"));
    }

    #[tokio::test]
    async fn cancellation_kills_child_promptly() {
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c2.cancel();
        });
        let start = std::time::Instant::now();
        let err = spawn_with_timeouts(
            sh("sleep 30"),
            None,
            SpawnTimeouts::default(),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HomieError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn on_chunk_sees_stream_output() {
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        spawn_with_timeouts(
            sh("printf 'a\\nb\\n'"),
            None,
            SpawnTimeouts::default(),
            &cancel,
            |source, text| {
                if source == ChunkSource::Stdout {
                    seen.push(text.to_string());
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(seen.join(""), "a\nb\n");
    }

    #[test]
    fn ndjson_parses_lines_and_skips_noise() {
        let mut buf = NdjsonBuffer::new();
        let mut values = buf.push("{\"a\":1}\nnot json\n{\"b\"");
        values.extend(buf.push(":2}\n"));
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["a"], 1);
        assert_eq!(values[1]["b"], 2);
    }

    #[test]
    fn ndjson_flushes_trailing_buffer() {
        let mut buf = NdjsonBuffer::new();
        assert!(buf.push("{\"done\":true}").is_empty());
        let tail = buf.flush().unwrap();
        assert_eq!(tail["done"], true);
        assert!(buf.flush().is_none());
    }
}
