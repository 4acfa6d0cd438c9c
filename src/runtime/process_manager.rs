// src/runtime/process_manager.rs
//! Process manager for running one command to completion under a deadline
//!
//! Each command runs as the leader of its own process group so that the
//! whole tree can be signalled at once: on deadline expiry, and again after
//! a normal exit to reap anything the command left running in the
//! background.
//!
//! Stdout and stderr are read concurrently and appended to one shared
//! capture as lines arrive, so the combined log keeps the order in which the
//! process produced it.

use crate::runtime::outcome::TIMEOUT_EXIT_CODE;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep reading pipes after the process group is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line, without its trailing newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Configuration for running a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Program name (looked up in PATH) or path
    pub program: String,

    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables; the parent environment is not inherited
    /// apart from `PATH`
    pub env_vars: Vec<(String, String)>,

    /// Bytes written to stdin before it is closed
    pub stdin: Option<Vec<u8>>,

    /// Execution deadline
    pub timeout: Duration,

    /// Stdout block kept whole even once the capture limit is reached
    pub result_frame: Option<ResultFrame>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: vec![],
            work_dir: None,
            env_vars: vec![],
            stdin: None,
            timeout: Duration::from_secs(30),
            result_frame: None,
        }
    }
}

/// Everything observed from one process run
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,

    /// Stdout and stderr lines in arrival order
    pub lines: Vec<OutputLine>,

    /// Exit code; `128 + signal` when killed by a signal, `-1` on timeout
    pub exit_code: i32,

    pub timed_out: bool,

    /// Set when a stream exceeded the capture limit
    pub truncated: bool,

    /// Set when a line inside the result frame had to be dropped
    pub frame_truncated: bool,
}

/// Begin and end lines delimiting a block of stdout.
///
/// Lines between the markers are budgeted separately from the rest of the
/// stream, so log volume can never push the block out of the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub begin: String,
    pub end: String,
}

#[derive(Debug, Default)]
struct Capture {
    lines: Vec<OutputLine>,
    limit: usize,
    stdout_bytes: usize,
    stderr_bytes: usize,
    truncated: bool,
    frame: Option<ResultFrame>,
    in_frame: bool,
    frame_bytes: usize,
    frame_truncated: bool,
}

impl Capture {
    fn new(limit: usize, frame: Option<ResultFrame>) -> Self {
        Self {
            limit,
            frame,
            ..Default::default()
        }
    }

    /// Record one line. `oversized` lines were cut while reading and are
    /// dropped.
    fn push(&mut self, line: OutputLine, oversized: bool) {
        if line.stream == OutputStream::Stdout && !oversized {
            if let Some(frame) = &self.frame {
                if line.text == frame.begin {
                    self.in_frame = true;
                    self.frame_bytes = 0;
                    self.lines.push(line);
                    return;
                }
                if self.in_frame && line.text == frame.end {
                    self.in_frame = false;
                    self.lines.push(line);
                    return;
                }
            }
        }

        if self.in_frame && line.stream == OutputStream::Stdout {
            if oversized || self.frame_bytes + line.text.len() > self.limit {
                self.frame_truncated = true;
                self.truncated = true;
                return;
            }
            self.frame_bytes += line.text.len() + 1;
            self.lines.push(line);
            return;
        }

        let counter = match line.stream {
            OutputStream::Stdout => &mut self.stdout_bytes,
            OutputStream::Stderr => &mut self.stderr_bytes,
        };
        if oversized || *counter + line.text.len() > self.limit {
            self.truncated = true;
            return;
        }
        *counter += line.text.len() + 1;
        self.lines.push(line);
    }

    fn into_output(self, exit_code: i32, timed_out: bool) -> ProcessOutput {
        let join = |stream: OutputStream| {
            self.lines
                .iter()
                .filter(|l| l.stream == stream)
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        ProcessOutput {
            stdout: join(OutputStream::Stdout),
            stderr: join(OutputStream::Stderr),
            exit_code,
            timed_out,
            truncated: self.truncated,
            frame_truncated: self.frame_truncated,
            lines: self.lines,
        }
    }
}

/// Spawns processes and supervises them until exit or deadline
pub struct ProcessManager {
    /// Resolved executable paths (cached)
    executable_paths: DashMap<String, PathBuf>,

    /// SIGTERM → SIGKILL delay on deadline expiry
    kill_grace: Duration,

    /// Per-stream capture limit in bytes
    max_output_bytes: usize,
}

impl ProcessManager {
    pub fn new(kill_grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            executable_paths: DashMap::new(),
            kill_grace,
            max_output_bytes,
        }
    }

    /// Find an executable, consulting PATH for bare names
    pub fn find_executable(&self, program: &str) -> Result<PathBuf> {
        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }

        if let Some(path) = self.executable_paths.get(program) {
            return Ok(path.clone());
        }

        match which::which(program) {
            Ok(path) => {
                info!("Found {} at {:?}", program, path);
                self.executable_paths.insert(program.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(EngineError::ProcessSpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                program, e
            ))),
        }
    }

    /// Run a process to completion or until its deadline.
    ///
    /// `on_spawn` receives the PID right after the process starts, before
    /// any output is read.
    pub async fn run<F>(&self, config: SpawnConfig, on_spawn: F) -> Result<ProcessOutput>
    where
        F: FnOnce(u32),
    {
        let executable = self.find_executable(&config.program)?;

        debug!("Spawning {:?} {:?}", executable, config.args);

        let mut command = Command::new(&executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        command.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(if config.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("Failed to spawn {:?}: {}", executable, e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Process exited before start".into()))?;
        debug!("Process spawned with PID: {}", pid);
        on_spawn(pid);

        if let (Some(data), Some(mut stdin)) = (config.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // The process may exit without reading its input
                if let Err(e) = stdin.write_all(&data).await {
                    debug!("stdin write to PID {} failed: {}", pid, e);
                }
            });
        }

        let capture = Arc::new(Mutex::new(Capture::new(
            self.max_output_bytes,
            config.result_frame,
        )));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::RuntimeError("Failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::RuntimeError("Failed to capture stderr".into()))?;
        let readers = [
            spawn_reader(stdout, OutputStream::Stdout, capture.clone(), self.max_output_bytes),
            spawn_reader(stderr, OutputStream::Stderr, capture.clone(), self.max_output_bytes),
        ];

        let waited = tokio::time::timeout(config.timeout, child.wait()).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(status)) => (exit_code_of(status), false),
            Ok(Err(e)) => {
                kill_group(pid, Signal::SIGKILL);
                return Err(EngineError::RuntimeError(format!(
                    "Failed to wait for PID {}: {}",
                    pid, e
                )));
            }
            Err(_) => {
                debug!("PID {} exceeded its {:?} deadline", pid, config.timeout);
                self.terminate(pid, &mut child).await;
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        // Reap background descendants still holding the pipes
        kill_group(pid, Signal::SIGKILL);

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!("Output of PID {} still open after exit, dropping the rest", pid);
                abort.abort();
            }
        }

        let capture = std::mem::take(&mut *capture.lock());
        Ok(capture.into_output(exit_code, timed_out))
    }

    /// SIGTERM the group, then SIGKILL once the grace period passes
    async fn terminate(&self, pid: u32, child: &mut Child) {
        kill_group(pid, Signal::SIGTERM);

        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
            return;
        }

        debug!("PID {} still alive, sending SIGKILL", pid);
        kill_group(pid, Signal::SIGKILL);
        if let Err(e) = child.kill().await {
            warn!("Failed to kill PID {}: {}", pid, e);
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), 1024 * 1024)
    }
}

fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    capture: Arc<Mutex<Capture>>,
    limit: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Room for a full-limit line plus "\r\n"
    let max_line = limit.saturating_add(2);
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_line_bounded(&mut reader, &mut buf, max_line).await {
                Ok((0, _)) => break,
                Ok((_, oversized)) => {
                    let text = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
                    capture.lock().push(OutputLine { stream, text }, oversized);
                }
                Err(e) => {
                    warn!("Error reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

/// Read one line, keeping at most `max` bytes of it in `buf` and consuming
/// the rest. Returns the bytes consumed and whether the line was cut.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut cut = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((consumed, cut));
        }
        let (len, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        if len > room {
            cut = true;
        }
        buf.extend_from_slice(&available[..len.min(room)]);
        reader.consume(len);
        consumed += len;
        if done {
            return Ok((consumed, cut));
        }
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(TIMEOUT_EXIT_CODE)
}

fn kill_group(pid: u32, signal: Signal) {
    // ESRCH just means the group is already gone
    let _ = killpg(Pid::from_raw(pid as i32), signal);
}
