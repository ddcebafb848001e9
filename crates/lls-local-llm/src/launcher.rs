//! Backend process launching and supervision
//!
//! A llama.cpp binary is an opaque line-oriented text stream: the launcher
//! builds its command line, spawns it with stdout piped for the caller and
//! stderr drained in the background, and exposes only the narrow
//! [`BackendProcess`] interface (`read_line`, `wait`, `kill`). Nothing here
//! interprets model output.

use crate::error::{BackendError, BackendResult};
use crate::offload::OffloadPlan;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Bytes of stderr kept for diagnostics once the process exits.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Join chat messages into the single prompt string the binary receives:
/// `"<role>: <content>"` per message, in order, separated by one space.
pub fn flatten_prompt<'a, I>(messages: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    messages
        .into_iter()
        .map(|(role, content)| format!("{role}: {content}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything needed to start one inference process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub prompt: String,
    pub temperature: f32,
    /// `-1` means unbounded; any non-positive value is passed as `-1`.
    pub max_tokens: i64,
    pub offload: OffloadPlan,
    /// Appended verbatim after the generated arguments.
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(
        binary: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            model_path: model_path.into(),
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: -1,
            offload: OffloadPlan::cpu_only(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_offload(mut self, offload: OffloadPlan) -> Self {
        self.offload = offload;
        self
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Command-line arguments, excluding the binary itself.
    pub fn to_args(&self) -> Vec<OsString> {
        let max_tokens = if self.max_tokens > 0 { self.max_tokens } else { -1 };

        let mut args: Vec<OsString> = vec![
            "-m".into(),
            self.model_path.clone().into_os_string(),
            "--prompt".into(),
            self.prompt.clone().into(),
            "--temp".into(),
            self.temperature.to_string().into(),
            "-n".into(),
            max_tokens.to_string().into(),
        ];

        if self.offload.layer_count > 0 {
            args.push("--n-gpu-layers".into());
            args.push(self.offload.layer_count.to_string().into());
        } else if self.offload.use_memory_lock {
            args.push("--mlock".into());
        }

        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }
}

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// Last [`STDERR_TAIL_BYTES`] of stderr.
    pub stderr_tail: String,
}

/// The narrow interface the response framer drives.
#[async_trait]
pub trait BackendProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32> {
        None
    }

    /// Next stdout line without its line terminator; `None` at EOF.
    ///
    /// Cancel-safe: bytes of a partially read line survive a dropped call.
    async fn read_line(&mut self) -> std::io::Result<Option<String>>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;

    /// Terminate the process. A process that already exited is left alone.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts backend processes. The gateway holds one as a trait object so
/// the process source can be swapped.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> BackendResult<Box<dyn BackendProcess>>;
}

/// Spawns real child processes via [`InferenceProcess::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildProcessLauncher;

impl ProcessLauncher for ChildProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> BackendResult<Box<dyn BackendProcess>> {
        Ok(Box::new(InferenceProcess::start(spec)?))
    }
}

/// A running llama.cpp child process.
///
/// Spawned with `kill_on_drop`, so dropping the handle never orphans the
/// process.
pub struct InferenceProcess {
    binary: PathBuf,
    pid: Option<u32>,
    child: Child,
    stdout: BufReader<ChildStdout>,
    pending: Vec<u8>,
    stderr_tail: Option<JoinHandle<String>>,
}

impl InferenceProcess {
    /// Spawn the binary described by `spec`. Must run inside a tokio runtime.
    pub fn start(spec: &LaunchSpec) -> BackendResult<Self> {
        let launch_failed = |source: std::io::Error| BackendError::LaunchFailed {
            binary: spec.binary.clone(),
            source,
        };

        let args = spec.to_args();
        debug!(binary = %spec.binary.display(), ?args, "spawning backend");

        let mut child = Command::new(&spec.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_failed)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failed(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_failed(std::io::Error::other("stderr was not captured")))?;

        let pid = child.id();
        info!(
            pid = ?pid,
            binary = %spec.binary.display(),
            gpu_layers = spec.offload.layer_count,
            mlock = spec.offload.use_memory_lock,
            "backend process started"
        );

        Ok(Self {
            binary: spec.binary.clone(),
            pid,
            child,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
            stderr_tail: Some(tokio::spawn(drain_stderr(stderr, pid))),
        })
    }
}

#[async_trait]
impl BackendProcess for InferenceProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.stdout.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.pending.clear();
        Ok(Some(line))
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        let stderr_tail = match self.stderr_tail.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        debug!(pid = ?self.pid, status = %status, "backend process exited");
        Ok(ExitOutcome {
            code: status.code(),
            success: status.success(),
            stderr_tail,
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        info!(pid = ?self.pid, binary = %self.binary.display(), "backend process killed");
        Ok(())
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) -> String {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = String::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                debug!(pid = ?pid, "backend stderr: {line}");
                tail.push_str(line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let mut cut = tail.len() - STDERR_TAIL_BYTES;
                    while !tail.is_char_boundary(cut) {
                        cut += 1;
                    }
                    tail.drain(..cut);
                }
            }
        }
    }
    tail
}
