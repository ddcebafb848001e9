//! Response framing: backend stdout lines → OpenAI completion objects
//!
//! Aggregate mode collects every line into one `chat.completion`. Streaming
//! mode runs a supervising task per request that forwards each line as a
//! `chat.completion.chunk` over a bounded channel and finishes with a single
//! stop chunk. Dropping the receiver (client disconnect) kills the backend.

use crate::error::{GatewayError, GatewayResult};
use crate::openai::{
    AssistantMessage, BackendAnnotation, CHUNK_OBJECT, COMPLETION_OBJECT, ChatCompletion,
    ChatCompletionChunk, ChunkChoice, CompletionChoice, Delta, FinishReason, completion_id,
    unix_now,
};
use lls_local_llm::{BackendProcess, ExitOutcome};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Chunks buffered between the supervising task and the HTTP body.
pub const STREAM_BUFFER: usize = 32;

pub const NON_ZERO_EXIT_CODE: &str = "BACKEND_NON_ZERO_EXIT";

/// Builds every object of one response with a shared id and model name.
#[derive(Debug, Clone)]
pub struct CompletionFramer {
    id: String,
    model: String,
    last_created: i64,
}

impl CompletionFramer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            last_created: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // Never goes backwards within one response, even if the wall clock does.
    fn created(&mut self) -> i64 {
        self.last_created = self.last_created.max(unix_now());
        self.last_created
    }

    fn chunk(&mut self, delta: Delta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                delta,
                index: 0,
                finish_reason,
            }],
        }
    }

    /// One incremental chunk carrying `line`, trimmed.
    pub fn delta(&mut self, line: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                content: Some(line.trim().to_string()),
            },
            None,
        )
    }

    /// The terminal chunk: empty delta, `finish_reason: "stop"`.
    pub fn stop(&mut self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(FinishReason::Stop))
    }

    pub fn completion(
        &mut self,
        content: String,
        backend_error: Option<BackendAnnotation>,
    ) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: COMPLETION_OBJECT.to_string(),
            created: self.created(),
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: FinishReason::Stop,
                index: 0,
            }],
            backend_error,
        }
    }
}

/// Trimmed, non-empty lines joined by a single space.
pub fn join_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let trimmed = line.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn annotate(outcome: &ExitOutcome) -> Option<BackendAnnotation> {
    if outcome.success {
        return None;
    }
    let status = match outcome.code {
        Some(code) => format!("backend exited with status {code}"),
        None => "backend was terminated by a signal".to_string(),
    };
    let tail = outcome.stderr_tail.trim();
    let message = if tail.is_empty() {
        status
    } else {
        format!("{status}: {tail}")
    };
    Some(BackendAnnotation {
        code: NON_ZERO_EXIT_CODE.to_string(),
        message,
        exit_code: outcome.code,
    })
}

async fn kill_quietly(process: &mut dyn BackendProcess) {
    if let Err(e) = process.kill().await {
        warn!(pid = ?process.id(), error = %e, "failed to kill backend");
    }
}

/// Run the backend to completion and return a single completion object.
///
/// A line gap longer than `liveness` kills the process and fails the
/// request with [`GatewayError::BackendTimeout`]. A non-zero exit keeps the
/// output and adds a `backend_error` annotation.
pub async fn aggregate(
    mut framer: CompletionFramer,
    mut process: Box<dyn BackendProcess>,
    liveness: Duration,
) -> GatewayResult<ChatCompletion> {
    let mut lines = Vec::new();

    loop {
        match timeout(liveness, process.read_line()).await {
            Ok(Ok(Some(line))) => lines.push(line),
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(id = %framer.id(), error = %e, "backend stdout read failed");
                kill_quietly(process.as_mut()).await;
                break;
            }
            Err(_) => {
                warn!(id = %framer.id(), ?liveness, "backend went silent, killing it");
                kill_quietly(process.as_mut()).await;
                return Err(GatewayError::BackendTimeout(liveness));
            }
        }
    }

    let backend_error = match timeout(liveness, process.wait()).await {
        Ok(Ok(outcome)) => {
            let annotation = annotate(&outcome);
            if annotation.is_some() {
                warn!(
                    id = %framer.id(),
                    exit_code = ?outcome.code,
                    "backend exited unsuccessfully"
                );
            }
            annotation
        }
        Ok(Err(e)) => return Err(GatewayError::Internal(format!("waiting on backend: {e}"))),
        Err(_) => {
            warn!(id = %framer.id(), "backend closed stdout but did not exit, killing it");
            kill_quietly(process.as_mut()).await;
            return Err(GatewayError::BackendTimeout(liveness));
        }
    };

    info!(id = %framer.id(), lines = lines.len(), "completion aggregated");
    Ok(framer.completion(join_lines(&lines), backend_error))
}

/// Start the supervising task for one streamed response.
///
/// The receiver yields one delta per stdout line and then exactly one stop
/// chunk. Dropping it kills the backend.
pub fn spawn_stream(
    framer: CompletionFramer,
    process: Box<dyn BackendProcess>,
    liveness: Duration,
) -> mpsc::Receiver<ChatCompletionChunk> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(supervise(framer, process, liveness, tx));
    rx
}

async fn supervise(
    mut framer: CompletionFramer,
    mut process: Box<dyn BackendProcess>,
    liveness: Duration,
    tx: mpsc::Sender<ChatCompletionChunk>,
) {
    let mut sent = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                warn!(id = %framer.id(), sent, "client went away, killing backend");
                kill_quietly(process.as_mut()).await;
                reap(framer.id(), process.as_mut(), liveness).await;
                return;
            }
            next = timeout(liveness, process.read_line()) => next,
        };

        match next {
            Ok(Ok(Some(line))) => {
                if tx.send(framer.delta(&line)).await.is_err() {
                    warn!(id = %framer.id(), sent, "client went away, killing backend");
                    kill_quietly(process.as_mut()).await;
                    reap(framer.id(), process.as_mut(), liveness).await;
                    return;
                }
                sent += 1;
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(id = %framer.id(), error = %e, "backend stdout read failed");
                kill_quietly(process.as_mut()).await;
                break;
            }
            Err(_) => {
                warn!(id = %framer.id(), ?liveness, "backend went silent, killing it");
                kill_quietly(process.as_mut()).await;
                break;
            }
        }
    }

    // The stop chunk is the last thing the client sees regardless of how
    // the backend ended.
    let _ = tx.send(framer.stop()).await;
    drop(tx);

    debug!(id = %framer.id(), sent, "stream finished");
    reap(framer.id(), process.as_mut(), liveness).await;
}

/// Wait for the backend to exit, at most `liveness`. One that lingers (or
/// whose stderr is held open by a grandchild) is killed and left to
/// `kill_on_drop`.
async fn reap(id: &str, process: &mut dyn BackendProcess, liveness: Duration) {
    match timeout(liveness, process.wait()).await {
        Ok(Ok(outcome)) if outcome.success => debug!(id = %id, "backend exited"),
        Ok(Ok(outcome)) => warn!(
            id = %id,
            exit_code = ?outcome.code,
            stderr = %outcome.stderr_tail.trim(),
            "backend exited unsuccessfully"
        ),
        Ok(Err(e)) => warn!(id = %id, error = %e, "failed to reap backend"),
        Err(_) => {
            warn!(id = %id, ?liveness, "backend did not exit in time, killing it");
            kill_quietly(process).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Replays canned lines, then reports EOF, hangs forever or fails the
    /// read.
    struct Scripted {
        lines: VecDeque<String>,
        exit: ExitOutcome,
        hang_after: bool,
        fail_after: bool,
        wait_hangs: bool,
        killed: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                exit: ExitOutcome {
                    code: Some(0),
                    success: true,
                    stderr_tail: String::new(),
                },
                hang_after: false,
                fail_after: false,
                wait_hangs: false,
                killed: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn exiting_with(mut self, code: i32, stderr: &str) -> Self {
            self.exit = ExitOutcome {
                code: Some(code),
                success: code == 0,
                stderr_tail: stderr.to_string(),
            };
            self
        }

        fn hanging(mut self) -> Self {
            self.hang_after = true;
            self
        }

        fn failing(mut self) -> Self {
            self.fail_after = true;
            self
        }

        /// `wait` never resolves, even after a kill.
        fn never_exiting(mut self) -> Self {
            self.wait_hangs = true;
            self
        }
    }

    impl Drop for Scripted {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BackendProcess for Scripted {
        async fn read_line(&mut self) -> std::io::Result<Option<String>> {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            if self.fail_after {
                return Err(std::io::Error::other("broken pipe"));
            }
            if self.hang_after && !self.killed.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(None)
        }

        async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
            if self.wait_hangs {
                std::future::pending::<()>().await;
            }
            Ok(self.exit.clone())
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn join_lines_trims_and_skips_blanks() {
        assert_eq!(join_lines(["Hello", " world", "", "  "]), "Hello world");
        assert_eq!(join_lines(Vec::<String>::new()), "");
    }

    #[test]
    fn chunks_share_id_and_created_never_decreases() {
        let mut framer = CompletionFramer::new("llama-7b.gguf");
        let a = framer.delta(" Hello\n");
        let b = framer.stop();
        assert_eq!(a.id, b.id);
        assert!(b.created >= a.created);
        assert_eq!(a.content(), "Hello");
        assert_eq!(a.finish_reason(), None);
        assert_eq!(b.content(), "");
        assert_eq!(b.finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn aggregate_joins_lines() {
        let completion = aggregate(
            CompletionFramer::new("m"),
            Box::new(Scripted::new(&["Hello", " world"])),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(completion.choices[0].message.content, "Hello world");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
        assert!(completion.backend_error.is_none());
    }

    #[tokio::test]
    async fn aggregate_annotates_non_zero_exit() {
        let completion = aggregate(
            CompletionFramer::new("m"),
            Box::new(Scripted::new(&["partial"]).exiting_with(1, "CUDA error\n")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(completion.choices[0].message.content, "partial");
        let annotation = completion.backend_error.unwrap();
        assert_eq!(annotation.code, NON_ZERO_EXIT_CODE);
        assert_eq!(annotation.exit_code, Some(1));
        assert!(annotation.message.contains("CUDA error"));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_times_out_and_kills() {
        let process = Scripted::new(&["Hello"]).hanging();
        let killed = process.killed.clone();
        let err = aggregate(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::BackendTimeout(_)));
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stream_emits_deltas_then_stop() {
        let mut rx = spawn_stream(
            CompletionFramer::new("m"),
            Box::new(Scripted::new(&["Hello", " world"])),
            Duration::from_secs(5),
        );

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }

        let contents: Vec<_> = chunks.iter().map(|c| c.content().to_string()).collect();
        assert_eq!(contents, ["Hello", "world", ""]);
        assert_eq!(chunks.last().unwrap().finish_reason(), Some(FinishReason::Stop));
        assert!(chunks[..2].iter().all(|c| c.finish_reason().is_none()));
        assert!(chunks.iter().all(|c| c.id == chunks[0].id));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_timeout_kills_and_still_stops() {
        let process = Scripted::new(&["Hello"]).hanging();
        let killed = process.killed.clone();
        let mut rx = spawn_stream(CompletionFramer::new("m"), Box::new(process), Duration::from_secs(2));

        assert_eq!(rx.recv().await.unwrap().content(), "Hello");
        let last = rx.recv().await.unwrap();
        assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
        assert!(rx.recv().await.is_none());
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_receiver_kills_backend() {
        let process = Scripted::new(&["Hello"]).hanging();
        let killed = process.killed.clone();
        let mut rx = spawn_stream(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(60),
        );

        assert_eq!(rx.recv().await.unwrap().content(), "Hello");
        drop(rx);

        for _ in 0..100 {
            if killed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn aggregate_keeps_output_read_before_a_stdout_error() {
        let process = Scripted::new(&["Hello"]).failing();
        let killed = process.killed.clone();
        let completion = aggregate(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(completion.choices[0].message.content, "Hello");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stream_stdout_error_kills_and_still_stops() {
        let process = Scripted::new(&["Hello"]).failing();
        let killed = process.killed.clone();
        let mut rx = spawn_stream(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(5),
        );

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }

        let contents: Vec<_> = chunks.iter().map(|c| c.content().to_string()).collect();
        assert_eq!(contents, ["Hello", ""]);
        assert_eq!(chunks[0].finish_reason(), None);
        assert_eq!(chunks[1].finish_reason(), Some(FinishReason::Stop));
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_gives_up_on_a_backend_that_never_exits() {
        let process = Scripted::new(&["Hello"]).hanging().never_exiting();
        let killed = process.killed.clone();
        let dropped = process.dropped.clone();
        let mut rx = spawn_stream(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(2),
        );

        assert_eq!(rx.recv().await.unwrap().content(), "Hello");
        drop(rx);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(killed.load(Ordering::SeqCst));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_stream_gives_up_on_a_backend_that_never_exits() {
        let process = Scripted::new(&["Hello"]).never_exiting();
        let dropped = process.dropped.clone();
        let mut rx = spawn_stream(
            CompletionFramer::new("m"),
            Box::new(process),
            Duration::from_secs(2),
        );

        while rx.recv().await.is_some() {}

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
