//! Agent runtime backed by the agent CLI child process.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    AgentRuntime, CancelHandle, CancelSignal, InvocationRequest, RawMessage, RuntimeStream, wire,
};
use crate::error::RuntimeError;

/// Maximum number of stderr bytes kept for error reporting.
const STDERR_TAIL_BYTES: usize = 4096;

/// Spawns one CLI process per invocation and streams its JSON output.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    binary: PathBuf,
    cwd: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cwd: None,
            extra_args: Vec::new(),
        }
    }

    /// Working directory for the agent process.
    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Additional arguments appended after the standard flags.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self, request: &InvocationRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .args(["--output-format", "stream-json", "--verbose"]);
        if let Some(ref resume) = request.resume {
            cmd.arg("--resume").arg(resume);
        }
        if let Some(ref model) = request.provider.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&self.extra_args);
        cmd.envs(request.provider.runtime_env());
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn start(
        &self,
        request: InvocationRequest,
    ) -> Result<Box<dyn RuntimeStream>, RuntimeError> {
        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&buf[start..]).into_owned()
            })
        });

        tracing::debug!(
            provider = %request.provider.name,
            resume = ?request.resume,
            pid = ?child.id(),
            "Spawned agent runtime process"
        );

        let cancel = CancelSignal::new();
        let cancel_rx = cancel.subscribe();
        Ok(Box::new(ProcessStream {
            child,
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            cancel,
            cancel_rx,
            stderr_task,
            saw_result: false,
            finished: false,
        }))
    }
}

struct ProcessStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<RawMessage>,
    cancel: CancelSignal,
    cancel_rx: watch::Receiver<bool>,
    stderr_task: Option<JoinHandle<String>>,
    saw_result: bool,
    finished: bool,
}

enum Next {
    Cancelled,
    Line(std::io::Result<Option<String>>),
}

impl ProcessStream {
    async fn terminate(&mut self) {
        self.finished = true;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    async fn exit_error(&mut self) -> Option<RuntimeError> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return Some(RuntimeError::Io(e.to_string())),
        };
        if status.success() || self.saw_result {
            return None;
        }
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(RuntimeError::Exited {
            code: status.code(),
            stderr,
        })
    }
}

#[async_trait]
impl RuntimeStream for ProcessStream {
    async fn produce_next(&mut self) -> Option<Result<RawMessage, RuntimeError>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                if matches!(message, RawMessage::Result(_)) {
                    self.saw_result = true;
                }
                return Some(Ok(message));
            }
            if self.finished {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel_rx.wait_for(|cancelled| *cancelled) => Next::Cancelled,
                line = self.lines.next_line() => Next::Line(line),
            };

            match next {
                Next::Cancelled => {
                    tracing::debug!("Agent runtime cancelled, killing process");
                    self.terminate().await;
                    return None;
                }
                Next::Line(Ok(Some(line))) => match wire::decode_line(&line) {
                    Ok(messages) => self.pending.extend(messages),
                    Err(e) => {
                        // The CLI occasionally prints non-JSON diagnostics on stdout.
                        tracing::warn!(error = %e, "Skipping undecodable runtime output");
                    }
                },
                Next::Line(Ok(None)) => {
                    self.finished = true;
                    return self.exit_error().await.map(Err);
                }
                Next::Line(Err(e)) => {
                    self.terminate().await;
                    return Some(Err(RuntimeError::Io(e.to_string())));
                }
            }
        }
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(self.cancel.clone())
    }
}
