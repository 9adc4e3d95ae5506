//! Stdio transport (primary, spec §4.4): one worker subprocess, one
//! UTF-8 JSON object per line in each direction. A single-slot mutex wraps
//! the full write-then-read round trip so concurrent callers queue instead
//! of interleaving frames on the pipe.

use super::{classify, transport_failure, CallDeadlines, CallOutcome, RequestEnvelope, WorkerIpc};
use crate::{OrchestratorError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::Mutex,
    time::timeout,
};

struct Channel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct StdioTransport {
    child: Mutex<Child>,
    channel: Mutex<Channel>,
}

impl StdioTransport {
    /// Spawns the configured interpreter against the worker script. The
    /// caller is expected to call [`WorkerIpc::initialize`] immediately
    /// after construction and only mark the owning worker Ready once that
    /// succeeds.
    pub fn spawn(interpreter_path: &Path, script_path: &Path) -> Result<Self> {
        let mut child = tokio::process::Command::new(interpreter_path)
            .arg(script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Fatal("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Fatal("worker stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::Fatal("worker stderr not piped".to_string()))?;

        // Worker diagnostic text is captured and surfaced to the log
        // pipeline, never parsed (spec §4.4).
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "worker_stderr", "{line}");
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            channel: Mutex::new(Channel {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    async fn round_trip(
        &self,
        request: &RequestEnvelope,
        deadlines: CallDeadlines,
    ) -> Result<super::ResponseEnvelope> {
        let mut channel = self.channel.lock().await;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        timeout(deadlines.inactivity, channel.stdin.write_all(line.as_bytes()))
            .await
            .map_err(|_| transport_failure("stdio write", "inactivity timeout"))?
            .map_err(|e| transport_failure("stdio write", e))?;

        let mut reply = String::new();
        let read = timeout(deadlines.hard, channel.stdout.read_line(&mut reply))
            .await
            .map_err(|_| transport_failure("stdio read", "hard timeout"))?
            .map_err(|e| transport_failure("stdio read", e))?;

        if read == 0 {
            return Err(transport_failure("stdio read", "transport closed"));
        }

        serde_json::from_str(reply.trim_end())
            .map_err(|e| transport_failure("stdio parse", e))
    }
}

#[async_trait::async_trait]
impl WorkerIpc for StdioTransport {
    async fn initialize(&self) -> Result<()> {
        let request = RequestEnvelope::new(super::message_type::INITIALIZE, "");
        let deadlines = CallDeadlines::control(60, 30);
        let response = self.round_trip(&request, deadlines).await?;
        if response.success {
            Ok(())
        } else {
            Err(OrchestratorError::ApplicationFailure(
                response
                    .error
                    .unwrap_or_else(|| "worker failed to initialize".to_string()),
            ))
        }
    }

    #[tracing::instrument(skip(self, request, deadlines), fields(message_type = %request.message_type))]
    async fn call(
        &self,
        request: RequestEnvelope,
        deadlines: CallDeadlines,
    ) -> Result<CallOutcome> {
        let response = self.round_trip(&request, deadlines).await?;
        Ok(classify(response))
    }

    async fn dispose(&self) -> Result<()> {
        {
            let mut channel = self.channel.lock().await;
            let _ = channel.stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        match timeout(std::time::Duration::from_secs(5), child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("worker did not exit cleanly within 5s; killing");
                let _ = child.kill().await;
                Ok(())
            }
        }
    }
}
