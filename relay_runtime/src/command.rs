//! Process-backed worker.
//!
//! A [`CommandWorker`] runs one process per invocation. The resolved input
//! is written to stdin as JSON; stdout is parsed as JSON, or wrapped as
//! `{"text": ...}` when it is not. A non-zero exit becomes a worker error
//! with code `exit:<n>`.

use crate::config::CommandWorkerConfig;
use async_trait::async_trait;
use relay_agent::workflow::{InvocationContext, Worker, WorkerFailure};
use relay_core::Payload;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Worker that spawns a configured process.
#[derive(Clone, Debug)]
pub struct CommandWorker {
    config: CommandWorkerConfig,
}

impl CommandWorker {
    pub fn new(config: CommandWorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandWorkerConfig {
        &self.config
    }

    fn command(&self, ctx: &InvocationContext) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("RELAY_RUN_ID", ctx.run_id.to_string())
            .env("RELAY_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the invocation (timeout or cancellation) kills the process.
            .kill_on_drop(true);
        if let Some(task) = &ctx.task_id {
            cmd.env("RELAY_TASK_ID", task.as_str());
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn invoke(
        &self,
        input: Payload,
        ctx: &InvocationContext,
    ) -> Result<Payload, WorkerFailure> {
        let body = serde_json::to_vec(&input)
            .map_err(|e| WorkerFailure::with_code("encode", e.to_string()))?;

        debug!(command = %self.config.command, task = ?ctx.task_id, attempt = ctx.attempt, "spawning worker process");
        let mut child = self.command(ctx).spawn().map_err(|e| {
            WorkerFailure::with_code("spawn", format!("{}: {e}", self.config.command))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&body).await {
                // The process may exit without reading its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(WorkerFailure::with_code("stdin", e.to_string()));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkerFailure::with_code("wait", e.to_string()))?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("exit:{c}"))
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.config.command, output.status)
            } else {
                stderr
            };
            return Err(WorkerFailure::with_code(code, message));
        }

        Ok(parse_stdout(&output.stdout))
    }
}

fn parse_stdout(stdout: &[u8]) -> Payload {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Payload::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "text": text }))
}
