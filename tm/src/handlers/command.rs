//! Shell command handler

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::dispatcher::{HandlerContext, HandlerError, TaskHandler};

/// Output kept per stream
const MAX_OUTPUT: usize = 30_000;

/// Runs `payload.command` with `sh -c`
///
/// Payload: `{"command": "...", "cwd": "optional/dir"}`. A relative `cwd` is
/// resolved against the handler's working directory.
#[derive(Debug, Clone, Default)]
pub struct CommandHandler {
    workdir: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self { workdir }
    }
}

fn truncate(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    if text.len() > MAX_OUTPUT {
        let mut end = MAX_OUTPUT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...\n[truncated, {} chars total]", &text[..end], text.len())
    } else {
        text.into_owned()
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn execute(&self, ctx: &HandlerContext, payload: &Value) -> Result<Value, HandlerError> {
        debug!(task_id = %ctx.task_id, "CommandHandler::execute: called");
        let command = payload["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| HandlerError::MalformedPayload("command is required".to_string()))?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        let cwd = match (payload["cwd"].as_str(), &self.workdir) {
            (Some(cwd), Some(base)) => Some(base.join(cwd)),
            (Some(cwd), None) => Some(PathBuf::from(cwd)),
            (None, base) => base.clone(),
        };
        if let Some(cwd) = &cwd {
            if !cwd.is_dir() {
                return Err(HandlerError::MalformedPayload(format!(
                    "cwd is not a directory: {}",
                    cwd.display()
                )));
            }
            cmd.current_dir(cwd);
        }

        let output = tokio::select! {
            output = cmd.output() => output,
            _ = ctx.cancel.cancelled() => {
                debug!(task_id = %ctx.task_id, "CommandHandler::execute: cancelled");
                return Err(HandlerError::Timeout(format!("command cancelled: {}", command)));
            }
        };

        let output = output.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => HandlerError::PermissionDenied(e.to_string()),
            _ => HandlerError::TransientIo(format!("failed to spawn command: {}", e)),
        })?;

        let stdout = truncate(&output.stdout);
        let stderr = truncate(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(task_id = %ctx.task_id, exit_code, "CommandHandler::execute: finished");

        if output.status.success() {
            Ok(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            }))
        } else {
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(HandlerError::Fatal(format!("exit code {}: {}", exit_code, detail.trim())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> HandlerContext {
        HandlerContext::new("cmd-1", 1, CancellationToken::new(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_command_success() {
        let result = CommandHandler::default()
            .execute(&ctx(), &json!({"command": "echo hello; echo warn >&2"}))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], json!(0));
        assert_eq!(result["stdout"], json!("hello\n"));
        assert_eq!(result["stderr"], json!("warn\n"));
    }

    #[tokio::test]
    async fn test_command_failure_is_fatal() {
        let err = CommandHandler::default()
            .execute(&ctx(), &json!({"command": "echo nope >&2; exit 3"}))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Fatal("exit code 3: nope".to_string()));
    }

    #[tokio::test]
    async fn test_command_runs_in_cwd() {
        let temp = tempdir().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub").join("marker"), "x").unwrap();

        let handler = CommandHandler::new(Some(temp.path().to_path_buf()));
        let result = handler
            .execute(&ctx(), &json!({"command": "ls", "cwd": "sub"}))
            .await
            .unwrap();
        assert!(result["stdout"].as_str().unwrap().contains("marker"));
    }

    #[tokio::test]
    async fn test_missing_command_is_malformed() {
        let err = CommandHandler::default().execute(&ctx(), &json!({})).await.unwrap_err();
        assert!(matches!(err, HandlerError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let cancel = CancellationToken::new();
        let ctx = HandlerContext::new("cmd-2", 1, cancel.clone(), Duration::from_secs(10));
        cancel.cancel();
        let err = CommandHandler::default()
            .execute(&ctx, &json!({"command": "sleep 5"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Timeout(_)));
    }

    #[test]
    fn test_truncate_long_output() {
        let long = vec![b'a'; MAX_OUTPUT + 10];
        let text = truncate(&long);
        assert!(text.contains("[truncated"));
    }
}
