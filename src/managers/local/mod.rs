use crate::constants::limits::{LOG_PREVIEW_BYTES, MAX_CAPTURE_BYTES};
use crate::constants::shell::FALLBACK_SHELL;
use crate::constants::timeouts::LOCAL_EXEC_MS;
use crate::errors::ExecError;
use crate::managers::terminal::{open_window, plan_launch};
use crate::managers::{Backend, Invocation};
use crate::services::intent::{ExecutionResult, ParsedIntent};
use crate::services::logger::Logger;
use crate::utils::feature_flags::{read_env_string, read_env_u64};
use crate::utils::redact::redact_text;
use crate::utils::process::run_captured;
use crate::utils::text::preview;
use std::path::PathBuf;
use std::time::Duration;

fn resolve_local_timeout_ms() -> u64 {
    read_env_u64("AGENTRUN_LOCAL_EXEC_TIMEOUT_MS", LOCAL_EXEC_MS)
}

fn resolve_user_shell() -> String {
    read_env_string("SHELL").unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

#[derive(Clone)]
pub struct LocalBackend {
    logger: Logger,
    shell: String,
    shell_args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
    max_capture: usize,
}

impl LocalBackend {
    pub fn new(logger: Logger, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            logger: logger.child("local"),
            shell: resolve_user_shell(),
            shell_args: vec!["-c".to_string()],
            working_dir: working_dir.into(),
            timeout: Duration::from_millis(resolve_local_timeout_ms()),
            max_capture: read_env_u64("AGENTRUN_MAX_CAPTURE_BYTES", MAX_CAPTURE_BYTES as u64) as usize,
        }
    }

    pub fn with_shell(mut self, shell: &str, args: &[&str]) -> Self {
        self.shell = shell.to_string();
        self.shell_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Runs to completion and captures output; no window.
    pub async fn run_captured(&self, invocation: &Invocation) -> Result<ExecutionResult, ExecError> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.args(&self.shell_args)
            .arg(&invocation.command)
            .current_dir(&self.working_dir)
            .envs(&invocation.env);
        self.logger.info(
            "local exec",
            Some(&serde_json::json!({
                "command": preview(&invocation.command, LOG_PREVIEW_BYTES),
                "env": invocation.env_names(),
            })),
        );
        let output = run_captured(cmd, &self.shell, self.timeout, self.max_capture).await?;
        let secrets = invocation.secret_values();
        let stdout = redact_text(&output.stdout, Some(secrets.as_slice()));
        let stderr = redact_text(&output.stderr, Some(secrets.as_slice()));

        let mut result = if output.success() {
            ExecutionResult::ok(stdout)
        } else {
            let message = if stderr.trim().is_empty() {
                format!("Command exited with status {}", output.exit_code)
            } else {
                stderr.clone()
            };
            ExecutionResult::failed(stdout, message)
        };
        result.insert("backend", "local");
        result.insert("exit_code", output.exit_code);
        result.insert("duration_ms", output.duration_ms as u64);
        if !stderr.is_empty() {
            result.insert("stderr", stderr);
        }
        Ok(result)
    }

    /// Opens a terminal window running the command and returns immediately.
    pub async fn open_in_window(&self, invocation: &Invocation) -> Result<ExecutionResult, ExecError> {
        let launch = plan_launch(&invocation.command, &self.shell, &self.working_dir)?;
        open_window(&launch, &invocation.env, &self.working_dir).await?;
        self.logger.info(
            "terminal opened",
            Some(&serde_json::json!({
                "terminal": launch.terminal,
                "command": preview(&invocation.command, LOG_PREVIEW_BYTES),
            })),
        );
        Ok(ExecutionResult::ok(format!("Opened {} window", launch.terminal))
            .with("backend", "local")
            .with("terminal", launch.terminal))
    }
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    async fn execute(
        &self,
        intent: &ParsedIntent,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        if intent.auto_close {
            self.run_captured(invocation).await
        } else {
            self.open_in_window(invocation).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LocalBackend;
    use crate::errors::ExecErrorKind;
    use crate::managers::{Backend, Invocation};
    use crate::services::intent::ParsedIntent;
    use crate::services::logger::{LogLevel, Logger};
    use std::time::Duration;

    fn backend() -> LocalBackend {
        LocalBackend::new(Logger::with_level("test", LogLevel::Error), std::env::temp_dir())
            .with_shell("/bin/sh", &["-c"])
    }

    fn captured(command: &str) -> ParsedIntent {
        let mut intent = ParsedIntent::local(command);
        intent.auto_close = true;
        intent
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let intent = captured("echo hello");
        let result = backend()
            .execute(&intent, &Invocation::shell("echo hello"))
            .await
            .expect("run");
        assert!(result.success);
        assert_eq!(result.output, "hello");
        assert_eq!(result.metadata["exit_code"], 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure_with_stderr() {
        let command = "echo partial; echo broken >&2; exit 4";
        let result = backend()
            .execute(&captured(command), &Invocation::shell(command))
            .await
            .expect("run");
        assert!(!result.success);
        assert_eq!(result.output, "partial");
        assert_eq!(result.error.as_deref(), Some("broken"));
        assert_eq!(result.metadata["exit_code"], 4);
    }

    #[tokio::test]
    async fn env_is_scoped_and_scrubbed_from_output() {
        let mut invocation = Invocation::shell("printf '%s' \"$AGENT_TOKEN\"");
        invocation
            .env
            .insert("AGENT_TOKEN".to_string(), "tok-1234567890".to_string());
        let result = backend()
            .execute(&captured(&invocation.command), &invocation)
            .await
            .expect("run");
        assert!(result.success);
        assert!(!result.output.contains("tok-1234567890"));
        assert!(std::env::var("AGENT_TOKEN").is_err());
    }

    #[tokio::test]
    async fn timeout_is_distinct() {
        let err = backend()
            .with_timeout(Duration::from_millis(100))
            .execute(&captured("sleep 5"), &Invocation::shell("sleep 5"))
            .await
            .expect_err("timeout");
        assert_eq!(err.kind, ExecErrorKind::Timeout);
    }
}
