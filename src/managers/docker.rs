use crate::constants::docker::{DEFAULT_IMAGE, WORKSPACE_MOUNT};
use crate::constants::limits::{LOG_PREVIEW_BYTES, MAX_CAPTURE_BYTES};
use crate::constants::timeouts::{DOCKER_BUILD_MS, DOCKER_EXEC_MS, DOCKER_PROBE_MS};
use crate::errors::ExecError;
use crate::managers::terminal::{open_window, plan_launch};
use crate::managers::{Backend, Invocation};
use crate::services::intent::{ExecutionResult, ParsedIntent};
use crate::services::logger::Logger;
use crate::utils::feature_flags::{is_truthy_any_env, read_env_string, read_env_u64};
use crate::utils::paths::resolve_docker_build_context;
use crate::utils::process::{run_captured, CapturedOutput};
use crate::utils::redact::redact_text;
use crate::utils::shell::escape_shell_value;
use crate::utils::text::preview;
use std::path::PathBuf;
use std::time::Duration;

fn random_token() -> String {
    use rand::{distributions::Alphanumeric, Rng};
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase()
}

/// Redacted result of an attached `docker run`. Agents often exit non-zero
/// after printing a usable answer, so stdout makes it a soft success.
pub fn container_result(output: &CapturedOutput, secrets: &[String]) -> ExecutionResult {
    let stdout = redact_text(&output.stdout, Some(secrets));
    let stderr = redact_text(&output.stderr, Some(secrets));
    ExecutionResult::from_exit(output.exit_code, stdout, stderr, "Container", true)
        .with("duration_ms", output.duration_ms as u64)
}

fn docker(args: &[String]) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(args);
    cmd
}

#[derive(Clone)]
pub struct DockerBackend {
    logger: Logger,
    image: String,
    build_context: Option<PathBuf>,
    working_dir: PathBuf,
    build_timeout: Duration,
    exec_timeout: Duration,
    max_capture: usize,
    gpus: bool,
}

impl DockerBackend {
    pub fn new(logger: Logger, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            logger: logger.child("docker"),
            image: read_env_string("AGENTRUN_DOCKER_IMAGE").unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            build_context: resolve_docker_build_context(),
            working_dir: working_dir.into(),
            build_timeout: Duration::from_millis(read_env_u64(
                "AGENTRUN_DOCKER_BUILD_TIMEOUT_MS",
                DOCKER_BUILD_MS,
            )),
            exec_timeout: Duration::from_millis(DOCKER_EXEC_MS),
            max_capture: read_env_u64("AGENTRUN_MAX_CAPTURE_BYTES", MAX_CAPTURE_BYTES as u64) as usize,
            gpus: is_truthy_any_env(&["AGENTRUN_DOCKER_GPUS"]),
        }
    }

    /// Passes every host GPU through with `--gpus all`.
    pub fn with_gpus(mut self, gpus: bool) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    async fn ensure_daemon(&self) -> Result<(), ExecError> {
        let probe = run_captured(
            docker(&["info".to_string(), "--format".to_string(), "{{.ServerVersion}}".to_string()]),
            "docker",
            Duration::from_millis(DOCKER_PROBE_MS),
            4096,
        )
        .await
        .map_err(|err| {
            if err.is_kind(crate::errors::ExecErrorKind::Timeout) {
                ExecError::backend_unavailable("Docker daemon did not answer in time")
            } else {
                err
            }
        })?;
        if !probe.success() {
            return Err(ExecError::backend_unavailable("Docker daemon is not running")
                .with_hint("Start Docker Desktop or the docker service, then retry.")
                .with_details(serde_json::json!({"stderr": preview(&probe.stderr, LOG_PREVIEW_BYTES)})));
        }
        Ok(())
    }

    /// Image present, or built from the configured context.
    async fn ensure_image(&self) -> Result<(), ExecError> {
        let inspect = run_captured(
            docker(&["image".to_string(), "inspect".to_string(), self.image.clone()]),
            "docker",
            Duration::from_millis(DOCKER_PROBE_MS),
            4096,
        )
        .await?;
        if inspect.success() {
            return Ok(());
        }
        let Some(context) = self.build_context.as_ref().filter(|p| p.is_dir()) else {
            return Err(ExecError::backend_unavailable(format!(
                "Docker image {} is not available",
                self.image
            ))
            .with_hint("Set AGENTRUN_DOCKER_BUILD_CONTEXT to a directory with a Dockerfile, or pull the image."));
        };
        self.logger.info(
            "building image",
            Some(&serde_json::json!({"image": self.image, "context": context})),
        );
        let build = run_captured(
            docker(&[
                "build".to_string(),
                "-t".to_string(),
                self.image.clone(),
                context.to_string_lossy().to_string(),
            ]),
            "docker build",
            self.build_timeout,
            self.max_capture,
        )
        .await?;
        if !build.success() {
            return Err(ExecError::backend_unavailable(format!(
                "docker build for {} failed",
                self.image
            ))
            .with_details(serde_json::json!({"stderr": preview(&build.stderr, LOG_PREVIEW_BYTES * 4)})));
        }
        Ok(())
    }

    /// `docker run` arguments. Credentials are named with `-e NAME` only; the
    /// values travel in the docker client's environment.
    pub fn run_args(&self, invocation: &Invocation, container: &str, interactive: bool) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            if interactive { "-it" } else { "-i" }.to_string(),
            "--name".to_string(),
            container.to_string(),
            "-v".to_string(),
            format!("{}:{}", self.working_dir.display(), WORKSPACE_MOUNT),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
        ];
        if self.gpus {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        for name in invocation.env.keys() {
            args.push("-e".to_string());
            args.push(name.clone());
        }
        args.extend([
            self.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            invocation.command.clone(),
        ]);
        args
    }

    async fn run_attached(
        &self,
        invocation: &Invocation,
        container: &str,
    ) -> Result<ExecutionResult, ExecError> {
        let mut cmd = docker(&self.run_args(invocation, container, false));
        cmd.envs(&invocation.env);
        let output = run_captured(cmd, "docker run", self.exec_timeout, self.max_capture).await?;
        Ok(container_result(&output, &invocation.secret_values()))
    }

    async fn run_in_window(
        &self,
        invocation: &Invocation,
        container: &str,
    ) -> Result<ExecutionResult, ExecError> {
        let command = std::iter::once("docker".to_string())
            .chain(self.run_args(invocation, container, true))
            .map(|arg| escape_shell_value(&arg))
            .collect::<Vec<_>>()
            .join(" ");
        let launch = plan_launch(&command, "sh", &self.working_dir)?;
        open_window(&launch, &invocation.env, &self.working_dir).await?;
        Ok(ExecutionResult::ok(format!(
            "Opened {} window attached to container {}",
            launch.terminal, container
        ))
        .with("terminal", launch.terminal))
    }
}

#[async_trait::async_trait]
impl Backend for DockerBackend {
    async fn execute(
        &self,
        intent: &ParsedIntent,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        self.ensure_daemon().await?;
        self.ensure_image().await?;
        let container = format!("agentrun-{}", random_token());
        self.logger.info(
            "docker run",
            Some(&serde_json::json!({
                "container": container,
                "image": self.image,
                "command": preview(&invocation.command, LOG_PREVIEW_BYTES),
                "env": invocation.env_names(),
            })),
        );
        let result = if intent.auto_close {
            self.run_attached(invocation, &container).await?
        } else {
            self.run_in_window(invocation, &container).await?
        };
        Ok(result
            .with("backend", "docker")
            .with("container_name", container)
            .with("image", self.image.as_str())
            .with("gpus", self.gpus))
    }
}

#[cfg(test)]
mod tests {
    use super::{container_result, DockerBackend};
    use crate::managers::Invocation;
    use crate::services::logger::{LogLevel, Logger};
    use crate::utils::process::CapturedOutput;

    #[test]
    fn run_args_never_carry_secret_values() {
        let backend = DockerBackend::new(Logger::with_level("test", LogLevel::Error), "/work");
        let mut invocation = Invocation::shell("claude -p 'hi'");
        invocation
            .env
            .insert("ANTHROPIC_API_KEY".to_string(), "sk-ant-secret-value".to_string());
        let args = backend.run_args(&invocation, "agentrun-test", false);
        assert!(args.iter().all(|a| !a.contains("sk-ant-secret-value")));
        let e = args.iter().position(|a| a == "-e").expect("-e flag");
        assert_eq!(args[e + 1], "ANTHROPIC_API_KEY");
        assert!(args.contains(&"/work:/workspace".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("claude -p 'hi'"));
        assert_eq!(args[2], "-i");
    }

    #[test]
    fn gpu_passthrough_is_opt_in() {
        let backend = DockerBackend::new(Logger::with_level("test", LogLevel::Error), "/work");
        let invocation = Invocation::shell("nvidia-smi");
        let plain = backend.clone().with_gpus(false).run_args(&invocation, "c", false);
        assert!(!plain.contains(&"--gpus".to_string()));
        let args = backend.with_gpus(true).run_args(&invocation, "c", false);
        let at = args.iter().position(|a| a == "--gpus").expect("--gpus");
        assert_eq!(args[at + 1], "all");
        assert_eq!(args.last().map(String::as_str), Some("nvidia-smi"));
    }

    #[test]
    fn container_output_counts_as_soft_success() {
        let secrets = vec!["sk-ant-secret-value".to_string()];
        let answered = CapturedOutput {
            exit_code: 1,
            stdout: "done, key sk-ant-secret-value".to_string(),
            stderr: "telemetry failed".to_string(),
            duration_ms: 10,
        };
        let result = container_result(&answered, &secrets);
        assert!(result.success);
        assert_eq!(result.metadata["soft_success"], true);
        assert_eq!(result.metadata["exit_code"], 1);
        assert!(!result.output.contains("sk-ant-secret-value"));

        let crashed = CapturedOutput {
            exit_code: 137,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
        };
        let result = container_result(&crashed, &secrets);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Container exited with status 137"));
    }
}
