use crate::errors::{ExecError, ExecErrorKind};
use crate::managers::docker::DockerBackend;
use crate::managers::local::LocalBackend;
use crate::managers::sandbox::SandboxBackend;
use crate::managers::ssh::SshBackend;
use crate::managers::{Backend, Invocation, ReferencedFile};
use crate::services::credentials::{credential_env_var, CredentialResolver};
use crate::services::hosts::HostRegistry;
use crate::services::intent::{BackendKind, ExecutionResult, ParsedIntent};
use crate::services::logger::Logger;
use crate::services::parser;
use crate::utils::file_refs::detect_referenced_files;
use std::path::PathBuf;
use std::sync::Arc;

/// Routes a parsed intent to its backend and folds failures into
/// `ExecutionResult` at the outer boundary.
#[derive(Clone)]
pub struct Dispatcher {
    logger: Logger,
    registry: HostRegistry,
    credentials: CredentialResolver,
    working_dir: PathBuf,
    local: Arc<dyn Backend>,
    docker: Arc<dyn Backend>,
    ssh: SshBackend,
    sandbox: Arc<dyn Backend>,
}

impl Dispatcher {
    pub fn new(
        logger: Logger,
        registry: HostRegistry,
        credentials: CredentialResolver,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = working_dir.into();
        let logger = logger.child("dispatch");
        Self {
            local: Arc::new(LocalBackend::new(logger.clone(), working_dir.clone())),
            docker: Arc::new(DockerBackend::new(logger.clone(), working_dir.clone())),
            ssh: SshBackend::new(logger.clone(), registry.clone(), credentials.clone()),
            sandbox: Arc::new(SandboxBackend::new(
                logger.clone(),
                credentials.clone(),
                working_dir.clone(),
            )),
            logger,
            registry,
            credentials,
            working_dir,
        }
    }

    pub fn with_local(mut self, backend: Arc<dyn Backend>) -> Self {
        self.local = backend;
        self
    }

    pub fn with_docker(mut self, backend: Arc<dyn Backend>) -> Self {
        self.docker = backend;
        self
    }

    pub fn with_sandbox(mut self, backend: Arc<dyn Backend>) -> Self {
        self.sandbox = backend;
        self
    }

    pub fn with_ssh(mut self, backend: SshBackend) -> Self {
        self.ssh = backend;
        self
    }

    pub fn ssh(&self) -> &SshBackend {
        &self.ssh
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn parse(&self, text: &str) -> ParsedIntent {
        parser::parse(text, &self.registry.list())
    }

    /// Backend for `intent`. An SSH intent naming an unregistered host is
    /// rejected, never downgraded to local.
    pub fn dispatch(&self, intent: &ParsedIntent) -> Result<&dyn Backend, ExecError> {
        Ok(match intent.backend {
            BackendKind::Local => self.local.as_ref(),
            BackendKind::Docker => self.docker.as_ref(),
            BackendKind::Sandbox => self.sandbox.as_ref(),
            BackendKind::Ssh => {
                let host = intent
                    .ssh_host
                    .as_deref()
                    .filter(|h| !h.trim().is_empty())
                    .ok_or_else(|| ExecError::unknown_host("SSH intent without a host name"))?;
                self.ssh.profile(host)?;
                &self.ssh
            }
        })
    }

    /// Final command and scoped environment. Agent prompts get their
    /// credential injected and, off the local machine, the files they name.
    pub fn prepare(&self, intent: &ParsedIntent) -> Result<Invocation, ExecError> {
        if intent.command.trim().is_empty() {
            return Err(ExecError::invalid_params("Nothing to run after parsing the command")
                .with_hint("Example: agentrun --auto-close on dgx nvidia-smi"));
        }
        let Some(agent) = intent.agent else {
            return Ok(Invocation::shell(intent.command.clone()));
        };

        // Only local and docker runs can open an interactive session in a window.
        let headless = intent.auto_close
            || matches!(intent.backend, BackendKind::Ssh | BackendKind::Sandbox);
        let mut invocation = Invocation {
            command: agent.build_command(&intent.command, headless),
            agent: Some(agent),
            prompt: Some(intent.command.clone()),
            ..Invocation::default()
        };
        match self.credentials.resolve(agent.credential_name()) {
            Ok(credential) => {
                invocation
                    .env
                    .insert(credential.env_var.clone(), credential.value().to_string());
            }
            // The local CLI may already be logged in on its own.
            Err(err) if intent.backend == BackendKind::Local && err.is_kind(ExecErrorKind::CredentialNotFound) => {
                self.logger.debug(
                    "no credential for local agent",
                    Some(&serde_json::json!({
                        "agent": agent,
                        "env_var": credential_env_var(agent.credential_name()),
                    })),
                );
            }
            Err(err) => return Err(err),
        }
        if intent.backend == BackendKind::Docker && !invocation.env.is_empty() {
            if let Some(login) = agent.login_prelude() {
                invocation.command = format!("{} && {}", login, invocation.command);
            }
        }
        if matches!(intent.backend, BackendKind::Ssh | BackendKind::Sandbox) {
            invocation.files = detect_referenced_files(&intent.command, &self.working_dir)
                .into_iter()
                .filter_map(|local| {
                    let base = self.working_dir.canonicalize().ok()?;
                    let relative = local.strip_prefix(&base).ok()?.to_string_lossy().to_string();
                    Some(ReferencedFile { local, relative })
                })
                .collect();
        }
        Ok(invocation)
    }

    pub async fn execute(&self, intent: &ParsedIntent) -> Result<ExecutionResult, ExecError> {
        let backend = self.dispatch(intent)?;
        let invocation = self.prepare(intent)?;
        self.logger.debug(
            "dispatching",
            Some(&serde_json::json!({
                "backend": intent.backend,
                "agent": intent.agent,
                "host": intent.ssh_host,
                "auto_close": intent.auto_close,
                "files": invocation.files.len(),
            })),
        );
        let mut result = backend.execute(intent, &invocation).await?;
        if let Some(agent) = intent.agent {
            result.insert("agent", agent.as_str());
        }
        Ok(result)
    }

    /// Parse and execute; every failure becomes a structured result.
    pub async fn run(&self, text: &str) -> ExecutionResult {
        let intent = self.parse(text);
        match self.execute(&intent).await {
            Ok(result) => result,
            Err(err) => {
                self.logger.warn(
                    "execution failed",
                    Some(&serde_json::json!({"backend": intent.backend, "code": err.code, "error": err.message})),
                );
                ExecutionResult::from_error(intent.backend, &err)
            }
        }
    }

    pub fn shutdown(&self) -> usize {
        self.ssh.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::errors::ExecErrorKind;
    use crate::services::credentials::{CredentialResolver, NoKeychain};
    use crate::services::hosts::{HostRegistry, SshHostProfile};
    use crate::services::intent::{Agent, BackendKind, ParsedIntent};
    use crate::services::logger::{LogLevel, Logger};
    use std::sync::Arc;

    fn scratch() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("agentrun-dispatch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn dispatcher(dir: &std::path::Path, env: &'static [(&'static str, &'static str)]) -> Dispatcher {
        let logger = Logger::with_level("test", LogLevel::Error);
        let registry = HostRegistry::with_path(logger.clone(), dir.join("hosts.yaml"));
        let credentials = CredentialResolver::new(logger.clone(), dir)
            .with_home(dir)
            .with_keychain(Arc::new(NoKeychain))
            .with_env(move |key| {
                env.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            });
        Dispatcher::new(logger, registry, credentials, dir)
    }

    #[test]
    fn unknown_ssh_host_is_rejected() {
        let dir = scratch();
        let d = dispatcher(&dir, &[]);
        let intent = ParsedIntent {
            backend: BackendKind::Ssh,
            agent: None,
            ssh_host: Some("ghost".to_string()),
            auto_close: true,
            command: "ls".to_string(),
        };
        let err = d.dispatch(&intent).err().expect("rejected");
        assert_eq!(err.kind, ExecErrorKind::UnknownHost);

        d.registry()
            .add(SshHostProfile::new("ghost", "10.0.0.9"))
            .expect("add");
        assert!(d.dispatch(&intent).is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn agent_credentials_are_injected_as_env() {
        let dir = scratch();
        std::fs::write(dir.join("notes.md"), "# notes").expect("write");
        let d = dispatcher(&dir, &[("GEMINI_API_KEY", "AIzaRealLookingKey123")]);
        let intent = d.parse("use gemini in sandbox to summarize notes.md");
        let invocation = d.prepare(&intent).expect("prepared");
        assert_eq!(invocation.agent, Some(Agent::Gemini));
        assert_eq!(invocation.command, "gemini -y -p 'summarize notes.md'");
        assert_eq!(
            invocation.env.get("GEMINI_API_KEY").map(String::as_str),
            Some("AIzaRealLookingKey123")
        );
        assert_eq!(invocation.files.len(), 1);
        assert_eq!(invocation.files[0].relative, "notes.md");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn window_runs_are_interactive_and_docker_codex_logs_in() {
        let dir = scratch();
        let d = dispatcher(&dir, &[("OPENAI_API_KEY", "sk-proj-abcdefghijkl")]);
        let window = d.prepare(&d.parse("use codex to tidy the readme")).expect("local");
        assert_eq!(window.command, "codex 'tidy the readme'");

        let docker = d
            .prepare(&d.parse("--auto-close use codex in docker to tidy the readme"))
            .expect("docker");
        assert_eq!(
            docker.command,
            "printenv OPENAI_API_KEY | codex login --with-api-key >/dev/null 2>&1 && \
             codex exec --full-auto --sandbox danger-full-access --skip-git-repo-check 'tidy the readme'"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn remote_agent_without_credential_fails() {
        let dir = scratch();
        let d = dispatcher(&dir, &[]);
        let intent = d.parse("use claude in docker to review main.rs");
        let err = d.prepare(&intent).err().expect("missing credential");
        assert_eq!(err.kind, ExecErrorKind::CredentialNotFound);

        let local = d.parse("use claude to review main.rs");
        let invocation = d.prepare(&local).expect("local agent runs without injection");
        assert!(invocation.env.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn run_folds_errors_into_results() {
        let dir = scratch();
        let d = dispatcher(&dir, &[]);
        assert_eq!(d.parse("ssh to dgx: ls").backend, BackendKind::Local);

        let intent = ParsedIntent {
            backend: BackendKind::Ssh,
            agent: None,
            ssh_host: Some("dgx".to_string()),
            auto_close: true,
            command: "ls".to_string(),
        };
        let err = d.execute(&intent).await.expect_err("unknown host");
        assert_eq!(err.code, "UNKNOWN_HOST");

        let empty = d.run("--auto-close").await;
        assert!(!empty.success);
        assert_eq!(empty.metadata["error_code"], "INVALID_PARAMS");
        let _ = std::fs::remove_dir_all(dir);
    }
}
