mod client;

pub use client::HttpSandboxClient;

use crate::constants::limits::LOG_PREVIEW_BYTES;
use crate::constants::sandbox::{
    DEFAULT_DOMAIN, LOCAL_OUTPUT_DIR, OUTPUT_LIST_DEPTH, REMOTE_OUTPUT_DIR, REMOTE_WORKDIR,
};
use crate::constants::timeouts::{SANDBOX_COMMAND_SECS, SANDBOX_INSTALL_SECS, SANDBOX_LIFETIME_SECS};
use crate::errors::ExecError;
use crate::managers::{Backend, Invocation};
use crate::services::credentials::CredentialResolver;
use crate::services::intent::{ExecutionResult, ParsedIntent};
use crate::services::logger::Logger;
use crate::utils::feature_flags::{read_env_string, read_env_u64};
use crate::utils::redact::redact_text;
use crate::utils::shell::escape_shell_value;
use crate::utils::text::preview;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxCommandOutput {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxEntry {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
}

#[async_trait::async_trait]
pub trait SandboxClient: Send + Sync {
    async fn create(&self, template: Option<&str>, timeout_secs: u64) -> Result<String, ExecError>;
    async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout_secs: u64,
    ) -> Result<SandboxCommandOutput, ExecError>;
    async fn write_file(&self, sandbox_id: &str, path: &str, bytes: Vec<u8>) -> Result<(), ExecError>;
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, ExecError>;
    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<SandboxEntry>, ExecError>;
    async fn kill(&self, sandbox_id: &str) -> Result<(), ExecError>;
}

/// Relative path of `entry` under `root`, or `None` when it escapes it.
fn relative_output_path(root: &str, entry: &str) -> Option<PathBuf> {
    let root = root.trim_end_matches('/');
    let rest = entry.strip_prefix(root)?.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let rel = PathBuf::from(rest);
    if rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(rel)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct SandboxBackend {
    logger: Logger,
    credentials: CredentialResolver,
    working_dir: PathBuf,
    api_url: String,
    domain: String,
    template: Option<String>,
    lifetime_secs: u64,
    client_override: Option<Arc<dyn SandboxClient>>,
}

impl SandboxBackend {
    pub fn new(logger: Logger, credentials: CredentialResolver, working_dir: impl Into<PathBuf>) -> Self {
        let domain = read_env_string("AGENTRUN_SANDBOX_DOMAIN")
            .or_else(|| read_env_string("E2B_DOMAIN"))
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        Self {
            logger: logger.child("sandbox"),
            credentials,
            working_dir: working_dir.into(),
            api_url: read_env_string("AGENTRUN_SANDBOX_URL")
                .unwrap_or_else(|| format!("https://api.{}", domain)),
            domain,
            template: read_env_string("AGENTRUN_SANDBOX_TEMPLATE"),
            lifetime_secs: read_env_u64("AGENTRUN_SANDBOX_TIMEOUT_SECS", SANDBOX_LIFETIME_SECS),
            client_override: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn SandboxClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.template = template;
        self
    }

    fn client(&self) -> Result<Arc<dyn SandboxClient>, ExecError> {
        if let Some(client) = self.client_override.as_ref() {
            return Ok(client.clone());
        }
        let credential = self.credentials.resolve("e2b")?;
        Ok(Arc::new(HttpSandboxClient::new(
            &self.api_url,
            &self.domain,
            credential.value().to_string(),
        )?))
    }

    async fn upload_files(
        &self,
        client: &dyn SandboxClient,
        sandbox_id: &str,
        invocation: &Invocation,
    ) -> Result<Vec<String>, ExecError> {
        let mut uploaded = Vec::new();
        for file in &invocation.files {
            let bytes = tokio::fs::read(&file.local).await.map_err(|err| {
                ExecError::invalid_params(format!("Cannot read {}: {}", file.local.display(), err))
            })?;
            let remote = format!("{}/{}", REMOTE_WORKDIR, file.relative);
            client.write_file(sandbox_id, &remote, bytes).await?;
            uploaded.push(remote);
        }
        Ok(uploaded)
    }

    /// Walks the sandbox output directory a few levels deep.
    async fn output_files(&self, client: &dyn SandboxClient, sandbox_id: &str) -> Vec<String> {
        let mut files = Vec::new();
        let mut pending = vec![(REMOTE_OUTPUT_DIR.to_string(), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            let entries = match client.list_dir(sandbox_id, &dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    self.logger.debug(
                        "no sandbox output listing",
                        Some(&serde_json::json!({"sandbox_id": sandbox_id, "dir": dir, "error": err.message})),
                    );
                    continue;
                }
            };
            for entry in entries {
                if !entry.is_dir {
                    files.push(entry.path);
                } else if depth + 1 < OUTPUT_LIST_DEPTH
                    && relative_output_path(REMOTE_OUTPUT_DIR, &entry.path).is_some()
                {
                    pending.push((entry.path, depth + 1));
                }
            }
        }
        files
    }

    /// Copies the sandbox output directory into `./sandbox_output/<id>/`.
    /// Individual failures are logged and skipped.
    async fn download_outputs(
        &self,
        client: &dyn SandboxClient,
        sandbox_id: &str,
    ) -> Result<Vec<String>, ExecError> {
        let target_root = output_dir_for(&self.working_dir, sandbox_id)?;
        let mut saved = Vec::new();
        for path in self.output_files(client, sandbox_id).await {
            let Some(rel) = relative_output_path(REMOTE_OUTPUT_DIR, &path) else {
                self.logger.warn(
                    "skipping sandbox output outside the output dir",
                    Some(&serde_json::json!({"path": path})),
                );
                continue;
            };
            let bytes = match client.read_file(sandbox_id, &path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.logger.warn(
                        "sandbox output download failed",
                        Some(&serde_json::json!({"path": path, "error": err.message})),
                    );
                    continue;
                }
            };
            let target = target_root.join(&rel);
            let written = match target.parent() {
                Some(parent) => tokio::fs::create_dir_all(parent).await,
                None => Ok(()),
            };
            match written {
                Ok(()) => match tokio::fs::write(&target, bytes).await {
                    Ok(()) => saved.push(target.display().to_string()),
                    Err(err) => self.logger.warn(
                        "cannot save sandbox output",
                        Some(&serde_json::json!({"path": target, "error": err.to_string()})),
                    ),
                },
                Err(err) => self.logger.warn(
                    "cannot create output directory",
                    Some(&serde_json::json!({"path": target, "error": err.to_string()})),
                ),
            }
        }
        Ok(saved)
    }

    async fn run_in(
        &self,
        client: &dyn SandboxClient,
        sandbox_id: &str,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        if let (None, Some(agent)) = (self.template.as_ref(), invocation.agent) {
            self.logger.info(
                "installing agent cli",
                Some(&serde_json::json!({"sandbox_id": sandbox_id, "agent": agent})),
            );
            let install = client
                .run(sandbox_id, &agent.install_command(), &BTreeMap::new(), SANDBOX_INSTALL_SECS)
                .await?;
            if install.exit_code != 0 {
                return Err(ExecError::backend_unavailable(format!(
                    "Installing {} in the sandbox failed",
                    agent
                ))
                .with_details(serde_json::json!({"stderr": preview(&install.stderr, LOG_PREVIEW_BYTES * 4)})));
            }
        }

        let uploaded = self.upload_files(client, sandbox_id, invocation).await?;
        let script = format!(
            "mkdir -p {} && cd {} && {}",
            escape_shell_value(REMOTE_OUTPUT_DIR),
            escape_shell_value(REMOTE_WORKDIR),
            invocation.command
        );
        self.logger.info(
            "sandbox exec",
            Some(&serde_json::json!({
                "sandbox_id": sandbox_id,
                "command": preview(&invocation.command, LOG_PREVIEW_BYTES),
                "env": invocation.env_names(),
            })),
        );
        let output = client
            .run(sandbox_id, &script, &invocation.env, SANDBOX_COMMAND_SECS)
            .await?;
        let downloaded = self.download_outputs(client, sandbox_id).await?;

        let secrets = invocation.secret_values();
        let stdout = redact_text(&output.stdout, Some(secrets.as_slice()));
        let stderr = redact_text(&output.stderr, Some(secrets.as_slice()));
        let mut result =
            ExecutionResult::from_exit(output.exit_code, stdout, stderr, "Sandbox command", false);
        result.insert("uploaded_files", uploaded);
        result.insert("downloaded_files", downloaded);
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Backend for SandboxBackend {
    async fn execute(
        &self,
        intent: &ParsedIntent,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        let client = self.client()?;
        let sandbox_id = client
            .create(self.template.as_deref(), self.lifetime_secs)
            .await?;
        if let Err(err) = validate_sandbox_id(&sandbox_id) {
            let _ = client.kill(&sandbox_id).await;
            return Err(err);
        }
        self.logger.info(
            "sandbox created",
            Some(&serde_json::json!({"sandbox_id": sandbox_id, "template": self.template})),
        );
        let outcome = self.run_in(client.as_ref(), &sandbox_id, invocation).await;
        if intent.auto_close {
            if let Err(err) = client.kill(&sandbox_id).await {
                self.logger.warn(
                    "sandbox kill failed",
                    Some(&serde_json::json!({"sandbox_id": sandbox_id, "error": err.message})),
                );
            }
        }
        let result = outcome?;
        Ok(result
            .with("backend", "sandbox")
            .with("sandbox_id", sandbox_id)
            .with("kept_alive", !intent.auto_close))
    }
}

/// Sandbox ids become a local directory name, so only `[A-Za-z0-9_-]` is
/// accepted.
pub fn validate_sandbox_id(sandbox_id: &str) -> Result<(), ExecError> {
    let valid = !sandbox_id.is_empty()
        && sandbox_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ExecError::backend_unavailable(format!(
            "Sandbox service returned an unusable id {:?}",
            preview(sandbox_id, LOG_PREVIEW_BYTES)
        )))
    }
}

pub fn output_dir_for(working_dir: &Path, sandbox_id: &str) -> Result<PathBuf, ExecError> {
    validate_sandbox_id(sandbox_id)?;
    Ok(working_dir.join(LOCAL_OUTPUT_DIR).join(sandbox_id))
}

#[cfg(test)]
mod tests {
    use super::{output_dir_for, relative_output_path};
    use std::path::{Path, PathBuf};

    #[test]
    fn output_dir_rejects_unsafe_sandbox_ids() {
        let root = Path::new("/work");
        assert_eq!(
            output_dir_for(root, "ix1d2k-Ab_9").expect("valid"),
            PathBuf::from("/work/sandbox_output/ix1d2k-Ab_9")
        );
        for bad in ["", "..", "../escape", "a/b", "id with space", "/abs", "id.1"] {
            assert!(output_dir_for(root, bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn output_paths_stay_under_root() {
        assert_eq!(
            relative_output_path("/home/user/output", "/home/user/output/report.md"),
            Some(PathBuf::from("report.md"))
        );
        assert_eq!(
            relative_output_path("/home/user/output/", "/home/user/output/a/b.txt"),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(relative_output_path("/home/user/output", "/etc/passwd"), None);
        assert_eq!(relative_output_path("/home/user/output", "/home/user/outputs/x"), None);
        assert_eq!(
            relative_output_path("/home/user/output", "/home/user/output/../x"),
            None
        );
    }
}
