mod exec;
pub mod gpu;
pub mod pool;
pub mod session;
pub mod transfer;

pub use exec::RemoteOutput;
pub use gpu::GpuInfo;
pub use pool::{ConnectionPool, PooledTransport};
pub use transfer::{TransferOutcome, TransferRoute};

use crate::constants::limits::{LOG_PREVIEW_BYTES, MAX_CAPTURE_BYTES};
use crate::constants::network::{TIMEOUT_GPU_PROBE_MS, TIMEOUT_SSH_EXEC_DEFAULT_MS, TIMEOUT_SSH_READY_MS};
use crate::constants::shell::DEFAULT_REMOTE_PATH;
use crate::constants::transfer::DEFAULT_REMOTE_DIR;
use crate::errors::ExecError;
use crate::managers::{Backend, Invocation};
use crate::services::credentials::{key_requires_passphrase, CredentialResolver};
use crate::services::hosts::{HostRegistry, SshHostProfile};
use crate::services::intent::{ExecutionResult, ParsedIntent};
use crate::services::logger::Logger;
use crate::utils::feature_flags::read_env_u64;
use crate::utils::file_refs::validate_source_path;
use crate::utils::paths::resolve_known_hosts_path;
use crate::utils::shell::{escape_shell_value, export_statement};
use crate::utils::text::preview;
use session::{connect_session, ConnectSpec};
use ssh2::Session;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maps a finished remote command to a result. A timeout is an error; a
/// non-zero exit that still wrote to stdout is a soft success.
pub fn remote_result(
    profile: &SshHostProfile,
    output: &RemoteOutput,
    timeout: Duration,
) -> Result<ExecutionResult, ExecError> {
    if output.timed_out {
        return Err(ExecError::timeout(format!(
            "Command on {} exceeded {}ms",
            profile.name,
            timeout.as_millis()
        ))
        .with_details(serde_json::json!({
            "stdout": preview(&output.stdout, LOG_PREVIEW_BYTES * 4),
            "duration_ms": output.duration_ms as u64,
        })));
    }
    let mut result = ExecutionResult::from_exit(
        output.exit_code,
        output.stdout.clone(),
        output.stderr.clone(),
        "Remote command",
        true,
    );
    result.insert("backend", "ssh");
    result.insert("host", profile.name.as_str());
    result.insert("target", profile.connection_key());
    result.insert("duration_ms", output.duration_ms as u64);
    if output.stdout_truncated || output.stderr_truncated {
        result.insert("truncated", true);
    }
    Ok(result)
}

fn resolve_exec_timeout_ms() -> u64 {
    read_env_u64("AGENTRUN_SSH_EXEC_TIMEOUT_MS", TIMEOUT_SSH_EXEC_DEFAULT_MS)
}

fn resolve_max_capture_bytes() -> usize {
    read_env_u64("AGENTRUN_MAX_CAPTURE_BYTES", MAX_CAPTURE_BYTES as u64) as usize
}

/// Shell prelude + command for a remote host: PATH defaults, CUDA paths,
/// profile environment, then invocation environment (which wins).
pub fn build_remote_command(
    profile: &SshHostProfile,
    env: &BTreeMap<String, String>,
    command: &str,
    workdir: Option<&str>,
) -> String {
    let mut lines = vec![format!("export PATH={}:$PATH", DEFAULT_REMOTE_PATH)];
    if let Some(cuda) = profile.cuda_path.as_deref().map(|p| p.trim_end_matches('/')) {
        if !cuda.is_empty() {
            let quoted = escape_shell_value(cuda);
            lines.push(format!("export PATH={}/bin:$PATH", quoted));
            lines.push(format!(
                "export LD_LIBRARY_PATH={}/lib64${{LD_LIBRARY_PATH:+:$LD_LIBRARY_PATH}}",
                quoted
            ));
        }
    }
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, value) in &profile.environment {
        merged.insert(key, value);
    }
    for (key, value) in env {
        merged.insert(key, value);
    }
    lines.extend(
        merged
            .into_iter()
            .filter_map(|(key, value)| export_statement(key, value)),
    );
    if let Some(dir) = workdir {
        lines.push(format!("cd {}", escape_shell_value(dir)));
    }
    lines.push(command.to_string());
    lines.join("\n")
}

type SharedPool = Arc<Mutex<ConnectionPool<Session>>>;

#[derive(Clone)]
pub struct SshBackend {
    logger: Logger,
    registry: HostRegistry,
    credentials: CredentialResolver,
    pool: SharedPool,
    known_hosts: PathBuf,
    explicit_key: Option<PathBuf>,
    exec_timeout: Duration,
    max_capture: usize,
}

impl SshBackend {
    pub fn new(logger: Logger, registry: HostRegistry, credentials: CredentialResolver) -> Self {
        let logger = logger.child("ssh");
        Self {
            pool: Arc::new(Mutex::new(ConnectionPool::new(logger.clone()))),
            logger,
            registry,
            credentials,
            known_hosts: resolve_known_hosts_path(),
            explicit_key: None,
            exec_timeout: Duration::from_millis(resolve_exec_timeout_ms()),
            max_capture: resolve_max_capture_bytes(),
        }
    }

    pub fn with_key(mut self, key: Option<PathBuf>) -> Self {
        self.explicit_key = key;
        self
    }

    pub fn profile(&self, host: &str) -> Result<SshHostProfile, ExecError> {
        self.registry.get(host).ok_or_else(|| {
            ExecError::unknown_host(format!("SSH host '{}' is not registered", host))
                .with_hint("Add it with: agentrun hosts add <name> --hostname <address>")
                .with_details(serde_json::json!({"host": host, "known": self.registry.list()}))
        })
    }

    fn connect_spec(&self, profile: &SshHostProfile) -> Result<ConnectSpec, ExecError> {
        let (key_path, source) = self
            .credentials
            .resolve_ssh_key(self.explicit_key.as_deref(), Some(profile))?;
        let passphrase = if key_requires_passphrase(&key_path) {
            let found = self.credentials.resolve_ssh_passphrase(&key_path);
            if found.is_none() {
                return Err(ExecError::connection(format!(
                    "SSH key {} is passphrase-protected and no passphrase was found",
                    key_path.display()
                ))
                .with_hint("Export AGENTRUN_SSH_PASSPHRASE or use an unencrypted deploy key."));
            }
            found
        } else {
            None
        };
        self.logger.debug(
            "ssh key selected",
            Some(&serde_json::json!({"host": profile.name, "source": source})),
        );
        Ok(ConnectSpec::for_profile(
            profile,
            key_path,
            passphrase,
            self.known_hosts.clone(),
            Duration::from_millis(TIMEOUT_SSH_READY_MS),
        ))
    }

    /// Runs `work` on a pooled session inside the blocking pool.
    async fn with_session<F, T>(&self, profile: &SshHostProfile, work: F) -> Result<T, ExecError>
    where
        F: FnOnce(&Session) -> Result<T, ExecError> + Send + 'static,
        T: Send + 'static,
    {
        let spec = self.connect_spec(profile)?;
        let key = profile.connection_key();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let session = {
                let mut guard = pool.lock().unwrap_or_else(|e| e.into_inner());
                guard.acquire(&key, || connect_session(&spec))?
            };
            work(&session)
        })
        .await
        .map_err(|err| ExecError::internal(format!("SSH worker failed: {}", err)))?
    }

    /// GPU inventory; every failure degrades to an empty list.
    async fn gpu_inventory(&self, profile: &SshHostProfile) -> Vec<GpuInfo> {
        let command = build_remote_command(profile, &BTreeMap::new(), gpu::GPU_QUERY_COMMAND, None);
        let probe = self
            .with_session(profile, move |session| {
                exec::exec_blocking(
                    session,
                    &command,
                    Duration::from_millis(TIMEOUT_GPU_PROBE_MS),
                    64 * 1024,
                    None,
                )
            })
            .await;
        match probe {
            Ok(output) if output.exit_code == 0 => gpu::parse_gpu_csv(&output.stdout),
            Ok(output) => {
                self.logger.warn(
                    "gpu query failed",
                    Some(&serde_json::json!({
                        "host": profile.name,
                        "exit_code": output.exit_code,
                        "stderr": preview(&output.stderr, LOG_PREVIEW_BYTES),
                    })),
                );
                Vec::new()
            }
            Err(err) => {
                self.logger.warn(
                    "gpu query failed",
                    Some(&serde_json::json!({"host": profile.name, "error": err.message})),
                );
                Vec::new()
            }
        }
    }

    pub async fn run(
        &self,
        host: &str,
        invocation: &Invocation,
        auto_close: bool,
    ) -> Result<ExecutionResult, ExecError> {
        let profile = self.profile(host)?;
        let result = self.run_on(&profile, invocation).await;
        if auto_close {
            self.close(&profile);
        }
        result
    }

    async fn run_on(
        &self,
        profile: &SshHostProfile,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        let mut uploads = Vec::new();
        let mut workdir = None;
        if !invocation.files.is_empty() {
            let remote_dir = format!(
                "{}/{}",
                DEFAULT_REMOTE_DIR,
                &uuid::Uuid::new_v4().simple().to_string()[..12]
            );
            for file in &invocation.files {
                let sub = Path::new(&file.relative)
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .filter(|p| !p.is_empty());
                let target_dir = match sub.as_deref() {
                    Some(sub) => transfer::join_remote(&remote_dir, sub),
                    None => remote_dir.clone(),
                };
                let outcome = self
                    .upload_to(profile, &file.local, Some(&target_dir), false)
                    .await?;
                uploads.push(outcome);
            }
            workdir = Some(remote_dir);
        }

        let command =
            build_remote_command(profile, &invocation.env, &invocation.command, workdir.as_deref());
        let secrets = invocation.secret_values();
        let timeout = self.exec_timeout;
        let max_capture = self.max_capture;
        self.logger.info(
            "ssh exec",
            Some(&serde_json::json!({
                "host": profile.name,
                "command": preview(&invocation.command, LOG_PREVIEW_BYTES),
                "env": invocation.env_names(),
            })),
        );
        let output = self
            .with_session(profile, move |session| {
                exec::exec_blocking(session, &command, timeout, max_capture, Some(secrets.as_slice()))
            })
            .await?;

        let mut result = remote_result(profile, &output, timeout)?;
        if profile.gpu_enabled {
            let gpus = self.gpu_inventory(profile).await;
            result.insert("gpus", serde_json::to_value(&gpus).unwrap_or_default());
        }
        if !uploads.is_empty() {
            result.insert("uploaded_files", serde_json::to_value(&uploads).unwrap_or_default());
        }
        if let Some(dir) = workdir {
            result.insert("remote_workdir", dir);
        }
        Ok(result)
    }

    async fn upload_to(
        &self,
        profile: &SshHostProfile,
        local: &Path,
        remote_dir: Option<&str>,
        allow_share: bool,
    ) -> Result<TransferOutcome, ExecError> {
        let local = validate_source_path(local)?;
        let route = if allow_share {
            transfer::select_route(profile)
        } else {
            TransferRoute::Sftp
        };
        let outcome = match (route, profile.share.as_ref()) {
            (TransferRoute::SharedMount, Some(share)) => {
                // Absolute remote dirs only apply to SFTP; relative ones nest under the share.
                transfer::copy_to_share(share, &local, remote_dir.filter(|d| !d.starts_with('/')))?
            }
            _ => {
                let dir = remote_dir.unwrap_or(DEFAULT_REMOTE_DIR).to_string();
                self.with_session(profile, move |session| {
                    transfer::sftp_upload(session, &local, &dir)
                })
                .await?
            }
        };
        self.logger.info(
            "upload complete",
            Some(&serde_json::json!({
                "host": profile.name,
                "route": outcome.route,
                "remote_path": outcome.remote_path,
                "bytes": outcome.bytes,
            })),
        );
        Ok(outcome)
    }

    /// Uploads one local file, preferring the host's shared mount.
    pub async fn upload(
        &self,
        host: &str,
        local: &Path,
        remote_dir: Option<&str>,
    ) -> Result<TransferOutcome, ExecError> {
        let profile = self.profile(host)?;
        self.upload_to(&profile, local, remote_dir, true).await
    }

    pub async fn download(
        &self,
        host: &str,
        remote_path: &str,
        local: &Path,
    ) -> Result<TransferOutcome, ExecError> {
        let profile = self.profile(host)?;
        let remote = remote_path.to_string();
        let local = local.to_path_buf();
        self.with_session(&profile, move |session| {
            transfer::sftp_download(session, &remote, &local)
        })
        .await
    }

    /// Drops only this host's pooled session.
    pub fn close(&self, profile: &SshHostProfile) -> bool {
        let mut guard = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let closed = guard.close(&profile.connection_key());
        if closed {
            self.logger
                .debug("connection closed", Some(&serde_json::json!({"host": profile.name})));
        }
        closed
    }

    pub fn close_all(&self) -> usize {
        let mut guard = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        guard.close_all()
    }
}

#[async_trait::async_trait]
impl Backend for SshBackend {
    async fn execute(
        &self,
        intent: &ParsedIntent,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError> {
        let host = intent
            .ssh_host
            .as_deref()
            .ok_or_else(|| ExecError::invalid_params("SSH intent without a host"))?;
        self.run(host, invocation, intent.auto_close).await
    }
}
