use crate::errors::ExecError;
use crate::utils::text::{decode_output, truncate_utf8_prefix};
use std::io;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Blocking spawn with a deadline, for short probes (keychain, tool lookups).
/// `Ok(None)` means the deadline passed and the child was killed.
pub fn run_blocking_with_timeout(
    cmd: &mut std::process::Command,
    timeout: Duration,
) -> io::Result<Option<Output>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output().map(Some);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Runs to completion under `timeout`, capturing at most `max_bytes` per stream.
/// The child is killed when the deadline passes.
pub async fn run_captured(
    mut cmd: tokio::process::Command,
    label: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<CapturedOutput, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let started = Instant::now();
    let child = cmd.spawn().map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ExecError::backend_unavailable(format!("{} is not installed or not on PATH", label))
        } else {
            ExecError::internal(format!("Failed to spawn {}: {}", label, err))
        }
    })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|err| ExecError::internal(format!("Failed to wait for {}: {}", label, err)))?,
        Err(_) => {
            return Err(ExecError::timeout(format!(
                "{} exceeded its {}ms budget",
                label,
                timeout.as_millis()
            )))
        }
    };
    Ok(CapturedOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_utf8_prefix(&decode_output(&output.stdout), max_bytes),
        stderr: truncate_utf8_prefix(&decode_output(&output.stderr), max_bytes),
        duration_ms: started.elapsed().as_millis(),
    })
}

/// True when `program` resolves on PATH.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
