use super::exec::exec_blocking;
use super::session::map_ssh_error;
use crate::constants::network::TIMEOUT_SSH_READY_MS;
use crate::errors::ExecError;
use crate::services::hosts::{SshHostProfile, TransferShare};
use crate::utils::fs_atomic::temp_sibling_path;
use crate::utils::shell::escape_shell_value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

static SHA256_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{64}\b").expect("sha256 regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRoute {
    SharedMount,
    Sftp,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub route: TransferRoute,
    pub local_path: String,
    pub remote_path: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// `None` when the remote had no hashing tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// Shared mount when the profile declares one and its local side is an
/// accessible directory; SFTP otherwise.
pub fn select_route(profile: &SshHostProfile) -> TransferRoute {
    match profile.share.as_ref() {
        Some(share) if fs::read_dir(&share.local_mount).is_ok() => TransferRoute::SharedMount,
        _ => TransferRoute::Sftp,
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn file_name_of(path: &Path) -> Result<String, ExecError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ExecError::invalid_params(format!("No file name in {}", path.display())))
}

pub fn compute_local_sha256_hex(path: &Path) -> Result<String, ExecError> {
    let mut file = fs::File::open(path).map_err(|err| {
        ExecError::invalid_params(format!("{} must be readable: {}", path.display(), err))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn build_remote_sha256_command(remote_path: &str) -> String {
    let quoted = escape_shell_value(remote_path);
    [
        format!("P={}", quoted),
        "if command -v sha256sum >/dev/null 2>&1; then sha256sum -- \"$P\" | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v shasum >/dev/null 2>&1; then shasum -a 256 -- \"$P\" | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v openssl >/dev/null 2>&1; then openssl dgst -sha256 \"$P\" | awk '{print $NF}'; exit 0; fi".to_string(),
        "exit 127".to_string(),
    ]
    .join("\n")
}

pub fn parse_sha256_from_output(text: &str) -> Option<String> {
    SHA256_HEX.find(text).map(|m| m.as_str().to_lowercase())
}

/// Copies into the local side of the share; the file appears remotely under
/// `remote_path`. The copy lands through a temp sibling and a rename.
pub fn copy_to_share(
    share: &TransferShare,
    local: &Path,
    subdir: Option<&str>,
) -> Result<TransferOutcome, ExecError> {
    let name = file_name_of(local)?;
    let mut target_dir = share.local_mount.clone();
    let mut remote_dir = share.remote_path.clone();
    if let Some(sub) = subdir.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        target_dir = target_dir.join(sub);
        remote_dir = join_remote(&remote_dir, sub);
    }
    fs::create_dir_all(&target_dir).map_err(|err| {
        ExecError::internal(format!("Cannot create {}: {}", target_dir.display(), err))
    })?;
    let target = target_dir.join(&name);
    let tmp = temp_sibling_path(&target);
    let bytes = fs::copy(local, &tmp).map_err(|err| {
        ExecError::internal(format!("Copy into share failed: {}", err))
    })?;
    if let Err(err) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(ExecError::internal(format!("Finalize in share failed: {}", err)));
    }
    Ok(TransferOutcome {
        route: TransferRoute::SharedMount,
        local_path: local.display().to_string(),
        remote_path: join_remote(&remote_dir, &name),
        bytes,
        sha256: None,
        verified: None,
    })
}

pub(crate) fn ensure_remote_dir(sftp: &Sftp, remote_dir: &str) -> Result<(), ExecError> {
    let mut current = PathBuf::new();
    for part in Path::new(remote_dir).components() {
        current.push(part);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        if sftp.stat(&current).is_ok() {
            continue;
        }
        sftp.mkdir(&current, 0o755).map_err(|err| {
            ExecError::connection(format!(
                "Cannot create remote directory {}: {}",
                current.display(),
                err
            ))
        })?;
    }
    Ok(())
}

/// SFTP upload into `remote_dir`, then a SHA-256 comparison when the remote
/// can hash. A mismatch is an error.
pub fn sftp_upload(
    session: &Session,
    local: &Path,
    remote_dir: &str,
) -> Result<TransferOutcome, ExecError> {
    let name = file_name_of(local)?;
    let remote_path = join_remote(remote_dir, &name);
    let sftp = session.sftp().map_err(map_ssh_error)?;
    ensure_remote_dir(&sftp, remote_dir)?;

    let mut local_file = fs::File::open(local).map_err(|err| {
        ExecError::invalid_params(format!("{} must be readable: {}", local.display(), err))
    })?;
    let mut remote_file = sftp
        .open_mode(
            Path::new(&remote_path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(map_ssh_error)?;
    let bytes = std::io::copy(&mut local_file, &mut remote_file)
        .map_err(|err| ExecError::connection(format!("SFTP write failed: {}", err)))?;
    drop(remote_file);
    drop(sftp);

    let local_hash = compute_local_sha256_hex(local)?;
    let probe = exec_blocking(
        session,
        &build_remote_sha256_command(&remote_path),
        Duration::from_millis(TIMEOUT_SSH_READY_MS),
        4096,
        None,
    )?;
    let verified = parse_sha256_from_output(&probe.stdout).map(|remote| remote == local_hash);
    if verified == Some(false) {
        return Err(ExecError::command_failure(format!(
            "Checksum mismatch after upload to {}",
            remote_path
        ))
        .with_details(serde_json::json!({"local_sha256": local_hash})));
    }
    Ok(TransferOutcome {
        route: TransferRoute::Sftp,
        local_path: local.display().to_string(),
        remote_path,
        bytes,
        sha256: Some(local_hash),
        verified,
    })
}

/// SFTP download into a temp sibling, renamed into place, with the remote
/// mtime preserved.
pub fn sftp_download(
    session: &Session,
    remote_path: &str,
    local: &Path,
) -> Result<TransferOutcome, ExecError> {
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let sftp = session.sftp().map_err(map_ssh_error)?;
    let stat = sftp.stat(Path::new(remote_path)).map_err(|err| {
        ExecError::invalid_params(format!("Remote path {} is not readable: {}", remote_path, err))
    })?;
    if stat.is_dir() {
        return Err(ExecError::invalid_params(format!(
            "Remote path {} is a directory",
            remote_path
        )));
    }
    let mut remote_file = sftp.open(Path::new(remote_path)).map_err(map_ssh_error)?;
    let tmp = temp_sibling_path(local);
    let copied = fs::File::create(&tmp)
        .map_err(ExecError::from)
        .and_then(|mut out| {
            std::io::copy(&mut remote_file, &mut out)
                .map_err(|err| ExecError::connection(format!("SFTP read failed: {}", err)))
        });
    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };
    if let Err(err) = fs::rename(&tmp, local) {
        let _ = fs::remove_file(&tmp);
        return Err(ExecError::internal(format!("Failed to finalize download: {}", err)));
    }
    if let (Some(atime), Some(mtime)) = (stat.atime, stat.mtime) {
        let atime = filetime::FileTime::from_unix_time(atime as i64, 0);
        let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
        let _ = filetime::set_file_times(local, atime, mtime);
    }
    Ok(TransferOutcome {
        route: TransferRoute::Sftp,
        local_path: local.display().to_string(),
        remote_path: remote_path.to_string(),
        bytes,
        sha256: None,
        verified: None,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        build_remote_sha256_command, compute_local_sha256_hex, copy_to_share, join_remote,
        parse_sha256_from_output, select_route, TransferRoute,
    };
    use crate::services::hosts::{SshHostProfile, TransferShare};

    fn scratch() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("agentrun-xfer-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn no_share_means_sftp() {
        let profile = SshHostProfile::new("dgx", "10.0.0.5");
        assert_eq!(select_route(&profile), TransferRoute::Sftp);
    }

    #[test]
    fn missing_mount_falls_back_to_sftp() {
        let mut profile = SshHostProfile::new("dgx", "10.0.0.5");
        profile.share = Some(TransferShare {
            local_mount: "/nonexistent/agentrun-mount".into(),
            remote_path: "/data".to_string(),
        });
        assert_eq!(select_route(&profile), TransferRoute::Sftp);
    }

    #[test]
    fn shared_mount_copy_maps_remote_path() {
        let dir = scratch();
        let mount = dir.join("mount");
        std::fs::create_dir_all(&mount).expect("mkdir");
        let source = dir.join("notes.md");
        std::fs::write(&source, "hello").expect("write");

        let mut profile = SshHostProfile::new("dgx", "10.0.0.5");
        let share = TransferShare {
            local_mount: mount.clone(),
            remote_path: "/data/shared/".to_string(),
        };
        profile.share = Some(share.clone());
        assert_eq!(select_route(&profile), TransferRoute::SharedMount);

        let outcome = copy_to_share(&share, &source, Some("jobs")).expect("copy");
        assert_eq!(outcome.remote_path, "/data/shared/jobs/notes.md");
        assert_eq!(outcome.bytes, 5);
        assert_eq!(
            std::fs::read_to_string(mount.join("jobs").join("notes.md")).unwrap(),
            "hello"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn sha256_helpers() {
        let dir = scratch();
        let file = dir.join("a.txt");
        std::fs::write(&file, "abc").expect("write");
        assert_eq!(
            compute_local_sha256_hex(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let out = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD  /tmp/a.txt";
        assert_eq!(
            parse_sha256_from_output(out).as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(parse_sha256_from_output("no hash").is_none());
        assert!(build_remote_sha256_command("/tmp/it's").contains("P='/tmp/it'\\''s'"));
        assert_eq!(join_remote("/tmp/agentrun/", "x"), "/tmp/agentrun/x");
        let _ = std::fs::remove_dir_all(dir);
    }
}
