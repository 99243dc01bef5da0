use crate::constants::network::KEEPALIVE_INTERVAL_SECS;
use crate::errors::ExecError;
use crate::services::hosts::SshHostProfile;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to open one authenticated session.
#[derive(Clone)]
pub struct ConnectSpec {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
    pub known_hosts: PathBuf,
    pub ready_timeout: Duration,
}

impl ConnectSpec {
    pub fn for_profile(
        profile: &SshHostProfile,
        key_path: PathBuf,
        passphrase: Option<String>,
        known_hosts: PathBuf,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            hostname: profile.hostname.clone(),
            port: profile.port,
            user: profile.user.clone(),
            key_path,
            passphrase,
            known_hosts,
            ready_timeout,
        }
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.hostname, self.port)
    }
}

pub(crate) fn map_ssh_error(err: ssh2::Error) -> ExecError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        std::io::ErrorKind::TimedOut => ExecError::timeout("SSH operation timed out"),
        _ => ExecError::connection(format!("SSH error: {}", io_err)),
    }
}

fn open_tcp(spec: &ConnectSpec) -> Result<TcpStream, ExecError> {
    let addrs = (spec.hostname.as_str(), spec.port)
        .to_socket_addrs()
        .map_err(|err| {
            ExecError::connection(format!("Cannot resolve {}: {}", spec.hostname, err))
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, spec.ready_timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) if err.kind() == std::io::ErrorKind::TimedOut => Err(ExecError::timeout(
            format!("Timed out connecting to {}", spec.target()),
        )),
        Some(err) => Err(ExecError::connection(format!(
            "Failed to connect to {}: {}",
            spec.target(),
            err
        ))),
        None => Err(ExecError::connection(format!(
            "{} resolved to no addresses",
            spec.hostname
        ))),
    }
}

/// Rejects any server key that is not already recorded in `known_hosts`.
fn verify_host_key(session: &Session, spec: &ConnectSpec) -> Result<(), ExecError> {
    let (key, _) = session
        .host_key()
        .ok_or_else(|| ExecError::connection("Server did not present a host key"))?;
    let mut known = session.known_hosts().map_err(map_ssh_error)?;
    if spec.known_hosts.is_file() {
        known
            .read_file(&spec.known_hosts, KnownHostFileKind::OpenSSH)
            .map_err(|err| {
                ExecError::connection(format!(
                    "Cannot read {}: {}",
                    spec.known_hosts.display(),
                    err
                ))
            })?;
    }
    let scan_hint = format!(
        "Verify the fingerprint, then run: ssh-keyscan -p {} {} >> {}",
        spec.port,
        spec.hostname,
        spec.known_hosts.display()
    );
    match known.check_port(&spec.hostname, spec.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(ExecError::connection(format!(
            "Host key for {} is not in {}",
            spec.hostname,
            spec.known_hosts.display()
        ))
        .with_hint(scan_hint)),
        CheckResult::Mismatch => Err(ExecError::connection(format!(
            "Host key for {} does not match {}",
            spec.hostname,
            spec.known_hosts.display()
        ))
        .with_hint("The server key changed. Confirm with the host owner before editing known_hosts.")),
        CheckResult::Failure => Err(ExecError::connection(format!(
            "Host key check failed for {}",
            spec.hostname
        ))),
    }
}

fn authenticate(session: &Session, spec: &ConnectSpec) -> Result<(), ExecError> {
    session
        .userauth_pubkey_file(
            &spec.user,
            None,
            Path::new(&spec.key_path),
            spec.passphrase.as_deref(),
        )
        .map_err(|err| {
            ExecError::connection(format!(
                "SSH key authentication failed for {}: {}",
                spec.target(),
                err
            ))
            .with_hint(format!(
                "Check that {} is authorized on the host",
                spec.key_path.display()
            ))
        })?;
    if !session.authenticated() {
        return Err(ExecError::connection(format!(
            "SSH authentication failed for {}",
            spec.target()
        )));
    }
    Ok(())
}

/// Blocking connect: TCP, handshake, host-key trust, key auth, keepalive.
pub fn connect_session(spec: &ConnectSpec) -> Result<Session, ExecError> {
    let tcp = open_tcp(spec)?;
    tcp.set_read_timeout(Some(spec.ready_timeout)).ok();
    tcp.set_write_timeout(Some(spec.ready_timeout)).ok();

    let mut session =
        Session::new().map_err(|_| ExecError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(map_ssh_error)?;
    verify_host_key(&session, spec)?;
    authenticate(&session, spec)?;
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    Ok(session)
}
