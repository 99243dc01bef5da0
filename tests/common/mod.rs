#![allow(dead_code)]

use agentrun::services::credentials::{CredentialResolver, SecretStore};
use agentrun::services::logger::{LogLevel, Logger};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn quiet_logger() -> Logger {
    Logger::with_level("test", LogLevel::Error)
}

/// Resolver rooted at `dir` for both the working directory and home, with a
/// fixed environment instead of the process one.
pub fn resolver(
    dir: &Path,
    keychain: Arc<dyn SecretStore>,
    env: &'static [(&'static str, &'static str)],
) -> CredentialResolver {
    CredentialResolver::new(quiet_logger(), dir)
        .with_home(dir)
        .with_keychain(keychain)
        .with_env(move |key| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
}
