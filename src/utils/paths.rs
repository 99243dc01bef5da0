use crate::utils::user_paths::{expand_home_path, home_dir};
use std::env;
use std::path::PathBuf;

pub fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(expand_home_path(trimmed))
}

fn resolve_xdg_config_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_CONFIG_HOME").ok()) {
        return Some(path);
    }
    home_dir().map(|home| home.join(".config"))
}

pub fn resolve_config_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("AGENTRUN_CONFIG_DIR").ok()) {
        return path;
    }
    resolve_xdg_config_dir()
        .map(|dir| dir.join("agentrun"))
        .unwrap_or_else(|| PathBuf::from(".agentrun"))
}

pub fn resolve_hosts_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("AGENTRUN_HOSTS_PATH").ok()) {
        return path;
    }
    resolve_config_dir().join("ssh_hosts.yaml")
}

pub fn resolve_known_hosts_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("AGENTRUN_KNOWN_HOSTS").ok()) {
        return path;
    }
    expand_home_path("~/.ssh/known_hosts")
}

pub fn resolve_docker_build_context() -> Option<PathBuf> {
    normalize_env_path(env::var("AGENTRUN_DOCKER_BUILD_CONTEXT").ok())
}

#[cfg(test)]
mod tests {
    use super::normalize_env_path;
    use std::path::PathBuf;

    #[test]
    fn normalize_env_path_rejects_blank_and_sentinels() {
        assert_eq!(normalize_env_path(None), None);
        assert_eq!(normalize_env_path(Some("  ".to_string())), None);
        assert_eq!(normalize_env_path(Some("null".to_string())), None);
        assert_eq!(
            normalize_env_path(Some(" /tmp/hosts.yaml ".to_string())),
            Some(PathBuf::from("/tmp/hosts.yaml"))
        );
    }
}
