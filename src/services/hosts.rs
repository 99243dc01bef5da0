use crate::constants::network::{SSH_DEFAULT_PORT, SSH_DEFAULT_USER};
use crate::errors::ExecError;
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::utils::fs_atomic::atomic_write_text_file;
use crate::utils::paths::resolve_hosts_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

fn default_port() -> u16 {
    SSH_DEFAULT_PORT
}

fn default_user() -> String {
    SSH_DEFAULT_USER.to_string()
}

/// Shared filesystem visible both locally and on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferShare {
    pub local_mount: PathBuf,
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHostProfile {
    #[serde(skip)]
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default)]
    pub gpu_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<TransferShare>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl SshHostProfile {
    pub fn new(name: &str, hostname: &str) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            hostname: hostname.trim().to_string(),
            port: SSH_DEFAULT_PORT,
            user: SSH_DEFAULT_USER.to_string(),
            key_path: None,
            gpu_enabled: false,
            cuda_path: None,
            share: None,
            environment: BTreeMap::new(),
        }
    }

    /// Pool key: `user@host:port`.
    pub fn connection_key(&self) -> String {
        format!("{}@{}:{}", self.user, self.hostname, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct HostStoreFile {
    #[serde(default)]
    hosts: BTreeMap<String, SshHostProfile>,
}

#[derive(Default)]
struct RegistryState {
    loaded: bool,
    load_failed: bool,
    hosts: BTreeMap<String, SshHostProfile>,
}

/// Named SSH host profiles backed by a YAML store. Loaded on first access,
/// written back in full on every add/remove. A store that exists but cannot
/// be read makes the registry read-only until it loads cleanly.
#[derive(Clone)]
pub struct HostRegistry {
    logger: Logger,
    validation: Validation,
    file_path: PathBuf,
    state: Arc<RwLock<RegistryState>>,
}

impl HostRegistry {
    pub fn new(logger: Logger) -> Self {
        Self::with_path(logger, resolve_hosts_path())
    }

    pub fn with_path(logger: Logger, file_path: impl Into<PathBuf>) -> Self {
        Self {
            logger: logger.child("hosts"),
            validation: Validation::new(),
            file_path: file_path.into(),
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Reads the store from disk, replacing the cache. Returns false when the
    /// store does not exist or cannot be parsed at all.
    pub fn load(&self) -> bool {
        let (hosts, failed) = match self.read_store() {
            Ok(Some(hosts)) => (hosts, false),
            Ok(None) => (BTreeMap::new(), false),
            Err(reason) => {
                self.logger.warn(
                    &reason,
                    Some(&serde_json::json!({"path": self.file_path})),
                );
                (BTreeMap::new(), true)
            }
        };
        let found = self.file_path.exists();
        let count = hosts.len();
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        guard.hosts = hosts;
        guard.loaded = true;
        guard.load_failed = failed;
        drop(guard);
        if failed || !found {
            return false;
        }
        self.logger.debug(
            "loaded host store",
            Some(&serde_json::json!({"path": self.file_path, "hosts": count})),
        );
        true
    }

    /// True when the store exists but the last load could not use it.
    pub fn load_failed(&self) -> bool {
        self.ensure_loaded();
        self.state.read().map(|s| s.load_failed).unwrap_or(false)
    }

    fn read_store(&self) -> Result<Option<BTreeMap<String, SshHostProfile>>, String> {
        if !self.file_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.file_path)
            .map_err(|err| format!("host store unreadable: {}", err))?;
        if raw.trim().is_empty() {
            return Ok(Some(BTreeMap::new()));
        }
        let parsed: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|err| format!("host store is not valid YAML: {}", err))?;
        let entries = match parsed {
            serde_yaml::Value::Mapping(mut root) => match root.remove("hosts") {
                Some(serde_yaml::Value::Mapping(map)) => map,
                Some(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
                Some(_) => return Err("host store 'hosts' must be a mapping".to_string()),
                None => root,
            },
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => return Err("host store root must be a mapping".to_string()),
        };
        let mut hosts = BTreeMap::new();
        for (key, value) in entries {
            let Some(name) = key.as_str() else {
                self.logger.warn("skipping host entry with non-string name", None);
                continue;
            };
            match self.parse_entry(name, value) {
                Ok(profile) => {
                    hosts.insert(profile.name.clone(), profile);
                }
                Err(err) => self.logger.warn(
                    "skipping malformed host entry",
                    Some(&serde_json::json!({"host": name, "error": err.message})),
                ),
            }
        }
        Ok(Some(hosts))
    }

    fn parse_entry(&self, name: &str, value: serde_yaml::Value) -> Result<SshHostProfile, ExecError> {
        let name = self.validation.ensure_host_name(name)?;
        let mut profile: SshHostProfile = serde_yaml::from_value(value)
            .map_err(|err| ExecError::invalid_params(err.to_string()))?;
        profile.name = name;
        self.check_profile(&profile)?;
        Ok(profile)
    }

    fn check_profile(&self, profile: &SshHostProfile) -> Result<(), ExecError> {
        self.validation.ensure_string(&profile.hostname, "hostname")?;
        self.validation.ensure_string(&profile.user, "user")?;
        self.validation.ensure_port(profile.port)?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), ExecError> {
        self.ensure_loaded();
        let failed = self.state.read().map(|s| s.load_failed).unwrap_or(true);
        if failed {
            return Err(ExecError::internal(format!(
                "Host store {} could not be loaded; refusing to overwrite it",
                self.file_path.display()
            ))
            .with_hint("Fix or move the file, then retry."));
        }
        Ok(())
    }

    fn ensure_loaded(&self) {
        let loaded = self.state.read().map(|s| s.loaded).unwrap_or(false);
        if !loaded {
            self.load();
        }
    }

    pub fn get(&self, name: &str) -> Option<SshHostProfile> {
        self.ensure_loaded();
        let key = name.trim().to_lowercase();
        self.state
            .read()
            .ok()
            .and_then(|guard| guard.hosts.get(&key).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sorted host names.
    pub fn list(&self) -> Vec<String> {
        self.ensure_loaded();
        self.state
            .read()
            .map(|guard| guard.hosts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn profiles(&self) -> Vec<SshHostProfile> {
        self.ensure_loaded();
        self.state
            .read()
            .map(|guard| guard.hosts.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts or replaces a profile and persists the registry.
    pub fn add(&self, mut profile: SshHostProfile) -> Result<(), ExecError> {
        self.ensure_writable()?;
        profile.name = self.validation.ensure_host_name(&profile.name)?;
        profile.hostname = profile.hostname.trim().to_string();
        self.check_profile(&profile)?;
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        guard.hosts.insert(profile.name.clone(), profile.clone());
        drop(guard);
        self.persist()?;
        self.logger.info(
            "host added",
            Some(&serde_json::json!({"host": profile.name, "target": profile.connection_key()})),
        );
        Ok(())
    }

    /// Returns false when the host was not registered.
    pub fn remove(&self, name: &str) -> Result<bool, ExecError> {
        self.ensure_writable()?;
        let key = name.trim().to_lowercase();
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if guard.hosts.remove(&key).is_none() {
            return Ok(false);
        }
        drop(guard);
        self.persist()?;
        self.logger.info("host removed", Some(&serde_json::json!({"host": key})));
        Ok(true)
    }

    fn persist(&self) -> Result<(), ExecError> {
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        let store = HostStoreFile {
            hosts: guard.hosts.clone(),
        };
        drop(guard);
        let data = serde_yaml::to_string(&store)
            .map_err(|err| ExecError::internal(format!("Failed to serialize host store: {}", err)))?;
        atomic_write_text_file(&self.file_path, &data, 0o600).map_err(|err| {
            ExecError::internal(format!(
                "Failed to save host store {}: {}",
                self.file_path.display(),
                err
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{HostRegistry, SshHostProfile};
    use crate::services::logger::{LogLevel, Logger};

    fn registry_at(contents: Option<&str>) -> (HostRegistry, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("agentrun-hosts-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("ssh_hosts.yaml");
        if let Some(text) = contents {
            std::fs::write(&path, text).expect("write store");
        }
        (
            HostRegistry::with_path(Logger::with_level("test", LogLevel::Error), &path),
            dir,
        )
    }

    #[test]
    fn missing_store_is_empty_not_error() {
        let (registry, dir) = registry_at(None);
        assert!(!registry.load());
        assert!(registry.list().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn defaults_apply_and_names_fold_case() {
        let (registry, dir) = registry_at(Some("hosts:\n  DGX:\n    hostname: 10.0.0.5\n"));
        let profile = registry.get("dgx").expect("dgx");
        assert_eq!(profile.port, 22);
        assert_eq!(profile.user, "root");
        assert!(!profile.gpu_enabled);
        assert_eq!(profile.connection_key(), "root@10.0.0.5:22");
        assert!(registry.get("Dgx").is_some());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_entries_are_skipped_individually() {
        let yaml = "hosts:\n  good:\n    hostname: a.example\n  noname:\n    port: 22\n  badport:\n    hostname: b\n    port: nope\n";
        let (registry, dir) = registry_at(Some(yaml));
        assert!(registry.load());
        assert_eq!(registry.list(), vec!["good".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unparseable_store_is_never_overwritten() {
        let yaml = "hosts:\n  dgx:\n    hostname: 10.0.0.5\n\tlab:\n    hostname: lab.local\n";
        let (registry, dir) = registry_at(Some(yaml));
        assert!(!registry.load());
        assert!(registry.load_failed());
        assert!(registry.list().is_empty());

        let err = registry
            .add(SshHostProfile::new("new", "new.local"))
            .expect_err("store is read-only");
        assert!(err.message.contains("ssh_hosts.yaml"));
        assert!(registry.remove("dgx").is_err());
        let on_disk = std::fs::read_to_string(registry.file_path()).expect("read");
        assert_eq!(on_disk, yaml);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn repaired_store_becomes_writable_again() {
        let (registry, dir) = registry_at(Some("hosts: [dgx]\n"));
        assert!(!registry.load());
        assert!(registry.add(SshHostProfile::new("lab", "lab.local")).is_err());

        std::fs::write(registry.file_path(), "hosts:\n  dgx:\n    hostname: 10.0.0.5\n").expect("repair");
        assert!(registry.load());
        registry.add(SshHostProfile::new("lab", "lab.local")).expect("add");
        assert_eq!(registry.list(), vec!["dgx".to_string(), "lab".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn bare_mapping_without_hosts_key_is_accepted() {
        let (registry, dir) = registry_at(Some("lab:\n  hostname: lab.local\n  user: me\n"));
        assert_eq!(registry.get("lab").map(|p| p.user), Some("me".to_string()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn remove_persists_immediately() {
        let (registry, dir) = registry_at(Some("hosts:\n  a:\n    hostname: a\n  b:\n    hostname: b\n"));
        assert!(registry.remove("A").expect("remove"));
        assert!(!registry.remove("missing").expect("remove missing"));
        let fresh = HostRegistry::with_path(
            Logger::with_level("test", LogLevel::Error),
            registry.file_path(),
        );
        assert_eq!(fresh.list(), vec!["b".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn add_rejects_empty_hostname() {
        let (registry, dir) = registry_at(None);
        let err = registry.add(SshHostProfile::new("x", "  ")).expect_err("invalid");
        assert!(err.message.contains("hostname"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
