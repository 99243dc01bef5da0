mod common;
use common::{quiet_logger, resolver, tmp_dir, ENV_LOCK};

use agentrun::errors::ExecErrorKind;
use agentrun::managers::dispatcher::Dispatcher;
use agentrun::managers::local::LocalBackend;
use agentrun::services::credentials::NoKeychain;
use agentrun::services::hosts::{HostRegistry, SshHostProfile, TransferShare};
use agentrun::services::intent::{Agent, BackendKind};
use agentrun::services::parser::parse;
use std::sync::Arc;

fn dispatcher(dir: &std::path::Path) -> Dispatcher {
    let registry = HostRegistry::with_path(quiet_logger(), dir.join("ssh_hosts.yaml"));
    let credentials = resolver(dir, Arc::new(NoKeychain), &[]);
    Dispatcher::new(quiet_logger(), registry, credentials, dir)
}

#[test]
fn added_host_survives_a_fresh_load() {
    let dir = tmp_dir("agentrun-hosts");
    let path = dir.join("ssh_hosts.yaml");
    let registry = HostRegistry::with_path(quiet_logger(), &path);

    let mut profile = SshHostProfile::new("DGX", "10.0.0.5");
    profile.user = "ml".to_string();
    profile.port = 2222;
    profile.gpu_enabled = true;
    profile.cuda_path = Some("/usr/local/cuda-12".to_string());
    profile.share = Some(TransferShare {
        local_mount: dir.join("mnt"),
        remote_path: "/data/share".to_string(),
    });
    profile
        .environment
        .insert("HF_HOME".to_string(), "/data/hf".to_string());
    registry.add(profile.clone()).expect("add");

    let fresh = HostRegistry::with_path(quiet_logger(), &path);
    assert!(fresh.load());
    let loaded = fresh.get("dgx").expect("persisted");
    assert_eq!(loaded, SshHostProfile { name: "dgx".to_string(), ..profile });
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn registered_hosts_steer_the_parser() {
    let hosts = vec!["dgx".to_string(), "dgx-2".to_string()];

    let intent = parse("--auto-close on dgx-2 nvidia-smi", &hosts);
    assert_eq!(intent.backend, BackendKind::Ssh);
    assert_eq!(intent.ssh_host.as_deref(), Some("dgx-2"));
    assert_eq!(intent.command, "nvidia-smi");
    assert!(intent.auto_close);

    let unknown = parse("on gpu-box nvidia-smi", &hosts);
    assert_eq!(unknown.backend, BackendKind::Local);
    assert_eq!(unknown.command, "on gpu-box nvidia-smi");

    let agent = parse("use codex on dgx to train the model", &hosts);
    assert_eq!(agent.backend, BackendKind::Ssh);
    assert_eq!(agent.agent, Some(Agent::Codex));
    assert_eq!(agent.command, "train the model");
}

#[test]
fn dispatcher_rejects_hosts_removed_after_parsing() {
    let dir = tmp_dir("agentrun-dispatch");
    let d = dispatcher(&dir);
    d.registry()
        .add(SshHostProfile::new("lab", "lab.local"))
        .expect("add");
    let intent = d.parse("ssh to lab uptime");
    assert_eq!(intent.backend, BackendKind::Ssh);

    assert!(d.registry().remove("lab").expect("remove"));
    let err = d.dispatch(&intent).err().expect("unknown host");
    assert_eq!(err.kind, ExecErrorKind::UnknownHost);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn auto_close_local_run_captures_output() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tmp_dir("agentrun-dispatch");
    let local = LocalBackend::new(quiet_logger(), &dir).with_shell("/bin/sh", &["-c"]);
    let d = dispatcher(&dir).with_local(Arc::new(local));

    let result = d.run("--auto-close echo hello from agentrun").await;
    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert!(result.output.contains("hello from agentrun"));
    assert_eq!(result.metadata["backend"], "local");
    assert_eq!(result.metadata["exit_code"], 0);

    let failed = d.run("--close exit 3").await;
    assert!(!failed.success);
    assert_eq!(failed.metadata["exit_code"], 3);
    assert!(!failed.metadata.contains_key("error_code"));
    let _ = std::fs::remove_dir_all(dir);
}
