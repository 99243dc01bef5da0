pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const SSH_DEFAULT_USER: &str = "root";
    pub const TIMEOUT_SSH_READY_MS: u64 = 8_000;
    pub const TIMEOUT_SSH_EXEC_DEFAULT_MS: u64 = 600_000;
    pub const TIMEOUT_SSH_EXEC_HARD_GRACE_MS: u64 = 2_000;
    pub const TIMEOUT_GPU_PROBE_MS: u64 = 8_000;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 30;
    pub const TIMEOUT_SANDBOX_REQUEST_MS: u64 = 30_000;
}

pub mod timeouts {
    pub const KEYCHAIN_LOOKUP_MS: u64 = 3_000;
    pub const DOCKER_PROBE_MS: u64 = 5_000;
    pub const DOCKER_BUILD_MS: u64 = 900_000;
    pub const LOCAL_EXEC_MS: u64 = 600_000;
    pub const DOCKER_EXEC_MS: u64 = 900_000;
    pub const SANDBOX_LIFETIME_SECS: u64 = 1_800;
    pub const SANDBOX_COMMAND_SECS: u64 = 600;
    pub const SANDBOX_INSTALL_SECS: u64 = 300;
}

pub mod limits {
    pub const MAX_CAPTURE_BYTES: usize = 512 * 1024;
    pub const MAX_UPLOAD_FILES: usize = 16;
    pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
    pub const LOG_PREVIEW_BYTES: usize = 120;
}

pub mod shell {
    /// Prepended to every remote command; non-interactive SSH sessions skip profile PATH setup.
    pub const DEFAULT_REMOTE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
    pub const FALLBACK_SHELL: &str = "/bin/sh";
    pub const LINUX_TERMINALS: &[&str] = &["x-terminal-emulator", "gnome-terminal", "konsole", "xterm"];
}

pub mod docker {
    pub const DEFAULT_IMAGE: &str = "agentrun-sandbox:latest";
    pub const WORKSPACE_MOUNT: &str = "/workspace";
}

pub mod sandbox {
    pub const DEFAULT_DOMAIN: &str = "e2b.app";
    pub const DEFAULT_TEMPLATE: &str = "base";
    pub const ENVD_PORT: u16 = 49983;
    pub const ENVD_USER: &str = "user";
    pub const OUTPUT_LIST_DEPTH: usize = 4;
    pub const REMOTE_WORKDIR: &str = "/home/user";
    pub const REMOTE_OUTPUT_DIR: &str = "/home/user/output";
    pub const LOCAL_OUTPUT_DIR: &str = "sandbox_output";
}

pub mod transfer {
    pub const DEFAULT_REMOTE_DIR: &str = "/tmp/agentrun";
}

pub mod credentials {
    pub const KEYCHAIN_SERVICE: &str = "agentrun";
    pub const DOTENV_FILE: &str = ".env";
    pub const SSH_KEY_ENV: &str = "AGENTRUN_SSH_KEY";
    pub const SSH_PASSPHRASE_ENV: &str = "AGENTRUN_SSH_PASSPHRASE";
    pub const DEFAULT_SSH_KEYS: &[&str] = &["~/.ssh/id_ed25519", "~/.ssh/id_rsa"];
    pub const PLACEHOLDER_MARKERS: &[&str] = &["your_", "_here", "<", "xxxx", "changeme"];
}
