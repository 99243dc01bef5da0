use crate::errors::ExecError;
use crate::utils::shell::escape_shell_value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Docker,
    Ssh,
    Sandbox,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Docker => "docker",
            BackendKind::Ssh => "ssh",
            BackendKind::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Claude,
    Gemini,
    Codex,
}

impl Agent {
    pub const ALL: [Agent; 3] = [Agent::Claude, Agent::Gemini, Agent::Codex];

    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Claude => "claude",
            Agent::Gemini => "gemini",
            Agent::Codex => "codex",
        }
    }

    pub fn parse(value: &str) -> Option<Agent> {
        let lowered = value.trim().to_lowercase();
        Agent::ALL.into_iter().find(|agent| agent.as_str() == lowered)
    }

    /// Logical credential name handed to the resolver.
    pub fn credential_name(self) -> &'static str {
        self.as_str()
    }

    pub fn npm_package(self) -> &'static str {
        match self {
            Agent::Claude => "@anthropic-ai/claude-code",
            Agent::Gemini => "@google/gemini-cli",
            Agent::Codex => "@openai/codex",
        }
    }

    pub fn install_command(self) -> String {
        format!("npm install -g {}", self.npm_package())
    }

    /// Agent CLI invocation with a quoted prompt. Headless runs skip every
    /// permission prompt; interactive runs open the CLI's own session.
    pub fn build_command(self, prompt: &str, headless: bool) -> String {
        let quoted = escape_shell_value(prompt);
        match (self, headless) {
            (Agent::Claude, true) => format!("claude -p --dangerously-skip-permissions {}", quoted),
            (Agent::Gemini, true) => format!("gemini -y -p {}", quoted),
            (Agent::Codex, true) => format!(
                "codex exec --full-auto --sandbox danger-full-access --skip-git-repo-check {}",
                quoted
            ),
            (agent, false) => format!("{} {}", agent.as_str(), quoted),
        }
    }

    /// Shell step that logs the CLI in from its injected key, for CLIs that
    /// ignore the environment variable on a fresh install.
    pub fn login_prelude(self) -> Option<&'static str> {
        match self {
            Agent::Codex => Some("printenv OPENAI_API_KEY | codex login --with-api-key >/dev/null 2>&1"),
            Agent::Claude | Agent::Gemini => None,
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedIntent {
    pub backend: BackendKind,
    pub agent: Option<Agent>,
    pub ssh_host: Option<String>,
    pub auto_close: bool,
    pub command: String,
}

impl ParsedIntent {
    pub fn local(command: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Local,
            agent: None,
            ssh_host: None,
            auto_close: false,
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    /// Result of a finished process. With `allow_soft`, a non-zero exit that
    /// still wrote to stdout counts as success and is flagged `soft_success`.
    pub fn from_exit(
        exit_code: i32,
        stdout: String,
        stderr: String,
        subject: &str,
        allow_soft: bool,
    ) -> Self {
        let soft_success = allow_soft && exit_code != 0 && !stdout.trim().is_empty();
        let mut result = if exit_code == 0 || soft_success {
            Self::ok(stdout)
        } else {
            let message = if stderr.trim().is_empty() {
                format!("{} exited with status {}", subject, exit_code)
            } else {
                stderr.clone()
            };
            Self::failed(stdout, message)
        };
        result.insert("exit_code", exit_code);
        if soft_success {
            result.insert("soft_success", true);
        }
        if !stderr.is_empty() {
            result.insert("stderr", stderr);
        }
        result
    }

    /// Structured failure for the dispatcher boundary.
    pub fn from_error(backend: BackendKind, err: &ExecError) -> Self {
        let mut result = Self::failed(String::new(), err.to_string());
        result.insert("backend", backend.as_str());
        result.insert("error_code", err.code.as_str());
        result.insert("retryable", err.retryable);
        if let Some(details) = err.details.as_ref() {
            result.insert("error_details", details.clone());
        }
        result
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }
}
