pub mod dispatcher;
pub mod docker;
pub mod local;
pub mod sandbox;
pub mod ssh;
pub mod terminal;

use crate::errors::ExecError;
use crate::services::intent::{Agent, ExecutionResult, ParsedIntent};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A local file named in an agent prompt, with its path relative to the
/// working directory so it lands at the same relative path remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedFile {
    pub local: PathBuf,
    pub relative: String,
}

/// What a backend runs: the final shell command plus the environment
/// scoped to this one invocation.
#[derive(Clone, Default)]
pub struct Invocation {
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub agent: Option<Agent>,
    pub prompt: Option<String>,
    pub files: Vec<ReferencedFile>,
}

impl Invocation {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Values that must be scrubbed from captured output.
    pub fn secret_values(&self) -> Vec<String> {
        self.env.values().filter(|v| v.len() >= 8).cloned().collect()
    }

    pub fn env_names(&self) -> Vec<String> {
        self.env.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command)
            .field("env", &self.env_names())
            .field("agent", &self.agent)
            .field("files", &self.files)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn execute(
        &self,
        intent: &ParsedIntent,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, ExecError>;
}
