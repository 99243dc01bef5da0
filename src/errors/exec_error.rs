use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    CredentialNotFound,
    ConnectionError,
    UnknownHost,
    Timeout,
    BackendUnavailable,
    CommandFailure,
    InvalidParams,
    Internal,
}

impl ExecErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ExecErrorKind::CredentialNotFound => "CREDENTIAL_NOT_FOUND",
            ExecErrorKind::ConnectionError => "CONNECTION_ERROR",
            ExecErrorKind::UnknownHost => "UNKNOWN_HOST",
            ExecErrorKind::Timeout => "TIMEOUT",
            ExecErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ExecErrorKind::CommandFailure => "COMMAND_FAILURE",
            ExecErrorKind::InvalidParams => "INVALID_PARAMS",
            ExecErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            hint: None,
            details: None,
            retryable: matches!(
                kind,
                ExecErrorKind::Timeout | ExecErrorKind::ConnectionError
            ),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn credential_not_found(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::CredentialNotFound, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::ConnectionError, message)
    }

    pub fn unknown_host(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::UnknownHost, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Timeout, message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::BackendUnavailable, message)
    }

    pub fn command_failure(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::CommandFailure, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Internal, message)
    }

    pub fn is_kind(&self, kind: ExecErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

impl Error for ExecError {}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return ExecError::timeout(err.to_string());
        }
        ExecError::internal(err.to_string())
    }
}

impl From<reqwest::Error> for ExecError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ExecError::timeout(format!("Sandbox request timed out: {}", err));
        }
        if err.is_connect() {
            return ExecError::backend_unavailable(format!("Sandbox service unreachable: {}", err));
        }
        ExecError::connection(format!("Sandbox request failed: {}", err))
    }
}
