use std::io;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SafeShellError>;

/// The closed set of error kinds a caller of the dispatcher can observe.
///
/// These map 1:1 onto the `code` field of the structured error body
/// described in the tool surface: validation and retry-protocol errors are
/// surfaced to the caller rather than propagated as process-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PermissionDenied,
    CommandNotWhitelisted,
    CommandNotFound,
    SubcommandNotAllowed,
    FlagNotAllowed,
    PathViolation,
    SymlinkViolation,
    Timeout,
    ExecutionError,
    ConfigError,
    ImportNotAllowed,
    ShellNotFound,
    ScriptNotFound,
    RetryNotFound,
}

/// A structured error body: `{ code, message, details?, suggestion? }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            suggestion: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum SandboxErr {
    #[error("sandbox denied exec, exit code: {0}, stdout: {1}, stderr: {2}")]
    Denied(i32, String, String),

    #[cfg(target_os = "linux")]
    #[error("seccomp setup error")]
    SeccompInstall(#[from] seccompiler::Error),

    #[cfg(target_os = "linux")]
    #[error("seccomp backend error")]
    SeccompBackend(#[from] seccompiler::BackendError),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("process was killed by signal {0}")]
    Signal(i32),

    #[error("Landlock was not able to fully enforce all sandbox rules")]
    LandlockRestrict,
}

#[derive(Error, Debug)]
pub enum SafeShellError {
    #[error("{0} is not on the command whitelist")]
    CommandNotWhitelisted(String),

    #[error("{0} was not found on the host")]
    CommandNotFound(String),

    #[error("subcommand {subcommand:?} of {command} is not allowed")]
    SubcommandNotAllowed { command: String, subcommand: String },

    #[error("flag {flag} is not allowed for {command}")]
    FlagNotAllowed { command: String, flag: String },

    #[error("path {path} escapes the sandboxed read/write surface")]
    PathViolation { path: String },

    #[error("path {path} resolves through a symlink that escapes the sandbox")]
    SymlinkViolation { path: String },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("execution error: {0}")]
    ExecutionError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("import {0} is not allowed by the configured import policy")]
    ImportNotAllowed(String),

    #[error("no shell with id {0}")]
    ShellNotFound(String),

    #[error("no script with id {0} on shell {1}")]
    ScriptNotFound(String, String),

    #[error("no pending retry with id {0}")]
    RetryNotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    LandlockRuleset(#[from] landlock::RulesetError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    LandlockPathFd(#[from] landlock::PathFdError),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl SafeShellError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SafeShellError::CommandNotWhitelisted(_) => ErrorCode::CommandNotWhitelisted,
            SafeShellError::CommandNotFound(_) => ErrorCode::CommandNotFound,
            SafeShellError::SubcommandNotAllowed { .. } => ErrorCode::SubcommandNotAllowed,
            SafeShellError::FlagNotAllowed { .. } => ErrorCode::FlagNotAllowed,
            SafeShellError::PathViolation { .. } => ErrorCode::PathViolation,
            SafeShellError::SymlinkViolation { .. } => ErrorCode::SymlinkViolation,
            SafeShellError::Sandbox(SandboxErr::Timeout(_)) => ErrorCode::Timeout,
            SafeShellError::Sandbox(_) => ErrorCode::ExecutionError,
            SafeShellError::ExecutionError(_) => ErrorCode::ExecutionError,
            SafeShellError::ConfigError(_) => ErrorCode::ConfigError,
            SafeShellError::ImportNotAllowed(_) => ErrorCode::ImportNotAllowed,
            SafeShellError::ShellNotFound(_) => ErrorCode::ShellNotFound,
            SafeShellError::ScriptNotFound(_, _) => ErrorCode::ScriptNotFound,
            SafeShellError::RetryNotFound(_) => ErrorCode::RetryNotFound,
            SafeShellError::Io(_) => ErrorCode::ExecutionError,
            SafeShellError::Json(_) => ErrorCode::ExecutionError,
            SafeShellError::TomlDe(_) | SafeShellError::TomlSer(_) => ErrorCode::ConfigError,
            #[cfg(target_os = "linux")]
            SafeShellError::LandlockRuleset(_) | SafeShellError::LandlockPathFd(_) => {
                ErrorCode::ExecutionError
            }
            SafeShellError::TokioJoin(_) => ErrorCode::ExecutionError,
        }
    }

    /// Converts this error into the structured body the dispatcher surfaces
    /// to callers. `suggestion` is filled in by call sites that have the
    /// effective config in scope (see `registry::ValidationError::suggestion`).
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn error_body_serializes_screaming_snake_case_code() {
        let body = ErrorBody::new(ErrorCode::CommandNotWhitelisted, "curl is not whitelisted")
            .with_suggestion("add 'curl' to external.curl.allow");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "COMMAND_NOT_WHITELISTED");
        assert_eq!(
            json["suggestion"],
            "add 'curl' to external.curl.allow"
        );
    }

    #[test]
    fn timeout_sandbox_error_maps_to_timeout_code() {
        let err = SafeShellError::Sandbox(SandboxErr::Timeout(100));
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.to_string(), "sandbox error: timed out after 100ms");
    }
}
