//! Wire types for the §6 tool surface: one request/response struct pair per
//! entry in the table (`run`, `startShell`, `updateShell`, `endShell`,
//! `listShells`, `listScripts`, `getScriptOutput`, `killScript`,
//! `waitScript`, `listJobs`).
//!
//! Uses a `#[serde(tag = "type", rename_all = "snake_case")]` tagged enum for
//! the `RunInput` union and `#[serde(rename_all = "camelCase")]` on plain
//! request/response structs (`shellId`, `retry_id`, ...). The transport that
//! would wrap these in a JSON-RPC envelope is out of scope; these are just
//! the payload shapes a binding would serialize.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorBody;
use crate::store::{JobFilter, JobView, ScriptFilter, ScriptView, ShellView};

/// One external command invocation the upstream parser found referenced in
/// a snippet. Extracting these from shell/AWK/script syntax is the parser's
/// job, out of scope here; this crate only validates the invocations it is
/// handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One of the four mutually exclusive snippet sources `run` accepts, or a
/// `retry_id` resuming a blocked request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub shcmd: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub retry_id: Option<String>,
    #[serde(default)]
    pub shell_id: Option<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 1 (once) | 2 (session) | 3 (always); only meaningful with `retry_id`.
    #[serde(default)]
    pub user_choice: Option<u8>,
    /// External commands the upstream parser found inside `code`/`file`/
    /// `module` snippets. `shcmd` never needs this: the dispatcher recovers
    /// its single invocation directly from the shell-command string.
    #[serde(default)]
    pub referenced_commands: Vec<ReferencedCommand>,
}

impl RunRequest {
    /// Exactly one of `code`/`shcmd`/`file`/`module`/`retry_id` must be set;
    /// returns the snippet source that was supplied, or an error describing
    /// the violation.
    pub fn snippet_source(&self) -> Result<SnippetSource<'_>, String> {
        let candidates = [
            self.code.as_deref().map(SnippetSource::Code),
            self.shcmd.as_deref().map(SnippetSource::ShellCommand),
            self.file.as_deref().map(SnippetSource::File),
            self.module.as_deref().map(SnippetSource::Module),
        ];
        let present: Vec<SnippetSource<'_>> = candidates.into_iter().flatten().collect();
        if self.retry_id.is_some() {
            if !present.is_empty() {
                return Err("retry_id is mutually exclusive with code/shcmd/file/module".into());
            }
            return Err("retry_id has no snippet source of its own".into());
        }
        let mut present = present;
        match (present.pop(), present.is_empty()) {
            (Some(source), true) => Ok(source),
            (None, _) => Err("one of code, shcmd, file, module, or retry_id is required".into()),
            (Some(_), false) => Err("code, shcmd, file, and module are mutually exclusive".into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SnippetSource<'a> {
    Code(&'a str),
    ShellCommand(&'a str),
    File(&'a str),
    Module(&'a str),
}

/// Successful `run` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSuccess {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub shell_id: String,
    pub script_id: String,
    pub pid: Option<u32>,
    pub success: bool,
}

/// Blocked `run` response: one or more commands require a permission
/// decision before the snippet can execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBlocked {
    pub error: ErrorBody,
    pub retry_id: String,
    pub hint: String,
    pub commands: Vec<String>,
    pub not_found_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunResponse {
    Success(RunSuccess),
    Blocked(RunBlocked),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartShellRequest {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateShellRequest {
    pub shell_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndShellRequest {
    pub shell_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndShellResponse {
    pub shell_id: String,
    pub ended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListShellsResponse {
    pub shells: Vec<ShellView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListScriptsRequest {
    pub shell_id: String,
    #[serde(default)]
    pub filter: ScriptFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListScriptsResponse {
    pub scripts: Vec<ScriptView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetScriptOutputRequest {
    pub shell_id: String,
    pub script_id: String,
    #[serde(default)]
    pub since: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetScriptOutputResponse {
    pub stdout: String,
    pub stderr: String,
    pub offset: usize,
    pub status: String,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillScriptRequest {
    pub shell_id: String,
    pub script_id: String,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillScriptResponse {
    pub killed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitScriptRequest {
    pub shell_id: String,
    pub script_id: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitScriptResponse {
    pub script: Option<ScriptView>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsRequest {
    pub shell_id: String,
    #[serde(default)]
    pub filter: JobFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    pub jobs: Vec<JobView>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn snippet_source_requires_exactly_one_field() {
        let empty = RunRequest {
            code: None,
            shcmd: None,
            file: None,
            module: None,
            retry_id: None,
            shell_id: None,
            background: false,
            timeout: None,
            env: HashMap::new(),
            user_choice: None,
            referenced_commands: Vec::new(),
        };
        assert!(empty.snippet_source().is_err());

        let mut one = empty.clone();
        one.code = Some("1+1".to_string());
        assert!(matches!(one.snippet_source(), Ok(SnippetSource::Code("1+1"))));

        let mut both = one.clone();
        both.shcmd = Some("ls".to_string());
        assert!(both.snippet_source().is_err());
    }

    #[test]
    fn run_response_round_trips_blocked_variant_through_json() {
        let blocked = RunBlocked {
            error: ErrorBody::new(crate::error::ErrorCode::CommandNotWhitelisted, "curl"),
            retry_id: "r1".to_string(),
            hint: "ask the user".to_string(),
            commands: vec!["curl".to_string()],
            not_found_commands: Vec::new(),
        };
        let value = serde_json::to_value(RunResponse::Blocked(blocked)).unwrap();
        assert_eq!(value["retryId"], "r1");
        assert_eq!(value["commands"][0], "curl");
    }
}
