//! Shell/script/job store (component D): the single in-process authority
//! for long-lived shells, the scripts they ran, and the jobs each script
//! spawned.
//!
//! Uses a `Mutex<HashMap<Id, T>>` per level, atomic id allocation, and
//! handlers that never hold the map lock across an `.await`, across a
//! three-level `Shell -> Script -> Job` hierarchy. Persistence is a
//! versioned snapshot-to-JSON write, tolerant of a missing file on first
//! run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Result, SafeShellError};
use crate::limits::{MAX_SCRIPTS_PER_SHELL, MAX_SHELLS};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// A bounded ring buffer retaining the most recent bytes (and, independently,
/// the most recent lines) written to it. Caps on both bytes and lines,
/// retaining the tail and setting a truncation flag rather than discarding
/// past the cap silently.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    truncated: bool,
    byte_limit: usize,
    line_limit: usize,
}

impl OutputBuffer {
    pub fn new(byte_limit: usize, line_limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            truncated: false,
            byte_limit,
            line_limit,
        }
    }

    /// Appends `chunk`, trimming from the front once either cap is exceeded.
    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        let mut trimmed = false;
        if self.bytes.len() > self.byte_limit {
            let drop = self.bytes.len() - self.byte_limit;
            self.bytes.drain(0..drop);
            trimmed = true;
        }
        let line_count = bytecount_newlines(&self.bytes);
        if line_count > self.line_limit {
            if let Some(cut) = nth_newline_offset(&self.bytes, line_count - self.line_limit) {
                self.bytes.drain(0..=cut);
                trimmed = true;
            }
        }
        if trimmed {
            self.truncated = true;
        }
    }

    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes from `since` onward, for the incremental `getScriptOutput` read.
    pub fn since(&self, since: usize) -> &[u8] {
        if since >= self.bytes.len() {
            &[]
        } else {
            &self.bytes[since..]
        }
    }
}

fn bytecount_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}

fn nth_newline_offset(buf: &[u8], n: usize) -> Option<usize> {
    buf.iter()
        .enumerate()
        .filter(|(_, &b)| b == b'\n')
        .nth(n - 1)
        .map(|(i, _)| i)
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub script_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn to_view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            script_id: self.script_id.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            pid: self.pid,
            status: self.status,
            exit_code: self.exit_code,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self
                .completed_at
                .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub script_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub id: String,
    pub code: String,
    pub pid: Option<u32>,
    pub status: ScriptStatus,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub background: bool,
    pub job_ids: Vec<String>,
}

impl Script {
    fn to_view(&self, code_preview_len: Option<usize>) -> ScriptView {
        let code = match code_preview_len {
            Some(limit) if self.code.len() > limit => {
                format!("{}...", &self.code[..limit])
            }
            _ => self.code.clone(),
        };
        ScriptView {
            id: self.id.clone(),
            code,
            pid: self.pid,
            status: self.status,
            stdout: self.stdout.as_str(),
            stderr: self.stderr.as_str(),
            stdout_truncated: self.stdout.truncated(),
            stderr_truncated: self.stderr.truncated(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self
                .completed_at
                .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64),
            exit_code: self.exit_code,
            background: self.background,
            job_ids: self.job_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptView {
    pub id: String,
    pub code: String,
    pub pid: Option<u32>,
    pub status: ScriptStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub background: bool,
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptFilter {
    #[serde(default)]
    pub status: Option<ScriptStatus>,
    #[serde(default)]
    pub background: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Preview length applied to `code` in `listScripts` responses (§6);
    /// `None` returns the full source.
    #[serde(default)]
    pub code_preview_len: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Shell {
    pub id: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub vars: HashMap<String, Value>,
    pub scripts: HashMap<String, Script>,
    pub scripts_by_pid: HashMap<u32, String>,
    pub jobs: HashMap<String, Job>,
    pub session_allowed_commands: std::collections::HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    script_sequence: u64,
}

impl Shell {
    fn to_view(&self) -> ShellView {
        ShellView {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            vars: self.vars.clone(),
            script_count: self.scripts.len(),
            job_count: self.jobs.len(),
            session_allowed_commands: self.session_allowed_commands.iter().cloned().collect(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellView {
    pub id: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub vars: HashMap<String, Value>,
    pub script_count: usize,
    pub job_count: usize,
    pub session_allowed_commands: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Options accepted by `create`/`getOrCreate`.
#[derive(Debug, Clone, Default)]
pub struct ShellDefaults {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Patch applied atomically by `update`.
#[derive(Debug, Clone, Default)]
pub struct ShellPatch {
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub vars: Option<HashMap<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    shells: Vec<PersistedShell>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedShell {
    id: String,
    cwd: PathBuf,
    env: HashMap<String, String>,
    vars: HashMap<String, Value>,
    scripts: Vec<PersistedScript>,
    session_allowed_commands: Vec<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedScript {
    id: String,
    code: String,
    pid: Option<u32>,
    status: ScriptStatus,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    background: bool,
    job_ids: Vec<String>,
}

/// The store's single lock wraps a plain struct of maps; every public
/// operation takes and releases the lock within itself so no caller ever
/// holds it across an `.await` boundary on its own.
pub struct Store {
    inner: Mutex<HashMap<String, Shell>>,
    next_shell_id: AtomicU64,
    state_path: Option<PathBuf>,
}

impl Store {
    pub fn new(state_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_shell_id: AtomicU64::new(1),
            state_path,
        }
    }

    fn alloc_shell_id(&self) -> String {
        let n = self.next_shell_id.fetch_add(1, Ordering::SeqCst);
        format!("shell-{n}")
    }

    pub async fn create(&self, defaults: ShellDefaults) -> Result<ShellView> {
        let mut shells = self.inner.lock().await;
        if shells.len() >= MAX_SHELLS {
            return Err(SafeShellError::ExecutionError(format!(
                "cannot create more than {MAX_SHELLS} shells"
            )));
        }
        let id = self.alloc_shell_id();
        let now = Utc::now();
        let shell = Shell {
            id: id.clone(),
            cwd: defaults.cwd.unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
            }),
            env: defaults.env,
            vars: HashMap::new(),
            scripts: HashMap::new(),
            scripts_by_pid: HashMap::new(),
            jobs: HashMap::new(),
            session_allowed_commands: std::collections::HashSet::new(),
            created_at: now,
            last_activity_at: now,
            script_sequence: 0,
        };
        let view = shell.to_view();
        shells.insert(id, shell);
        Ok(view)
    }

    pub async fn get(&self, id: &str) -> Result<ShellView> {
        let shells = self.inner.lock().await;
        shells
            .get(id)
            .map(Shell::to_view)
            .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<ShellView> {
        let shells = self.inner.lock().await;
        shells.values().map(Shell::to_view).collect()
    }

    /// Returns the shell's id if it existed (and creates it with `defaults`
    /// when `id` is `None`); errors if `id` is `Some` and unknown.
    pub async fn get_or_create(
        &self,
        id: Option<&str>,
        defaults: ShellDefaults,
    ) -> Result<ShellView> {
        match id {
            Some(id) => self.get(id).await,
            None => self.create(defaults).await,
        }
    }

    pub async fn update(&self, id: &str, patch: ShellPatch) -> Result<ShellView> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(id)
            .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))?;
        if let Some(cwd) = patch.cwd {
            shell.cwd = cwd;
        }
        if let Some(env) = patch.env {
            shell.env = env;
        }
        if let Some(vars) = patch.vars {
            shell.vars = vars;
        }
        shell.last_activity_at = Utc::now();
        Ok(shell.to_view())
    }

    /// Merges `vars`/`cwd` updates produced by a script's epilogue.
    /// Last-writer-wins under concurrent scripts; the lock is held only for
    /// this merge, not for the script's whole execution.
    pub async fn merge_epilogue(
        &self,
        id: &str,
        vars: HashMap<String, Value>,
        cwd: Option<PathBuf>,
    ) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(id)
            .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))?;
        shell.vars.extend(vars);
        if let Some(cwd) = cwd {
            shell.cwd = cwd;
        }
        shell.last_activity_at = Utc::now();
        Ok(())
    }

    /// Ends a shell, cancelling any running scripts first (SIGTERM, 5s
    /// grace, then SIGKILL) and removing it from the store.
    pub async fn end(&self, id: &str) -> Result<()> {
        let running_pids: Vec<u32> = {
            let shells = self.inner.lock().await;
            let shell = shells
                .get(id)
                .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))?;
            shell
                .scripts
                .values()
                .filter(|s| s.status == ScriptStatus::Running)
                .filter_map(|s| s.pid)
                .collect()
        };
        for pid in running_pids {
            terminate_pid(pid).await;
        }
        {
            let mut shells = self.inner.lock().await;
            if let Some(shell) = shells.get_mut(id) {
                for script in shell.scripts.values_mut() {
                    if script.status == ScriptStatus::Running {
                        script.status = ScriptStatus::Failed;
                        script.exit_code = Some(-1);
                        script.completed_at = Some(Utc::now());
                    }
                }
            }
            shells.remove(id);
        }
        Ok(())
    }

    pub async fn add_session_allowed_commands(&self, id: &str, commands: &[String]) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(id)
            .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))?;
        shell
            .session_allowed_commands
            .extend(commands.iter().cloned());
        Ok(())
    }

    pub async fn session_allowed_commands(&self, id: &str) -> Result<Vec<String>> {
        let shells = self.inner.lock().await;
        let shell = shells
            .get(id)
            .ok_or_else(|| SafeShellError::ShellNotFound(id.to_string()))?;
        Ok(shell.session_allowed_commands.iter().cloned().collect())
    }

    /// Registers a freshly-spawned script as `running`, returning its id so
    /// it is queryable before the child has exited.
    pub async fn begin_script(
        &self,
        shell_id: &str,
        code: String,
        pid: Option<u32>,
        background: bool,
    ) -> Result<String> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        shell.script_sequence += 1;
        let id = format!("script-{shell_id}-{}", shell.script_sequence - 1);
        let now = Utc::now();
        shell.scripts.insert(
            id.clone(),
            Script {
                id: id.clone(),
                code,
                pid,
                status: ScriptStatus::Running,
                stdout: OutputBuffer::new(
                    crate::limits::SCRIPT_OUTPUT_BYTE_LIMIT,
                    crate::limits::SCRIPT_OUTPUT_MAX_LINES,
                ),
                stderr: OutputBuffer::new(
                    crate::limits::SCRIPT_OUTPUT_BYTE_LIMIT,
                    crate::limits::SCRIPT_OUTPUT_MAX_LINES,
                ),
                started_at: now,
                completed_at: None,
                exit_code: None,
                background,
                job_ids: Vec::new(),
            },
        );
        if let Some(pid) = pid {
            shell.scripts_by_pid.insert(pid, id.clone());
        }
        evict_oldest_if_needed(shell);
        Ok(id)
    }

    pub async fn append_output(
        &self,
        shell_id: &str,
        script_id: &str,
        stdout_chunk: &[u8],
        stderr_chunk: &[u8],
    ) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        let script = shell
            .scripts
            .get_mut(script_id)
            .ok_or_else(|| SafeShellError::ScriptNotFound(script_id.to_string(), shell_id.to_string()))?;
        if !stdout_chunk.is_empty() {
            script.stdout.push(stdout_chunk);
        }
        if !stderr_chunk.is_empty() {
            script.stderr.push(stderr_chunk);
        }
        Ok(())
    }

    /// Transitions a script to a terminal state exactly once; a second call
    /// (e.g. a background task racing a `killScript`) is a no-op.
    pub async fn complete_script(
        &self,
        shell_id: &str,
        script_id: &str,
        status: ScriptStatus,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        let script = shell
            .scripts
            .get_mut(script_id)
            .ok_or_else(|| SafeShellError::ScriptNotFound(script_id.to_string(), shell_id.to_string()))?;
        if script.status != ScriptStatus::Running {
            return Ok(());
        }
        script.status = status;
        script.exit_code = exit_code;
        script.completed_at = Some(Utc::now());
        Ok(())
    }

    pub async fn get_script(&self, shell_id: &str, script_id: &str) -> Result<ScriptView> {
        let shells = self.inner.lock().await;
        let shell = shells
            .get(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        shell
            .scripts
            .get(script_id)
            .map(|s| s.to_view(None))
            .ok_or_else(|| SafeShellError::ScriptNotFound(script_id.to_string(), shell_id.to_string()))
    }

    pub async fn get_script_output_since(
        &self,
        shell_id: &str,
        script_id: &str,
        since: usize,
    ) -> Result<(String, String, usize, ScriptStatus, Option<i32>, bool, bool)> {
        let shells = self.inner.lock().await;
        let shell = shells
            .get(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        let script = shell
            .scripts
            .get(script_id)
            .ok_or_else(|| SafeShellError::ScriptNotFound(script_id.to_string(), shell_id.to_string()))?;
        let stdout = String::from_utf8_lossy(script.stdout.since(since)).into_owned();
        let total_len = script.stdout.len();
        let stderr = String::from_utf8_lossy(script.stderr.since(since.min(script.stderr.len())))
            .into_owned();
        Ok((
            stdout,
            stderr,
            total_len,
            script.status,
            script.exit_code,
            script.stdout.truncated(),
            script.stderr.truncated(),
        ))
    }

    pub async fn list_scripts(&self, shell_id: &str, filter: &ScriptFilter) -> Result<Vec<ScriptView>> {
        let shells = self.inner.lock().await;
        let shell = shells
            .get(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        let mut scripts: Vec<&Script> = shell.scripts.values().collect();
        scripts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let mut views: Vec<ScriptView> = scripts
            .into_iter()
            .filter(|s| filter.status.is_none_or(|st| st == s.status))
            .filter(|s| filter.background.is_none_or(|bg| bg == s.background))
            .map(|s| s.to_view(filter.code_preview_len))
            .collect();
        if let Some(limit) = filter.limit {
            views.truncate(limit);
        }
        Ok(views)
    }

    /// Records a job started by a script, keyed by its own id.
    pub async fn upsert_job_started(
        &self,
        shell_id: &str,
        job: Job,
    ) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        if let Some(script) = shell.scripts.get_mut(&job.script_id) {
            if !script.job_ids.contains(&job.id) {
                script.job_ids.push(job.id.clone());
            }
        }
        shell.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub async fn complete_job(
        &self,
        shell_id: &str,
        job_id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let mut shells = self.inner.lock().await;
        let shell = shells
            .get_mut(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        if let Some(job) = shell.jobs.get_mut(job_id) {
            job.status = status;
            job.exit_code = exit_code;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn list_jobs(&self, shell_id: &str, filter: &JobFilter) -> Result<Vec<JobView>> {
        let shells = self.inner.lock().await;
        let shell = shells
            .get(shell_id)
            .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
        let mut jobs: Vec<&Job> = shell.jobs.values().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let mut views: Vec<JobView> = jobs
            .into_iter()
            .filter(|j| {
                filter
                    .script_id
                    .as_deref()
                    .is_none_or(|sid| sid == j.script_id)
            })
            .filter(|j| filter.status.is_none_or(|st| st == j.status))
            .map(Job::to_view)
            .collect();
        if let Some(limit) = filter.limit {
            views.truncate(limit);
        }
        Ok(views)
    }

    /// Signals `script_id`'s process, waits up to 5s, then forces SIGKILL.
    /// Works uniformly for live and restored-but-still-alive scripts since
    /// it signals by pid rather than through an owned `Child` handle.
    pub async fn kill_script(&self, shell_id: &str, script_id: &str, signal: i32) -> Result<()> {
        let pid = {
            let shells = self.inner.lock().await;
            let shell = shells
                .get(shell_id)
                .ok_or_else(|| SafeShellError::ShellNotFound(shell_id.to_string()))?;
            let script = shell.scripts.get(script_id).ok_or_else(|| {
                SafeShellError::ScriptNotFound(script_id.to_string(), shell_id.to_string())
            })?;
            script.pid
        };
        if let Some(pid) = pid {
            send_signal(pid, signal);
            wait_for_exit_or_kill(pid).await;
        }
        self.complete_script(shell_id, script_id, ScriptStatus::Failed, Some(-1))
            .await
    }

    /// Polls `script_id` at `<=200ms` intervals until it reaches a terminal
    /// state or `timeout` elapses.
    pub async fn wait_script(
        &self,
        shell_id: &str,
        script_id: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<ScriptView>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.get_script(shell_id, script_id).await?;
            if view.status != ScriptStatus::Running {
                return Ok(Some(view));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Persists every shell to `state_path` as a single JSON snapshot.
    /// Single-writer discipline: callers should not invoke this
    /// concurrently with itself (the dispatcher's persistence task is the
    /// only caller in practice, matching §5's "single flush outstanding").
    pub async fn snapshot(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let shells = self.inner.lock().await;
        let persisted = PersistedState {
            schema_version: SCHEMA_VERSION,
            shells: shells
                .values()
                .map(|shell| PersistedShell {
                    id: shell.id.clone(),
                    cwd: shell.cwd.clone(),
                    env: shell.env.clone(),
                    vars: shell.vars.clone(),
                    scripts: shell
                        .scripts
                        .values()
                        .map(|s| PersistedScript {
                            id: s.id.clone(),
                            code: s.code.clone(),
                            pid: s.pid,
                            status: s.status,
                            stdout: s.stdout.as_str(),
                            stderr: s.stderr.as_str(),
                            stdout_truncated: s.stdout.truncated(),
                            stderr_truncated: s.stderr.truncated(),
                            started_at: s.started_at,
                            completed_at: s.completed_at,
                            exit_code: s.exit_code,
                            background: s.background,
                            job_ids: s.job_ids.clone(),
                        })
                        .collect(),
                    session_allowed_commands: shell
                        .session_allowed_commands
                        .iter()
                        .cloned()
                        .collect(),
                    created_at: shell.created_at,
                    last_activity_at: shell.last_activity_at,
                })
                .collect(),
        };
        drop(shells);
        let json = serde_json::to_string_pretty(&persisted)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Restores shells from `state_path`. Scripts whose pid is no longer
    /// alive are marked `failed` with `exitCode = -1`; scripts whose pid is
    /// still alive become observer records (status frozen until killed or
    /// polled by `waitScript`). A schema-version mismatch discards the file
    /// entirely rather than attempting a partial migration.
    pub async fn restore(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedState = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        if persisted.schema_version != SCHEMA_VERSION {
            return Ok(());
        }

        let mut shells = self.inner.lock().await;
        let mut max_seq = 0u64;
        for ps in persisted.shells {
            let mut scripts = HashMap::new();
            let mut scripts_by_pid = HashMap::new();
            for s in ps.scripts {
                let still_alive = s.pid.is_some_and(pid_is_alive);
                let (status, exit_code, completed_at) = if s.status == ScriptStatus::Running
                    && !still_alive
                {
                    (ScriptStatus::Failed, Some(-1), Some(Utc::now()))
                } else {
                    (s.status, s.exit_code, s.completed_at)
                };
                if let Some(n) = s.id.rsplit('-').next().and_then(|n| n.parse::<u64>().ok()) {
                    max_seq = max_seq.max(n + 1);
                }
                if let Some(pid) = s.pid {
                    scripts_by_pid.insert(pid, s.id.clone());
                }
                let mut stdout = OutputBuffer::new(
                    crate::limits::SCRIPT_OUTPUT_BYTE_LIMIT,
                    crate::limits::SCRIPT_OUTPUT_MAX_LINES,
                );
                stdout.push(s.stdout.as_bytes());
                stdout.truncated = s.stdout_truncated;
                let mut stderr = OutputBuffer::new(
                    crate::limits::SCRIPT_OUTPUT_BYTE_LIMIT,
                    crate::limits::SCRIPT_OUTPUT_MAX_LINES,
                );
                stderr.push(s.stderr.as_bytes());
                stderr.truncated = s.stderr_truncated;
                scripts.insert(
                    s.id.clone(),
                    Script {
                        id: s.id,
                        code: s.code,
                        pid: s.pid,
                        status,
                        stdout,
                        stderr,
                        started_at: s.started_at,
                        completed_at,
                        exit_code,
                        background: s.background,
                        job_ids: s.job_ids,
                    },
                );
            }
            shells.insert(
                ps.id.clone(),
                Shell {
                    id: ps.id,
                    cwd: ps.cwd,
                    env: ps.env,
                    vars: ps.vars,
                    scripts,
                    scripts_by_pid,
                    jobs: HashMap::new(),
                    session_allowed_commands: ps.session_allowed_commands.into_iter().collect(),
                    created_at: ps.created_at,
                    last_activity_at: ps.last_activity_at,
                    script_sequence: max_seq,
                },
            );
        }
        Ok(())
    }
}

fn evict_oldest_if_needed(shell: &mut Shell) {
    if shell.scripts.len() <= MAX_SCRIPTS_PER_SHELL {
        return;
    }
    let mut ids: Vec<(String, DateTime<Utc>)> = shell
        .scripts
        .iter()
        .filter(|(_, s)| s.status != ScriptStatus::Running)
        .map(|(id, s)| (id.clone(), s.started_at))
        .collect();
    ids.sort_by_key(|(_, started)| *started);
    while shell.scripts.len() > MAX_SCRIPTS_PER_SHELL {
        let Some((id, _)) = ids.first().cloned() else {
            break;
        };
        ids.remove(0);
        shell.scripts.remove(&id);
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}

async fn wait_for_exit_or_kill(pid: u32) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while pid_is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            send_signal(pid, libc::SIGKILL);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

async fn terminate_pid(pid: u32) {
    send_signal(pid, libc::SIGTERM);
    wait_for_exit_or_kill(pid).await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = Store::new(None);
        let shell = store.create(ShellDefaults::default()).await.unwrap();
        let fetched = store.get(&shell.id).await.unwrap();
        assert_eq!(shell.id, fetched.id);
    }

    #[tokio::test]
    async fn get_unknown_shell_fails() {
        let store = Store::new(None);
        let err = store.get("shell-999").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ShellNotFound);
    }

    #[tokio::test]
    async fn output_buffer_truncates_and_retains_tail() {
        let mut buf = OutputBuffer::new(8, 100);
        buf.push(b"0123456789");
        assert!(buf.truncated());
        assert_eq!(buf.as_str(), "23456789");
    }

    #[tokio::test]
    async fn begin_and_complete_script_transitions_once() {
        let store = Store::new(None);
        let shell = store.create(ShellDefaults::default()).await.unwrap();
        let script_id = store
            .begin_script(&shell.id, "1+1".to_string(), None, false)
            .await
            .unwrap();
        let view = store.get_script(&shell.id, &script_id).await.unwrap();
        assert_eq!(view.status, ScriptStatus::Running);

        store
            .complete_script(&shell.id, &script_id, ScriptStatus::Completed, Some(0))
            .await
            .unwrap();
        store
            .complete_script(&shell.id, &script_id, ScriptStatus::Failed, Some(1))
            .await
            .unwrap();
        let view = store.get_script(&shell.id, &script_id).await.unwrap();
        assert_eq!(view.status, ScriptStatus::Completed);
        assert_eq!(view.exit_code, Some(0));
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trips_except_live_process_state() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let store = Store::new(Some(state_path.clone()));
        let shell = store.create(ShellDefaults::default()).await.unwrap();
        let script_id = store
            .begin_script(&shell.id, "echo hi".to_string(), Some(999_999), true)
            .await
            .unwrap();
        store
            .append_output(&shell.id, &script_id, b"hi\n", b"")
            .await
            .unwrap();
        store.snapshot().await.unwrap();

        let restored = Store::new(Some(state_path));
        restored.restore().await.unwrap();
        let view = restored.get_script(&shell.id, &script_id).await.unwrap();
        // pid 999_999 should not be alive on the test host.
        assert_eq!(view.status, ScriptStatus::Failed);
        assert_eq!(view.exit_code, Some(-1));
        assert_eq!(view.stdout, "hi\n");
    }

    #[tokio::test]
    async fn list_scripts_orders_newest_first_and_applies_limit() {
        let store = Store::new(None);
        let shell = store.create(ShellDefaults::default()).await.unwrap();
        for i in 0..3 {
            store
                .begin_script(&shell.id, format!("echo {i}"), None, false)
                .await
                .unwrap();
        }
        let filter = ScriptFilter {
            limit: Some(2),
            ..Default::default()
        };
        let scripts = store.list_scripts(&shell.id, &filter).await.unwrap();
        assert_eq!(scripts.len(), 2);
    }
}
