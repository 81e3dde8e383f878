//! Sandbox launcher (component C): materializes a snippet + preamble to a
//! temp file, computes capability flags, spawns a child runtime, streams
//! output, enforces a deadline, and parses the child's side-channel
//! diagnostic events.
//!
//! Uses a filtered `tokio::process::Command`, bounded ring-buffer output
//! collection, a `tokio::select!` deadline-vs-exit race, and, on Linux,
//! Landlock + seccomp (applied on a dedicated thread before
//! `exec`).

pub mod preamble;

#[cfg(target_os = "linux")]
pub mod linux;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Result, SafeShellError, SandboxErr};
use crate::limits::{SCRIPT_OUTPUT_BYTE_LIMIT, SCRIPT_OUTPUT_MAX_LINES};
use crate::policy::{expand, Config, NetPermission};
use crate::sandbox::preamble::{extract_epilogue, extract_job_events, render_full_script, JobEvent};

/// The effective permission set handed to the child runtime, derived from
/// config and the current shell state.
#[derive(Debug, Clone)]
pub struct CapabilityFlags {
    pub read: Vec<PathBuf>,
    pub write: Vec<PathBuf>,
    pub net: NetPermission,
    pub run: Vec<String>,
    pub env: HashMap<String, String>,
}

impl CapabilityFlags {
    pub fn is_net_unrestricted(&self) -> bool {
        self.net.is_unrestricted()
    }
}

/// A single immutable-after-insert cache of "does this command exist on the
/// host" lookups, keyed by a sorted tuple of names so the same `run` list
/// always hits the same entry. Entries never expire within a process
/// lifetime.
static EXISTING_COMMAND_CACHE: LazyLock<AsyncMutex<HashMap<Vec<String>, Vec<String>>>> =
    LazyLock::new(|| AsyncMutex::new(HashMap::new()));

/// Filters `run` down to commands that exist on `$PATH`, caching the result
/// for the exact sorted input tuple so repeated launches of the same
/// config don't re-probe the filesystem (and don't spam the child with
/// warnings about unavailable commands).
async fn filter_existing_commands(run: &[String]) -> Vec<String> {
    let mut key = run.to_vec();
    key.sort();
    {
        let cache = EXISTING_COMMAND_CACHE.lock().await;
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
    }
    let existing: Vec<String> = run
        .iter()
        .filter(|name| command_exists_on_host(name))
        .cloned()
        .collect();
    EXISTING_COMMAND_CACHE
        .lock()
        .await
        .insert(key, existing.clone());
    existing
}

/// `pub(crate)` so the dispatcher's multi-command preflight can classify a
/// blocked command as "not found" rather than merely "not whitelisted"
/// before creating a pending retry.
pub(crate) fn command_exists_on_host(name: &str) -> bool {
    if Path::new(name).is_absolute() {
        return Path::new(name).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).exists())
        })
        .unwrap_or(false)
}

/// Computes the capability flags a child gets for this launch: expanded
/// read/write roots (plus the temp dir and the core's own stdlib dir so
/// preamble imports resolve), the net policy, the existence-filtered `run`
/// list, and the env allow-list plus the two ambient `SAFESH_*` variables,
/// with mask patterns applied last so they always win.
pub async fn compute_capability_flags(
    config: &Config,
    cwd: &Path,
    home: &Path,
    shell_id: &str,
    script_id: &str,
    temp_dir: &Path,
    stdlib_dir: &Path,
) -> CapabilityFlags {
    let mut read: Vec<PathBuf> = config
        .permissions
        .read
        .iter()
        .map(|p| expand(p, cwd, home))
        .collect();
    let mut write: Vec<PathBuf> = config
        .permissions
        .write
        .iter()
        .map(|p| expand(p, cwd, home))
        .collect();
    read.push(temp_dir.to_path_buf());
    write.push(temp_dir.to_path_buf());
    read.push(stdlib_dir.to_path_buf());

    let run = filter_existing_commands(&config.permissions.run).await;

    let mut env: HashMap<String, String> = HashMap::new();
    for key in &config.permissions.env {
        if config.env.exposes(key) {
            if let Ok(val) = std::env::var(key) {
                env.insert(key.clone(), val);
            }
        }
    }
    env.insert("SAFESH_SHELL_ID".to_string(), shell_id.to_string());
    env.insert("SAFESH_SCRIPT_ID".to_string(), script_id.to_string());
    if let Some(project_dir) = &config.project_dir {
        env.insert(
            "SAFESH_PROJECT_DIR".to_string(),
            project_dir.to_string_lossy().into_owned(),
        );
    }
    env.retain(|key, _| !crate::policy::match_mask(key, &config.env.mask));

    CapabilityFlags {
        read,
        write,
        net: config.permissions.net.clone(),
        run,
        env,
    }
}

/// Computes the sha256 content hash of the fully materialized script
/// (preamble + user code + epilogue) and returns `(hash_hex, file_path)`.
/// Identical inputs reuse the same temp file.
pub async fn materialize_script(
    temp_dir: &Path,
    full_script: &str,
    extension: &str,
) -> Result<(String, PathBuf)> {
    tokio::fs::create_dir_all(temp_dir).await?;
    let mut hasher = Sha256::new();
    hasher.update(full_script.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    let path = temp_dir.join(format!("{hash}.{extension}"));
    if !path.exists() {
        tokio::fs::write(&path, full_script).await?;
    }
    Ok((hash, path))
}

/// Parameters for one snippet execution.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub shell_id: String,
    pub script_id: String,
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub project_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub vars: HashMap<String, serde_json::Value>,
    pub code: String,
    pub timeout_ms: u64,
    pub vfs_enabled: bool,
    pub temp_dir: PathBuf,
    pub stdlib_dir: PathBuf,
    /// Path to the `safeshell-linux-sandbox` helper binary; `None` disables
    /// Landlock/seccomp enforcement (non-Linux hosts, or tests).
    pub linux_sandbox_helper: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub pid: Option<u32>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub vars: HashMap<String, serde_json::Value>,
    pub cwd: Option<PathBuf>,
    pub jobs: Vec<JobEvent>,
}

/// Runs one snippet end to end: render + materialize the script, compute
/// capability flags, spawn (optionally under the Linux sandbox helper),
/// collect bounded output under a deadline, then post-process the epilogue
/// sentinel and job-event side channel. Used for foreground execution,
/// where the caller awaits the whole lifetime of the child.
pub async fn execute(request: ExecuteRequest, config: &Config) -> Result<ExecuteOutcome> {
    let timeout_ms = request.timeout_ms;
    let child = prepare_and_spawn(&request, config).await?;
    finish(child.child, timeout_ms).await
}

/// A spawned, not-yet-collected child, plus the pid the caller needs
/// immediately (e.g. to register a background script with the store before
/// its output has finished arriving).
pub struct SpawnedChild {
    pub child: Child,
    pub pid: Option<u32>,
}

/// Renders, materializes, computes capability flags, and spawns the child,
/// without waiting for it to produce any output. Split out from [`execute`]
/// so background scripts, which run until explicitly killed, can hand the
/// pid back to a caller immediately while output collection continues on a
/// detached task.
pub async fn prepare_and_spawn(request: &ExecuteRequest, config: &Config) -> Result<SpawnedChild> {
    let full_script = render_full_script(
        &request.shell_id,
        &request.script_id,
        &request.cwd.to_string_lossy(),
        request.project_dir.as_deref().map(|p| p.to_str().unwrap_or_default()),
        &request.env,
        &request.vars,
        request.vfs_enabled,
        &request.code,
    );
    let (_hash, script_path) =
        materialize_script(&request.temp_dir, &full_script, "ext").await?;

    let flags = compute_capability_flags(
        config,
        &request.cwd,
        &request.home,
        &request.shell_id,
        &request.script_id,
        &request.temp_dir,
        &request.stdlib_dir,
    )
    .await;

    let child = spawn(&script_path, &request.cwd, &flags, request.linux_sandbox_helper.as_deref())
        .map_err(|e| SafeShellError::ExecutionError(e.to_string()))?;
    let pid = child.id();
    Ok(SpawnedChild { child, pid })
}

/// Collects a spawned child's output under `timeout_ms` and post-processes
/// the epilogue/job-event side channels. Foreground callers chain this
/// directly after `prepare_and_spawn`; background callers run it inside a
/// detached task.
pub async fn finish(mut child: Child, timeout_ms: u64) -> Result<ExecuteOutcome> {
    let pid = child.id();
    let deadline = Duration::from_millis(timeout_ms);
    let collected = consume_with_deadline(&mut child, deadline).await?;

    let raw_stdout = String::from_utf8_lossy(&collected.stdout).into_owned();
    let raw_stderr = String::from_utf8_lossy(&collected.stderr).into_owned();

    let (clean_stdout, epilogue) = extract_epilogue(&raw_stdout);
    let (clean_stderr, jobs) = extract_job_events(&raw_stderr);

    let (vars, cwd) = match epilogue {
        Some(update) => (update.vars, update.cwd.map(PathBuf::from)),
        None => (HashMap::new(), None),
    };

    if collected.timed_out {
        return Ok(ExecuteOutcome {
            pid,
            stdout: clean_stdout,
            stderr: format!("{clean_stderr}timed out after {timeout_ms}ms\n"),
            exit_code: -1,
            success: false,
            timed_out: true,
            vars,
            cwd,
            jobs,
        });
    }

    let exit_code = collected.exit_code;
    Ok(ExecuteOutcome {
        pid,
        stdout: clean_stdout,
        stderr: clean_stderr,
        exit_code,
        success: exit_code == 0,
        timed_out: false,
        vars,
        cwd,
        jobs,
    })
}

fn spawn(
    script_path: &Path,
    cwd: &Path,
    flags: &CapabilityFlags,
    linux_sandbox_helper: Option<&Path>,
) -> io::Result<Child> {
    let mut cmd = match (cfg!(target_os = "linux"), linux_sandbox_helper) {
        (true, Some(helper)) => {
            let mut cmd = Command::new(helper);
            cmd.arg("--read")
                .arg(join_paths(&flags.read))
                .arg("--write")
                .arg(join_paths(&flags.write))
                .arg("--net")
                .arg(if flags.is_net_unrestricted() { "all" } else { "none" })
                .arg("--")
                .arg(runtime_executable())
                .arg(script_path);
            cmd
        }
        _ => {
            let mut cmd = Command::new(runtime_executable());
            cmd.arg(script_path);
            cmd
        }
    };

    cmd.current_dir(cwd);
    cmd.env_clear();
    for (key, value) in &flags.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.spawn()
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// The interpreter used to run a materialized script. Which language the
/// snippet is written in is opaque to this crate; it only needs something
/// to exec. Overridable via `SAFESH_RUNTIME` for integration tests that stub
/// it out.
fn runtime_executable() -> String {
    std::env::var("SAFESH_RUNTIME").unwrap_or_else(|_| "deno".to_string())
}

struct RawCollected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    timed_out: bool,
}

/// Concurrently reads stdout/stderr into bounded ring buffers and races the
/// child's exit against `deadline`; on timeout, kills the child and reports
/// `timed_out`.
async fn consume_with_deadline(child: &mut Child, deadline: Duration) -> Result<RawCollected> {
    let stdout_reader = child
        .stdout
        .take()
        .ok_or_else(|| SafeShellError::ExecutionError("stdout pipe not available".to_string()))?;
    let stderr_reader = child
        .stderr
        .take()
        .ok_or_else(|| SafeShellError::ExecutionError("stderr pipe not available".to_string()))?;

    let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_reader)));
    let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_reader)));

    let timed_out;
    let exit_code;
    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            timed_out = false;
            exit_code = status.code().unwrap_or(-1);
        }
        Ok(Err(e)) => return Err(SafeShellError::Io(e)),
        Err(_) => {
            child
                .start_kill()
                .map_err(|e| SafeShellError::Sandbox(SandboxErr::Signal(e.raw_os_error().unwrap_or(9))))?;
            timed_out = true;
            exit_code = -1;
        }
    }

    let stdout = stdout_handle.await.map_err(SafeShellError::TokioJoin)??;
    let stderr = stderr_handle.await.map_err(SafeShellError::TokioJoin)??;

    Ok(RawCollected {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 8192];
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > SCRIPT_OUTPUT_BYTE_LIMIT * 2 {
            // Keep reading to EOF to avoid back-pressure on the child, but
            // stop growing the buffer unboundedly;
            // the store's `OutputBuffer` applies the authoritative
            // byte/line cap once this raw buffer is appended.
            let keep_from = buf.len() - SCRIPT_OUTPUT_BYTE_LIMIT;
            buf.drain(0..keep_from);
        }
    }
    let line_count = buf.iter().filter(|&&b| b == b'\n').count();
    if line_count > SCRIPT_OUTPUT_MAX_LINES {
        if let Some(cut) = buf
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == b'\n')
            .nth(line_count - SCRIPT_OUTPUT_MAX_LINES - 1)
            .map(|(i, _)| i)
        {
            buf.drain(0..=cut);
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::policy::{EnvPolicy, Permissions};

    #[tokio::test]
    async fn materialize_script_is_idempotent_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let (hash1, path1) = materialize_script(dir.path(), "console.log(1)", "ext")
            .await
            .unwrap();
        let (hash2, path2) = materialize_script(dir.path(), "console.log(1)", "ext")
            .await
            .unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn materialize_script_differs_for_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let (hash1, _) = materialize_script(dir.path(), "a", "ext").await.unwrap();
        let (hash2, _) = materialize_script(dir.path(), "b", "ext").await.unwrap();
        assert_ne!(hash1, hash2);
    }

    #[tokio::test]
    async fn capability_flags_mask_wins_over_allow() {
        let mut config = Config {
            permissions: Permissions {
                env: vec!["AWS_SECRET_KEY".to_string()],
                ..Default::default()
            },
            env: EnvPolicy {
                allow: vec!["AWS_SECRET_KEY".to_string()],
                mask: vec!["AWS_*".to_string()],
            },
            ..Default::default()
        };
        config.env.allow.push("AWS_SECRET_KEY".to_string());
        std::env::set_var("AWS_SECRET_KEY", "shh");
        let dir = tempfile::tempdir().unwrap();
        let flags = compute_capability_flags(
            &config,
            dir.path(),
            dir.path(),
            "shell-1",
            "script-1",
            dir.path(),
            dir.path(),
        )
        .await;
        assert!(!flags.env.contains_key("AWS_SECRET_KEY"));
        std::env::remove_var("AWS_SECRET_KEY");
    }

    #[tokio::test]
    async fn capability_flags_always_carry_shell_and_script_ids() {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let flags = compute_capability_flags(
            &config, dir.path(), dir.path(), "shell-7", "script-9", dir.path(), dir.path(),
        )
        .await;
        assert_eq!(flags.env.get("SAFESH_SHELL_ID").map(String::as_str), Some("shell-7"));
        assert_eq!(flags.env.get("SAFESH_SCRIPT_ID").map(String::as_str), Some("script-9"));
    }
}
