//! Request dispatcher (component G): the single entry point tying policy,
//! registry, store, retry protocol, sandbox launcher, and task orchestrator
//! together behind the §6 tool surface.
//!
//! One method per request kind, dispatching over a `SessionContext` that
//! holds a single source of mutable state behind locks. The `rootsPromise`
//! await-or-timeout uses a `tokio::sync::Notify` for one-shot readiness
//! signaling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::config::{self, Grants};
use crate::error::{ErrorBody, ErrorCode, Result, SafeShellError};
use crate::policy::Config;
use crate::protocol::{
    EndShellRequest, EndShellResponse, GetScriptOutputRequest, GetScriptOutputResponse,
    KillScriptRequest, KillScriptResponse, ListJobsRequest, ListJobsResponse, ListScriptsRequest,
    ListScriptsResponse, RunBlocked, RunRequest, RunResponse, RunSuccess, SnippetSource,
    StartShellRequest, UpdateShellRequest, WaitScriptRequest, WaitScriptResponse,
};
use crate::registry::{self, Registry};
use crate::retry::{RetryContext, RetryStore, UserChoice};
use crate::sandbox::{self, ExecuteRequest};
use crate::store::{JobStatus, ScriptStatus, ShellDefaults, ShellPatch, ShellView, Store};

/// How long `run`'s "await workspace roots" wait blocks before giving up and
/// proceeding with whatever config is already in hand.
const ROOTS_TIMEOUT: Duration = Duration::from_secs(3);

/// The single mutable session-level state: the effective config, the
/// dispatcher's own notion of "cwd" (distinct from any one shell's cwd;
/// used when a request operates without a `shellId`), and whether workspace
/// roots have been supplied yet.
pub struct SessionContext {
    pub config: Mutex<Config>,
    pub cwd: Mutex<PathBuf>,
    pub roots_received: AtomicBool,
}

/// Paths the dispatcher needs to locate ambient resources (temp scripts,
/// the stdlib the preamble's imports resolve against, and the optional
/// Linux sandbox helper binary). The caller resolves `home` (typically via
/// the `dirs` crate) before constructing this.
pub struct DispatcherPaths {
    pub home: PathBuf,
    pub temp_dir: PathBuf,
    pub stdlib_dir: PathBuf,
    pub linux_sandbox_helper: Option<PathBuf>,
}

pub struct Dispatcher {
    session: SessionContext,
    registry: Mutex<Registry>,
    store: Arc<Store>,
    retries: RetryStore,
    paths: DispatcherPaths,
    roots_notify: Notify,
}

impl Dispatcher {
    pub fn new(config: Config, state_path: Option<PathBuf>, paths: DispatcherPaths) -> Self {
        let registry = Registry::new(&config);
        let retry_ttl_ms = config.retry_ttl_ms;
        let cwd = config
            .project_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));
        Self {
            session: SessionContext {
                config: Mutex::new(config),
                cwd: Mutex::new(cwd),
                roots_received: AtomicBool::new(false),
            },
            registry: Mutex::new(registry),
            store: Arc::new(Store::new(state_path)),
            retries: RetryStore::new(Some(retry_ttl_ms)),
            paths,
            roots_notify: Notify::new(),
        }
    }

    /// Restores persisted shell state from disk, if a state path was given.
    pub async fn restore(&self) -> Result<()> {
        self.store.restore().await
    }

    /// Persists current shell state to disk, if a state path was given.
    pub async fn snapshot(&self) -> Result<()> {
        self.store.snapshot().await
    }

    /// Called once the client has supplied workspace roots: extends
    /// read/write permissions and optionally sets `projectDir`, rebuilds the
    /// registry, and wakes any handler blocked in `await_roots_or_timeout`.
    pub async fn provide_workspace_roots(
        &self,
        read: Vec<String>,
        write: Vec<String>,
        project_dir: Option<PathBuf>,
    ) {
        {
            let mut config = self.session.config.lock().await;
            config.permissions.read.extend(read);
            config.permissions.write.extend(write);
            if let Some(dir) = project_dir {
                config.project_dir = Some(dir);
            }
            let mut registry = self.registry.lock().await;
            registry.rebuild(&config);
        }
        self.session.roots_received.store(true, Ordering::SeqCst);
        self.roots_notify.notify_waiters();
    }

    /// Blocks until workspace roots have arrived or `ROOTS_TIMEOUT` elapses,
    /// whichever is first. All tool handlers call this before doing
    /// anything else.
    async fn await_roots_or_timeout(&self) {
        if self.session.roots_received.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(ROOTS_TIMEOUT, self.roots_notify.notified()).await;
    }

    // -- run -------------------------------------------------------------

    pub async fn run(&self, request: RunRequest) -> Result<RunResponse> {
        self.await_roots_or_timeout().await;

        if request.background && request.shell_id.is_none() {
            return Err(SafeShellError::ConfigError(
                "background execution requires a shellId".to_string(),
            ));
        }

        if let Some(retry_id) = &request.retry_id {
            return self.run_retry(retry_id, &request).await;
        }

        let source = request
            .snippet_source()
            .map_err(SafeShellError::ConfigError)?;

        let config = self.session.config.lock().await.clone();
        let home = self.paths.home.clone();

        let shell = self
            .store
            .get_or_create(
                request.shell_id.as_deref(),
                ShellDefaults {
                    cwd: Some(
                        config
                            .project_dir
                            .clone()
                            .unwrap_or_else(|| self.cwd_snapshot_blocking()),
                    ),
                    env: HashMap::new(),
                },
            )
            .await?;

        let session_allowed = self.store.session_allowed_commands(&shell.id).await?;

        let mut invocations: Vec<(String, Vec<String>)> = Vec::new();
        if let SnippetSource::ShellCommand(shcmd) = source {
            if let Some(pair) = split_shell_command(shcmd) {
                invocations.push(pair);
            }
        }
        for referenced in &request.referenced_commands {
            invocations.push((referenced.command.clone(), referenced.args.clone()));
        }

        if !invocations.is_empty() {
            let mut blocked_commands: Vec<String> = Vec::new();
            let mut not_found_commands: Vec<String> = Vec::new();
            let registry = self.registry.lock().await;
            for (command, args) in &invocations {
                let normalized = Registry::normalize(command);
                if session_allowed.iter().any(|c| c == &normalized) {
                    continue;
                }
                if let Err(validation) =
                    registry::validate(&registry, &config, &shell.cwd, &home, command, args)
                {
                    let name = blocked_command_name(&validation);
                    let not_found = matches!(validation, registry::ValidationError::CommandNotFound { .. })
                        || (matches!(
                            validation,
                            registry::ValidationError::CommandNotWhitelisted { .. }
                        ) && !sandbox::command_exists_on_host(&name));
                    if not_found {
                        if !not_found_commands.contains(&name) {
                            not_found_commands.push(name);
                        }
                    } else if !blocked_commands.contains(&name) {
                        blocked_commands.push(name);
                    }
                }
            }
            drop(registry);
            if !blocked_commands.is_empty() || !not_found_commands.is_empty() {
                return self
                    .block_on_validation_errors(
                        blocked_commands,
                        not_found_commands,
                        request,
                        shell.id.clone(),
                        shell.cwd.clone(),
                    )
                    .await;
            }
        }

        let code = snippet_to_code(source);
        let env = merge_env(&shell.env, &request.env);
        let timeout_ms = request
            .timeout
            .unwrap_or(config.timeout)
            .min(crate::limits::MAX_TIMEOUT_MS);

        self.execute_and_record(
            &config,
            shell,
            code,
            env,
            timeout_ms,
            request.background,
        )
        .await
    }

    async fn run_retry(&self, retry_id: &str, request: &RunRequest) -> Result<RunResponse> {
        let pending = self.retries.consume(retry_id).await?;
        let choice = UserChoice::try_from(
            request
                .user_choice
                .ok_or_else(|| SafeShellError::ConfigError("userChoice is required with retryId".to_string()))?,
        )?;

        let mut config = self.session.config.lock().await.clone();
        let overlay = grant_overlay(&pending.blocked_commands);
        config = config.merge(&overlay);

        if matches!(choice, UserChoice::Session | UserChoice::Always) {
            if let Some(shell_id) = &pending.shell_id {
                self.store
                    .add_session_allowed_commands(shell_id, &pending.blocked_commands)
                    .await?;
            }
        }

        if matches!(choice, UserChoice::Always) {
            let project_dir = config.project_dir.clone().ok_or_else(|| {
                SafeShellError::ConfigError(
                    "cannot persist an always-allow grant without a projectDir".to_string(),
                )
            })?;
            Grants::add_and_save(&project_dir, &pending.blocked_commands)?;
            let mut locked = self.session.config.lock().await;
            *locked = config::apply_grants(locked.clone());
            config = locked.clone();
            let mut registry = self.registry.lock().await;
            registry.rebuild(&config);
        }
        // Once/session grants only apply to `config`, the local copy used
        // for this one execution below; the session-wide config is left
        // untouched so a later plain `run` of the same snippet is validated
        // against it again and blocks as before (session grants are instead
        // honored via `sessionAllowedCommands`, checked in `run()`).

        let shell = self
            .store
            .get_or_create(
                pending.shell_id.as_deref(),
                ShellDefaults {
                    cwd: Some(pending.context.cwd.clone()),
                    env: pending.context.env.clone(),
                },
            )
            .await?;

        let code = pending.code.clone();
        let env = merge_env(&shell.env, &pending.context.env);
        let timeout_ms = pending
            .context
            .timeout
            .unwrap_or(config.timeout)
            .min(crate::limits::MAX_TIMEOUT_MS);

        self.execute_and_record(
            &config,
            shell,
            code,
            env,
            timeout_ms,
            pending.context.background,
        )
        .await
    }

    /// Builds a single pending retry covering every command a preflight
    /// pass blocked, so a snippet surfacing several violations at once is
    /// granted or denied as one unit rather than one retry per command.
    async fn block_on_validation_errors(
        &self,
        blocked_commands: Vec<String>,
        not_found_commands: Vec<String>,
        request: RunRequest,
        shell_id: String,
        cwd: PathBuf,
    ) -> Result<RunResponse> {
        let env = request.env.clone();
        let context = RetryContext {
            cwd,
            env,
            timeout: request.timeout,
            background: request.background,
        };
        let source_text = request
            .snippet_source()
            .map(|s| snippet_to_code(s))
            .unwrap_or_default();
        let retry_id = self
            .retries
            .create_multi(
                source_text,
                blocked_commands.clone(),
                not_found_commands.clone(),
                context,
                Some(shell_id),
            )
            .await;
        let error = if let Some(first) = blocked_commands.first() {
            ErrorBody::new(
                ErrorCode::CommandNotWhitelisted,
                format!("{first} is not on the command whitelist"),
            )
            .with_suggestion(format!("add '{first}' to external.{first}.allow"))
        } else {
            ErrorBody::new(
                ErrorCode::CommandNotFound,
                "one or more referenced commands were not found on the host".to_string(),
            )
        };
        Ok(RunResponse::Blocked(RunBlocked {
            error,
            retry_id,
            hint: "call run again with retryId and userChoice (1=once, 2=session, 3=always)"
                .to_string(),
            commands: blocked_commands,
            not_found_commands,
        }))
    }

    async fn execute_and_record(
        &self,
        config: &Config,
        shell: ShellView,
        code: String,
        env: HashMap<String, String>,
        timeout_ms: u64,
        background: bool,
    ) -> Result<RunResponse> {
        let request = ExecuteRequest {
            shell_id: shell.id.clone(),
            script_id: String::new(),
            cwd: shell.cwd.clone(),
            home: self.paths.home.clone(),
            project_dir: config.project_dir.clone(),
            env,
            vars: shell.vars.clone(),
            code: code.clone(),
            timeout_ms,
            vfs_enabled: config.vfs.enabled,
            temp_dir: self.paths.temp_dir.clone(),
            stdlib_dir: self.paths.stdlib_dir.clone(),
            linux_sandbox_helper: self.paths.linux_sandbox_helper.clone(),
        };

        if background {
            self.run_background(config, request, shell).await
        } else {
            self.run_foreground(config, request, shell).await
        }
    }

    async fn run_foreground(
        &self,
        config: &Config,
        request: ExecuteRequest,
        shell: ShellView,
    ) -> Result<RunResponse> {
        let (outcome, script_id) = self.run_snippet_foreground(config, &shell, request).await?;
        Ok(RunResponse::Success(RunSuccess {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            shell_id: shell.id,
            script_id,
            pid: outcome.pid,
            success: outcome.success,
        }))
    }

    /// Spawns, collects, and fully records one foreground snippet execution
    /// (output, epilogue vars/cwd, job events, terminal script status).
    /// Shared by the `run` tool handler and the task orchestrator (4.F),
    /// which runs each atomic task's `cmd` snippet through the same sandbox
    /// launcher and store bookkeeping path.
    async fn run_snippet_foreground(
        &self,
        config: &Config,
        shell: &ShellView,
        request: ExecuteRequest,
    ) -> Result<(sandbox::ExecuteOutcome, String)> {
        let spawned = sandbox::prepare_and_spawn(&request, config).await?;
        let script_id = self
            .store
            .begin_script(&shell.id, request.code.clone(), spawned.pid, false)
            .await?;

        let outcome = sandbox::finish(spawned.child, request.timeout_ms).await?;

        self.store
            .append_output(&shell.id, &script_id, outcome.stdout.as_bytes(), outcome.stderr.as_bytes())
            .await?;
        self.store
            .merge_epilogue(&shell.id, outcome.vars.clone(), outcome.cwd.clone())
            .await?;
        record_jobs(&self.store, &shell.id, &script_id, &outcome.jobs).await?;

        let status = if outcome.success {
            ScriptStatus::Completed
        } else {
            ScriptStatus::Failed
        };
        self.store
            .complete_script(&shell.id, &script_id, status, Some(outcome.exit_code))
            .await?;

        Ok((outcome, script_id))
    }

    // -- task orchestrator (component F) ----------------------------------

    /// Runs a named task (atomic/serial/parallel/array-literal, see
    /// `crate::tasks`) to completion, routing each atomic member's snippet
    /// through the same sandbox launcher and store bookkeeping as `run`.
    /// Not part of the wire protocol's request/response enum; exposed here
    /// as a plain dispatcher method since the task orchestrator has no
    /// corresponding tool-surface entry.
    pub async fn run_task(
        &self,
        task_name: &str,
        shell_id: Option<String>,
        timeout: Option<u64>,
    ) -> Result<crate::tasks::TaskOutcome> {
        self.await_roots_or_timeout().await;
        let config = self.session.config.lock().await.clone();
        let home = self.paths.home.clone();
        let shell = self
            .store
            .get_or_create(
                shell_id.as_deref(),
                ShellDefaults {
                    cwd: Some(
                        config
                            .project_dir
                            .clone()
                            .unwrap_or_else(|| self.cwd_snapshot_blocking()),
                    ),
                    env: HashMap::new(),
                },
            )
            .await?;
        let timeout_ms = timeout
            .unwrap_or(config.timeout)
            .min(crate::limits::MAX_TIMEOUT_MS);
        let runner = DispatcherTaskRunner {
            dispatcher: self,
            config: config.clone(),
            shell,
            home,
            timeout_ms,
        };
        crate::tasks::run_task(task_name, &config.tasks, &runner).await
    }

    /// Spawns a background script and returns immediately with its pid;
    /// output collection and store bookkeeping continue on a detached task.
    /// Background scripts ignore the request timeout and run until
    /// explicitly killed or the shell ends.
    async fn run_background(
        &self,
        config: &Config,
        request: ExecuteRequest,
        shell: ShellView,
    ) -> Result<RunResponse> {
        let spawned = sandbox::prepare_and_spawn(&request, config).await?;
        let pid = spawned.pid;
        let script_id = self
            .store
            .begin_script(&shell.id, request.code.clone(), pid, true)
            .await?;

        let shell_id = shell.id.clone();
        let script_id_for_task = script_id.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(Self::finish_background(
            store,
            spawned.child,
            shell_id,
            script_id_for_task,
        ));

        Ok(RunResponse::Success(RunSuccess {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            shell_id: shell.id,
            script_id,
            pid,
            success: true,
        }))
    }

    /// Takes an `Arc<Store>` rather than `&self` so it can be handed to
    /// `tokio::spawn` and outlive any single `run` call; background
    /// collection applies the same output/vars/jobs bookkeeping as the
    /// foreground path once the child exits.
    async fn finish_background(
        store: Arc<Store>,
        child: tokio::process::Child,
        shell_id: String,
        script_id: String,
    ) {
        // No deadline: background scripts run until killed, so the
        // background timeout is effectively unbounded (bounded in practice
        // only by the process's own lifetime or an explicit killScript).
        let outcome = match sandbox::finish(child, u64::MAX).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let _ = store
                    .complete_script(&shell_id, &script_id, ScriptStatus::Failed, Some(-1))
                    .await;
                return;
            }
        };

        let _ = store
            .append_output(
                &shell_id,
                &script_id,
                outcome.stdout.as_bytes(),
                outcome.stderr.as_bytes(),
            )
            .await;
        let _ = store
            .merge_epilogue(&shell_id, outcome.vars.clone(), outcome.cwd.clone())
            .await;
        let _ = record_jobs(&store, &shell_id, &script_id, &outcome.jobs).await;

        let status = if outcome.success {
            ScriptStatus::Completed
        } else {
            ScriptStatus::Failed
        };
        let _ = store
            .complete_script(&shell_id, &script_id, status, Some(outcome.exit_code))
            .await;
    }

    fn cwd_snapshot_blocking(&self) -> PathBuf {
        self.session
            .cwd
            .try_lock()
            .map(|cwd| cwd.clone())
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
    }

    // -- shell management --------------------------------------------------

    pub async fn start_shell(&self, request: StartShellRequest) -> Result<ShellView> {
        self.await_roots_or_timeout().await;
        let cwd = request.cwd.map(PathBuf::from);
        self.store
            .create(ShellDefaults {
                cwd,
                env: request.env,
            })
            .await
    }

    pub async fn update_shell(&self, request: UpdateShellRequest) -> Result<ShellView> {
        self.await_roots_or_timeout().await;
        self.store
            .update(
                &request.shell_id,
                ShellPatch {
                    cwd: request.cwd.map(PathBuf::from),
                    env: request.env,
                    vars: None,
                },
            )
            .await
    }

    pub async fn end_shell(&self, request: EndShellRequest) -> Result<EndShellResponse> {
        self.await_roots_or_timeout().await;
        self.store.end(&request.shell_id).await?;
        Ok(EndShellResponse {
            shell_id: request.shell_id,
            ended: true,
        })
    }

    pub async fn list_shells(&self) -> Vec<ShellView> {
        self.await_roots_or_timeout().await;
        self.store.list().await
    }

    // -- script/job introspection -----------------------------------------

    pub async fn list_scripts(&self, request: ListScriptsRequest) -> Result<ListScriptsResponse> {
        self.await_roots_or_timeout().await;
        let scripts = self.store.list_scripts(&request.shell_id, &request.filter).await?;
        Ok(ListScriptsResponse { scripts })
    }

    pub async fn get_script_output(
        &self,
        request: GetScriptOutputRequest,
    ) -> Result<GetScriptOutputResponse> {
        self.await_roots_or_timeout().await;
        let (stdout, stderr, offset, status, exit_code, stdout_truncated, stderr_truncated) = self
            .store
            .get_script_output_since(
                &request.shell_id,
                &request.script_id,
                request.since.unwrap_or(0),
            )
            .await?;
        Ok(GetScriptOutputResponse {
            stdout,
            stderr,
            offset,
            status: status_label(status),
            exit_code,
            stdout_truncated,
            stderr_truncated,
        })
    }

    pub async fn kill_script(&self, request: KillScriptRequest) -> Result<KillScriptResponse> {
        self.await_roots_or_timeout().await;
        let signal = parse_signal(request.signal.as_deref());
        self.store
            .kill_script(&request.shell_id, &request.script_id, signal)
            .await?;
        Ok(KillScriptResponse { killed: true })
    }

    pub async fn wait_script(&self, request: WaitScriptRequest) -> Result<WaitScriptResponse> {
        self.await_roots_or_timeout().await;
        let timeout = Duration::from_millis(request.timeout.unwrap_or(crate::limits::DEFAULT_TIMEOUT_MS));
        let script = self
            .store
            .wait_script(&request.shell_id, &request.script_id, timeout)
            .await?;
        let timed_out = script.is_none();
        Ok(WaitScriptResponse { script, timed_out })
    }

    pub async fn list_jobs(&self, request: ListJobsRequest) -> Result<ListJobsResponse> {
        self.await_roots_or_timeout().await;
        let jobs = self.store.list_jobs(&request.shell_id, &request.filter).await?;
        Ok(ListJobsResponse { jobs })
    }
}

/// Adapts the dispatcher's foreground execution path to `tasks::SnippetRunner`
/// so the orchestrator can stay ignorant of shells/config/paths and just hand
/// over bare snippet text per atomic task.
struct DispatcherTaskRunner<'a> {
    dispatcher: &'a Dispatcher,
    config: Config,
    shell: ShellView,
    home: PathBuf,
    timeout_ms: u64,
}

#[async_trait::async_trait]
impl<'a> crate::tasks::SnippetRunner for DispatcherTaskRunner<'a> {
    async fn run_snippet(&self, code: &str) -> Result<crate::tasks::TaskOutcome> {
        let request = ExecuteRequest {
            shell_id: self.shell.id.clone(),
            script_id: String::new(),
            cwd: self.shell.cwd.clone(),
            home: self.home.clone(),
            project_dir: self.config.project_dir.clone(),
            env: self.shell.env.clone(),
            vars: self.shell.vars.clone(),
            code: code.to_string(),
            timeout_ms: self.timeout_ms,
            vfs_enabled: self.config.vfs.enabled,
            temp_dir: self.dispatcher.paths.temp_dir.clone(),
            stdlib_dir: self.dispatcher.paths.stdlib_dir.clone(),
            linux_sandbox_helper: self.dispatcher.paths.linux_sandbox_helper.clone(),
        };
        let (outcome, _script_id) = self
            .dispatcher
            .run_snippet_foreground(&self.config, &self.shell, request)
            .await?;
        Ok(crate::tasks::TaskOutcome {
            success: outcome.success,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
        })
    }
}

async fn record_jobs(
    store: &Store,
    shell_id: &str,
    script_id: &str,
    events: &[sandbox::preamble::JobEvent],
) -> Result<()> {
    for event in events {
        match event {
            sandbox::preamble::JobEvent::Start { id, command, args, pid } => {
                store
                    .upsert_job_started(
                        shell_id,
                        crate::store::Job {
                            id: id.clone(),
                            script_id: script_id.to_string(),
                            command: command.clone(),
                            args: args.clone(),
                            pid: *pid,
                            status: JobStatus::Running,
                            exit_code: None,
                            started_at: chrono::Utc::now(),
                            completed_at: None,
                        },
                    )
                    .await?;
            }
            sandbox::preamble::JobEvent::End { id, exit_code } => {
                let status = if exit_code.unwrap_or(-1) == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                store.complete_job(shell_id, id, status, *exit_code).await?;
            }
        }
    }
    Ok(())
}

fn status_label(status: ScriptStatus) -> String {
    match status {
        ScriptStatus::Running => "running".to_string(),
        ScriptStatus::Completed => "completed".to_string(),
        ScriptStatus::Failed => "failed".to_string(),
    }
}

#[cfg(unix)]
fn parse_signal(signal: Option<&str>) -> i32 {
    match signal {
        Some("SIGKILL") => libc::SIGKILL,
        Some("SIGINT") => libc::SIGINT,
        Some("SIGTERM") | None => libc::SIGTERM,
        Some(_) => libc::SIGTERM,
    }
}

#[cfg(not(unix))]
fn parse_signal(_signal: Option<&str>) -> i32 {
    15
}

fn merge_env(
    shell_env: &HashMap<String, String>,
    request_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = shell_env.clone();
    merged.extend(request_env.clone());
    merged
}

fn grant_overlay(commands: &[String]) -> Config {
    let mut overlay = Config::default();
    overlay.permissions.run = commands.to_vec();
    for command in commands {
        overlay.external.insert(
            command.clone(),
            crate::policy::ExternalPolicy {
                allow: crate::policy::SubcommandAllow::All(true),
                deny_flags: Vec::new(),
                require_flags: Vec::new(),
                path_args: crate::policy::PathArgsPolicy::default(),
            },
        );
    }
    overlay
}

fn blocked_command_name(err: &registry::ValidationError) -> String {
    match err {
        registry::ValidationError::CommandNotWhitelisted { command } => command.clone(),
        registry::ValidationError::CommandNotFound { command } => command.clone(),
        registry::ValidationError::SubcommandNotAllowed { command, .. } => command.clone(),
        registry::ValidationError::FlagNotAllowed { command, .. } => command.clone(),
        registry::ValidationError::MissingRequiredFlags { command, .. } => command.clone(),
        registry::ValidationError::PathViolation { path } => path.clone(),
        registry::ValidationError::SymlinkViolation { path } => path.clone(),
    }
}

fn snippet_to_code(source: SnippetSource<'_>) -> String {
    match source {
        SnippetSource::Code(code) => code.to_string(),
        SnippetSource::ShellCommand(shcmd) => match split_shell_command(shcmd) {
            Some((command, args)) => {
                let args_json = serde_json::to_string(&args).unwrap_or_else(|_| "[]".to_string());
                format!("await $.cmd({command:?}, ...{args_json}).run();")
            }
            None => format!("await $.cmd({shcmd:?}).run();"),
        },
        SnippetSource::File(path) => format!("await import({path:?});"),
        SnippetSource::Module(module) => format!("await import({module:?});"),
    }
}

/// Splits a shell-command string into `(command, args)` on whitespace,
/// honoring single/double-quoted segments. Full shell grammar (globs,
/// pipes, redirections) is explicitly out of scope; this only needs to
/// recover the argv the registry validates against.
fn split_shell_command(shcmd: &str) -> Option<(String, Vec<String>)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = shcmd.trim().chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.is_empty() {
        return None;
    }
    let command = parts.remove(0);
    Some((command, parts))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn split_shell_command_honors_quotes() {
        let (cmd, args) = split_shell_command("git commit -m 'a message'").unwrap();
        assert_eq!(cmd, "git");
        assert_eq!(args, vec!["commit", "-m", "a message"]);
    }

    #[test]
    fn split_shell_command_rejects_empty_input() {
        assert!(split_shell_command("   ").is_none());
    }

    #[tokio::test]
    async fn start_and_list_shells_round_trips() {
        let dispatcher = test_dispatcher();
        let shell = dispatcher
            .start_shell(StartShellRequest::default())
            .await
            .unwrap();
        let shells = dispatcher.list_shells().await;
        assert!(shells.iter().any(|s| s.id == shell.id));
    }

    #[tokio::test]
    async fn run_with_unwhitelisted_shcmd_blocks_and_returns_retry_id() {
        let dispatcher = test_dispatcher();
        let shell = dispatcher
            .start_shell(StartShellRequest::default())
            .await
            .unwrap();
        let request = RunRequest {
            code: None,
            shcmd: Some("curl https://example.com".to_string()),
            file: None,
            module: None,
            retry_id: None,
            shell_id: Some(shell.id),
            background: false,
            timeout: None,
            env: HashMap::new(),
            user_choice: None,
            referenced_commands: Vec::new(),
        };
        let response = dispatcher.run(request).await.unwrap();
        match response {
            RunResponse::Blocked(blocked) => {
                // "curl" lands in `commands` if it exists on the host's PATH
                // (the usual case) or `notFoundCommands` otherwise; either
                // way it must not be silently allowed through.
                let seen = blocked
                    .commands
                    .iter()
                    .chain(blocked.not_found_commands.iter())
                    .any(|c| c == "curl");
                assert!(seen, "expected curl in commands or notFoundCommands");
                assert!(!blocked.retry_id.is_empty());
            }
            RunResponse::Success(_) => panic!("expected a blocked response"),
        }
    }

    #[tokio::test]
    async fn run_background_without_shell_id_is_config_error() {
        let dispatcher = test_dispatcher();
        let request = RunRequest {
            code: Some("1+1".to_string()),
            shcmd: None,
            file: None,
            module: None,
            retry_id: None,
            shell_id: None,
            background: true,
            timeout: None,
            env: HashMap::new(),
            user_choice: None,
            referenced_commands: Vec::new(),
        };
        let err = dispatcher.run(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigError);
    }

    #[tokio::test]
    async fn run_with_code_and_referenced_commands_blocks_on_each() {
        let dispatcher = test_dispatcher();
        let shell = dispatcher
            .start_shell(StartShellRequest::default())
            .await
            .unwrap();
        let request = RunRequest {
            code: Some("await $.cmd('git', 'push', '--force').run();".to_string()),
            shcmd: None,
            file: None,
            module: None,
            retry_id: None,
            shell_id: Some(shell.id),
            background: false,
            timeout: None,
            env: HashMap::new(),
            user_choice: None,
            referenced_commands: vec![crate::protocol::ReferencedCommand {
                command: "git".to_string(),
                args: vec!["push".to_string(), "--force".to_string()],
            }],
        };
        let response = dispatcher.run(request).await.unwrap();
        match response {
            RunResponse::Blocked(blocked) => {
                assert!(blocked
                    .commands
                    .iter()
                    .chain(blocked.not_found_commands.iter())
                    .any(|c| c == "git"));
            }
            RunResponse::Success(_) => panic!("expected a blocked response for an unwhitelisted code snippet"),
        }
    }

    /// §8 end-to-end scenario 1: a once-retry must grant the command for
    /// that one execution only, not permanently merge it into the
    /// session-wide config, so a later plain `run` of the same snippet
    /// blocks again.
    #[tokio::test]
    async fn once_retry_does_not_permanently_unblock_the_command() {
        std::env::set_var("SAFESH_RUNTIME", "true");
        let dispatcher = test_dispatcher();
        let shell = dispatcher
            .start_shell(StartShellRequest::default())
            .await
            .unwrap();

        let make_request = |shell_id: &str| RunRequest {
            code: None,
            shcmd: Some("curl https://example.com".to_string()),
            file: None,
            module: None,
            retry_id: None,
            shell_id: Some(shell_id.to_string()),
            background: false,
            timeout: None,
            env: HashMap::new(),
            user_choice: None,
            referenced_commands: Vec::new(),
        };

        let retry_id = match dispatcher.run(make_request(&shell.id)).await.unwrap() {
            RunResponse::Blocked(blocked) => blocked.retry_id,
            RunResponse::Success(_) => panic!("expected curl to be blocked initially"),
        };

        let retry_request = RunRequest {
            retry_id: Some(retry_id),
            user_choice: Some(1),
            ..make_request(&shell.id)
        };
        match dispatcher.run(retry_request).await.unwrap() {
            RunResponse::Success(_) => {}
            RunResponse::Blocked(_) => panic!("once-retry should have run the command"),
        }

        match dispatcher.run(make_request(&shell.id)).await.unwrap() {
            RunResponse::Blocked(_) => {}
            RunResponse::Success(_) => {
                panic!("a later plain run of the same snippet must block again")
            }
        }

        std::env::remove_var("SAFESH_RUNTIME");
    }

    #[tokio::test]
    async fn run_task_with_unknown_name_is_config_error() {
        let dispatcher = test_dispatcher();
        let err = dispatcher
            .run_task("no-such-task", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigError);
    }

    fn test_dispatcher() -> Dispatcher {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        Dispatcher::new(
            config,
            None,
            DispatcherPaths {
                home: dir.path().to_path_buf(),
                temp_dir: dir.path().join("scripts"),
                stdlib_dir: dir.path().join("stdlib"),
                linux_sandbox_helper: None,
            },
        )
    }
}
