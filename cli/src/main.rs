//! Entry point for the `safeshell` debug binary: parses a subcommand,
//! constructs a `Dispatcher`, and prints its response as JSON.
//!
//! Kept thin: `cli.rs` holds the `clap::Parser` definitions, this file just
//! wires up `tracing_subscriber::EnvFilter`, loads config, and dispatches.

mod cli;

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use safeshell_core::config;
use safeshell_core::dispatcher::{Dispatcher, DispatcherPaths};
use safeshell_core::policy::Config;
use safeshell_core::protocol::{
    EndShellRequest, GetScriptOutputRequest, KillScriptRequest, ListJobsRequest,
    ListScriptsRequest, RunRequest, RunResponse, StartShellRequest, WaitScriptRequest,
};
use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let paths = DispatcherPaths {
        temp_dir: std::env::temp_dir().join("safeshell"),
        stdlib_dir: home.join(".safeshell").join("stdlib"),
        home,
        linux_sandbox_helper: which_linux_sandbox_helper(),
    };

    let dispatcher = Dispatcher::new(config, cli.state.clone(), paths);
    dispatcher.restore().await?;
    dispatcher
        .provide_workspace_roots(Vec::new(), Vec::new(), None)
        .await;

    info!(state_path = ?cli.state, "dispatcher ready");
    let output = dispatch(&dispatcher, cli.command).await?;
    dispatcher.snapshot().await?;
    println!("{output}");
    Ok(())
}

/// Looks for a `safeshell-linux-sandbox` binary alongside this one, so the
/// Linux helper ships next to the main executable rather than requiring it
/// on `$PATH`.
fn which_linux_sandbox_helper() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("safeshell-linux-sandbox");
    candidate.exists().then_some(candidate)
}

async fn dispatch(dispatcher: &Dispatcher, command: Command) -> anyhow::Result<String> {
    let value = match command {
        Command::Run {
            code,
            shcmd,
            file,
            module,
            shell_id,
            background,
            timeout,
        } => {
            let response = dispatcher
                .run(RunRequest {
                    code,
                    shcmd,
                    file,
                    module,
                    retry_id: None,
                    shell_id,
                    background,
                    timeout,
                    env: HashMap::new(),
                    user_choice: None,
                    referenced_commands: Vec::new(),
                })
                .await?;
            run_response_to_json(response)
        }
        Command::Retry { retry_id, choice } => {
            let response = dispatcher
                .run(RunRequest {
                    code: None,
                    shcmd: None,
                    file: None,
                    module: None,
                    retry_id: Some(retry_id),
                    shell_id: None,
                    background: false,
                    timeout: None,
                    env: HashMap::new(),
                    user_choice: Some(choice),
                    referenced_commands: Vec::new(),
                })
                .await?;
            run_response_to_json(response)
        }
        Command::StartShell { cwd } => {
            let shell = dispatcher
                .start_shell(StartShellRequest {
                    cwd,
                    env: HashMap::new(),
                })
                .await?;
            serde_json::to_value(shell)?
        }
        Command::EndShell { shell_id } => {
            let response = dispatcher.end_shell(EndShellRequest { shell_id }).await?;
            serde_json::to_value(response)?
        }
        Command::ListShells => serde_json::to_value(dispatcher.list_shells().await)?,
        Command::ListScripts { shell_id } => {
            let response = dispatcher
                .list_scripts(ListScriptsRequest {
                    shell_id,
                    filter: Default::default(),
                })
                .await?;
            serde_json::to_value(response)?
        }
        Command::GetScriptOutput {
            shell_id,
            script_id,
            since,
        } => {
            let response = dispatcher
                .get_script_output(GetScriptOutputRequest {
                    shell_id,
                    script_id,
                    since,
                })
                .await?;
            serde_json::to_value(response)?
        }
        Command::KillScript {
            shell_id,
            script_id,
            signal,
        } => {
            let response = dispatcher
                .kill_script(KillScriptRequest {
                    shell_id,
                    script_id,
                    signal,
                })
                .await?;
            serde_json::to_value(response)?
        }
        Command::WaitScript {
            shell_id,
            script_id,
            timeout,
        } => {
            let response = dispatcher
                .wait_script(WaitScriptRequest {
                    shell_id,
                    script_id,
                    timeout,
                })
                .await?;
            serde_json::to_value(response)?
        }
        Command::ListJobs { shell_id } => {
            let response = dispatcher
                .list_jobs(ListJobsRequest {
                    shell_id,
                    filter: Default::default(),
                })
                .await?;
            serde_json::to_value(response)?
        }
        Command::RunTask {
            name,
            shell_id,
            timeout,
        } => {
            let outcome = dispatcher.run_task(&name, shell_id, timeout).await?;
            serde_json::to_value(outcome)?
        }
    };
    Ok(serde_json::to_string_pretty(&value)?)
}

fn run_response_to_json(response: RunResponse) -> serde_json::Value {
    serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
}
