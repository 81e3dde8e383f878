use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "safeshell", version)]
pub struct Cli {
    /// Path to a `safeshell.toml` policy file. Defaults to an empty policy
    /// if omitted (nothing is whitelisted).
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to a JSON file the dispatcher persists shell/script state to
    /// across restarts. Omit to run with in-memory state only.
    #[arg(long = "state", value_name = "FILE")]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs one snippet against a (possibly fresh) shell.
    Run {
        /// JavaScript/TypeScript snippet source.
        #[arg(long, conflicts_with_all = ["shcmd", "file", "module"])]
        code: Option<String>,
        /// A single external command to run directly, e.g. "ls -la".
        #[arg(long, conflicts_with_all = ["code", "file", "module"])]
        shcmd: Option<String>,
        /// Path to a snippet file to read and run.
        #[arg(long, conflicts_with_all = ["code", "shcmd", "module"])]
        file: Option<String>,
        /// Name of a stdlib module to run.
        #[arg(long, conflicts_with_all = ["code", "shcmd", "file"])]
        module: Option<String>,
        /// Existing shell id to run against; a new shell is created when
        /// omitted.
        #[arg(long = "shell")]
        shell_id: Option<String>,
        /// Run the script in the background and return immediately.
        #[arg(long)]
        background: bool,
        /// Timeout override, in milliseconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Resumes a blocked request with a permission decision.
    Retry {
        retry_id: String,
        /// 1 = once, 2 = for this session, 3 = always (persisted).
        #[arg(long, default_value_t = 1)]
        choice: u8,
    },
    /// Starts a new shell and prints its id.
    StartShell {
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Ends a shell, killing any scripts still running in it.
    EndShell { shell_id: String },
    /// Lists all live shells.
    ListShells,
    /// Lists scripts recorded under a shell.
    ListScripts { shell_id: String },
    /// Prints a script's collected output so far.
    GetScriptOutput {
        shell_id: String,
        script_id: String,
        #[arg(long)]
        since: Option<usize>,
    },
    /// Sends a termination signal to a running script.
    KillScript {
        shell_id: String,
        script_id: String,
        #[arg(long)]
        signal: Option<String>,
    },
    /// Blocks until a script reaches a terminal state or a timeout elapses.
    WaitScript {
        shell_id: String,
        script_id: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Lists jobs spawned by scripts in a shell.
    ListJobs { shell_id: String },
    /// Runs a named task from the policy file's `tasks` table.
    RunTask {
        name: String,
        #[arg(long = "shell")]
        shell_id: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
}
