//! Re-exec helper: applies Landlock + seccomp to the current thread, then
//! `execvp`s the real command so only the child ever runs under the
//! restricted policy.
//!
//! Parses flags with `clap`, installs the sandbox, `execvp`s the trailing
//! command, and bails out if `execvp` itself returns.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::ffi::CString;
use std::path::PathBuf;

use clap::Parser;

use safeshell_core::policy::NetPermission;
use safeshell_core::sandbox::CapabilityFlags;

/// Invoked as a standalone binary by the sandbox launcher once a script's
/// capability flags have already been computed and the command itself has
/// already cleared registry validation; this helper only ever enforces the
/// filesystem/network restriction, never command whitelisting. Mirrors
/// exactly the flags `sandbox::spawn` invokes it with: `--read`/`--write`
/// each take one `:`-joined path list, `--net` is `all` or `none`.
#[derive(Debug, Parser)]
#[command(name = "safeshell-linux-sandbox")]
struct Cli {
    /// `:`-joined list of directories the child may read from.
    #[arg(long = "read", value_name = "DIRS", default_value = "")]
    read: String,

    /// `:`-joined list of directories the child may read and write.
    #[arg(long = "write", value_name = "DIRS", default_value = "")]
    write: String,

    /// "all" for unrestricted outbound networking, "none" for the default
    /// AF_UNIX-only filter.
    #[arg(long = "net", value_name = "all|none", default_value = "none")]
    net: String,

    /// Command and arguments to run under the installed policy.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let flags = CapabilityFlags {
        read: split_paths(&cli.read),
        write: split_paths(&cli.write),
        net: NetPermission::All(cli.net == "all"),
        run: Vec::new(),
        env: HashMap::new(),
    };

    apply_sandbox(&flags)?;
    exec_command(&cli.command)
}

fn split_paths(joined: &str) -> Vec<PathBuf> {
    joined
        .split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(target_os = "linux")]
fn apply_sandbox(flags: &CapabilityFlags) -> anyhow::Result<()> {
    safeshell_core::sandbox::linux::apply_to_current_thread(flags)
        .map_err(|e| anyhow::anyhow!("failed to install sandbox policy: {e}"))
}

#[cfg(not(target_os = "linux"))]
fn apply_sandbox(_flags: &CapabilityFlags) -> anyhow::Result<()> {
    anyhow::bail!("safeshell-linux-sandbox is only supported on Linux")
}

#[cfg(target_os = "linux")]
fn exec_command(command: &[String]) -> anyhow::Result<()> {
    let Some(program) = command.first() else {
        anyhow::bail!("no command specified to execute");
    };
    let c_program = CString::new(program.as_str())?;
    let c_args: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()?;
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: argv is NUL-terminated and every CString outlives this call.
    unsafe {
        libc::execvp(c_program.as_ptr(), argv.as_ptr());
    }

    let err = std::io::Error::last_os_error();
    anyhow::bail!("execvp {program} failed: {err}")
}

#[cfg(not(target_os = "linux"))]
fn exec_command(_command: &[String]) -> anyhow::Result<()> {
    anyhow::bail!("safeshell-linux-sandbox requires a Linux execvp target")
}
