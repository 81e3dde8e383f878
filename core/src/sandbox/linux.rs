//! Linux capability enforcement: Landlock filesystem rules plus a seccomp
//! network filter, applied on a dedicated thread before the child is
//! exec'd — so only the child inherits the restricted policy, never the
//! supervisor process itself.
//!
//! Filesystem rules are built from `CapabilityFlags`' explicit read/write
//! root lists rather than a fixed read-only/full-disk-write split.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use landlock::{
    Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr, RulesetCreatedAttr, ABI,
};
use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter, SeccompRule, TargetArch,
};

use crate::error::{Result, SafeShellError, SandboxErr};
use crate::sandbox::CapabilityFlags;

/// Applies `flags` to the current OS thread. Must run on a thread that will
/// immediately exec (or exit) the restricted child; the restriction is not
/// reversible within the process.
pub fn apply_to_current_thread(flags: &CapabilityFlags) -> Result<()> {
    if !flags.net.is_unrestricted() {
        install_network_seccomp_filter()?;
    }
    install_filesystem_landlock_rules(&flags.read, &flags.write)?;
    Ok(())
}

fn install_filesystem_landlock_rules(read_roots: &[PathBuf], write_roots: &[PathBuf]) -> Result<()> {
    let abi = ABI::V5;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);

    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)?
        .create()?
        .set_no_new_privs(true);

    let read_only_roots: Vec<&Path> = read_roots
        .iter()
        .filter(|r| !write_roots.contains(r))
        .map(|p| p.as_path())
        .collect();
    if !read_only_roots.is_empty() {
        ruleset = ruleset.add_rules(landlock::path_beneath_rules(&read_only_roots, access_ro))?;
    }
    if !write_roots.is_empty() {
        let write_paths: Vec<&Path> = write_roots.iter().map(|p| p.as_path()).collect();
        ruleset = ruleset.add_rules(landlock::path_beneath_rules(&write_paths, access_rw))?;
    }
    ruleset = ruleset.add_rules(landlock::path_beneath_rules(&["/dev/null"], access_rw))?;

    let status = ruleset.restrict_self()?;
    if status.ruleset == landlock::RulesetStatus::NotEnforced {
        return Err(SafeShellError::Sandbox(SandboxErr::LandlockRestrict));
    }
    Ok(())
}

/// Blocks outbound/inbound networking syscalls except `AF_UNIX` sockets.
fn install_network_seccomp_filter() -> Result<()> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    let mut deny_syscall = |nr: i64| {
        rules.insert(nr, vec![]);
    };

    deny_syscall(libc::SYS_connect);
    deny_syscall(libc::SYS_accept);
    deny_syscall(libc::SYS_accept4);
    deny_syscall(libc::SYS_bind);
    deny_syscall(libc::SYS_listen);
    deny_syscall(libc::SYS_getpeername);
    deny_syscall(libc::SYS_getsockname);
    deny_syscall(libc::SYS_shutdown);
    deny_syscall(libc::SYS_sendto);
    deny_syscall(libc::SYS_sendmsg);
    deny_syscall(libc::SYS_sendmmsg);
    deny_syscall(libc::SYS_recvfrom);
    deny_syscall(libc::SYS_recvmsg);
    deny_syscall(libc::SYS_recvmmsg);
    deny_syscall(libc::SYS_getsockopt);
    deny_syscall(libc::SYS_setsockopt);
    deny_syscall(libc::SYS_ptrace);

    let unix_only_rule = SeccompRule::new(vec![SeccompCondition::new(
        0,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::Eq,
        libc::AF_UNIX as u64,
    )
    .map_err(SandboxErr::from)?])
    .map_err(SandboxErr::from)?;
    rules.insert(libc::SYS_socket, vec![unix_only_rule]);
    rules.insert(libc::SYS_socketpair, vec![]);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        if cfg!(target_arch = "x86_64") {
            TargetArch::x86_64
        } else {
            TargetArch::aarch64
        },
    )
    .map_err(SandboxErr::from)?;

    let prog: BpfProgram = filter.try_into().map_err(SandboxErr::from)?;
    apply_filter(&prog).map_err(SandboxErr::from)?;
    Ok(())
}
