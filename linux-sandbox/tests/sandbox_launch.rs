#![cfg(target_os = "linux")]
#![expect(clippy::unwrap_used, clippy::expect_used)]

//! Spawns the compiled `safeshell-linux-sandbox` binary directly and checks
//! that it actually enforces the filesystem/network restriction it's handed,
//! rather than just parsing flags.

use std::path::PathBuf;
use std::process::{Command, Output};

fn sandbox_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_safeshell-linux-sandbox"))
}

fn run_under_sandbox(read: &str, write: &str, net: &str, cmd: &[&str]) -> Output {
    Command::new(sandbox_bin())
        .arg("--read")
        .arg(read)
        .arg("--write")
        .arg(write)
        .arg("--net")
        .arg(net)
        .arg("--")
        .args(cmd)
        .output()
        .expect("should be able to spawn the sandbox helper")
}

#[test]
fn read_only_root_allows_reads() {
    let output = run_under_sandbox("/", "", "none", &["ls", "/bin"]);
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn read_only_root_denies_writes_outside_granted_dirs() {
    let tmpfile = tempfile::NamedTempFile::new().unwrap();
    let target = tmpfile.path().to_string_lossy().into_owned();
    let output = run_under_sandbox(
        "/",
        "",
        "none",
        &["bash", "-lc", &format!("echo blah > {target}")],
    );
    assert!(
        !output.status.success(),
        "write outside the writable set should have been denied"
    );
}

#[test]
fn writable_root_allows_writes_inside_it() {
    let tmpdir = tempfile::tempdir().unwrap();
    let file_path = tmpdir.path().join("test").to_string_lossy().into_owned();
    let write_arg = tmpdir.path().to_string_lossy().into_owned();
    let output = run_under_sandbox(
        "/",
        &write_arg,
        "none",
        &["bash", "-lc", &format!("echo blah > {file_path}")],
    );
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn dev_null_write_always_allowed() {
    let output = run_under_sandbox("/", "", "none", &["bash", "-lc", "echo blah > /dev/null"]);
    assert!(output.status.success());
}

#[test]
fn net_none_blocks_outbound_connections() {
    let output = run_under_sandbox(
        "/",
        "",
        "none",
        &["bash", "-c", "echo hi > /dev/tcp/127.0.0.1/80"],
    );
    assert!(
        !output.status.success(),
        "outbound connection should have been denied under --net none"
    );
}
