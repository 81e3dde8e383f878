//! Preamble/epilogue text templating for the sandbox launcher.
//!
//! The fluent-stream/async-generator surface the preamble describes is a
//! concern of the child runtime that consumes it; this module only ever
//! produces the text. The `$` capability object is rendered as a fixed,
//! versioned, statically-listed set of fields rather than through any
//! reflective dispatch on the Rust side.

use std::collections::HashMap;

/// Version stamped into the preamble so a child runtime can detect a stale
/// cached copy of the materialized script file (content-hashed separately;
/// this is a belt-and-suspenders human-readable marker).
pub const PREAMBLE_VERSION: &str = "safeshell-preamble-v1";

/// Sentinel the epilogue prints before its trailing JSON blob so the
/// launcher can locate and strip it from the caller-visible stdout.
pub const EPILOGUE_SENTINEL: &str = "__SAFESH_EPILOGUE__:";

/// Prefix of a job-event line the launcher scans for on stderr.
pub const JOB_EVENT_MARKER: &str = "__SAFESH_JOB__:";

/// Builds the preamble injected ahead of user code. Declares the `$` object
/// fields statically (`ID`, `CWD`, `ENV`, `VARS`, `projectDir`, fs/path/text
/// primitives, the stream combinator set, command constructors, `sleep`,
/// and the VFS handle when enabled) — this is a text template, not a
/// reflective binding; the actual primitives are implemented by whatever
/// runtime interprets the materialized script.
pub fn render_preamble(
    shell_id: &str,
    script_id: &str,
    cwd: &str,
    project_dir: Option<&str>,
    env: &HashMap<String, String>,
    vars: &HashMap<String, serde_json::Value>,
    vfs_enabled: bool,
) -> String {
    let env_json = serde_json::to_string(env).unwrap_or_else(|_| "{}".to_string());
    let vars_json = serde_json::to_string(vars).unwrap_or_else(|_| "{}".to_string());
    let project_dir_literal = match project_dir {
        Some(p) => format!("{p:?}"),
        None => "null".to_string(),
    };
    let vfs_line = if vfs_enabled {
        "const vfs = __safeshVfsHandle();"
    } else {
        "const vfs = null;"
    };

    format!(
        r#"// {PREAMBLE_VERSION}
const $ = Object.freeze({{
  ID: {script_id:?},
  CWD: {cwd:?},
  ENV: {env_json},
  VARS: {vars_json},
  projectDir: {project_dir_literal},
  fs: __safeshFsPrimitives(),
  join: __safeshPathJoin,
  dirname: __safeshPathDirname,
  basename: __safeshPathBasename,
  extname: __safeshPathExtname,
  resolve: __safeshPathResolve,
  relative: __safeshPathRelative,
  normalize: __safeshPathNormalize,
  trim: __safeshTextTrim,
  lines: __safeshTextLines,
  grep: __safeshTextGrep,
  cmd: __safeshCmdCtor,
  git: (...args) => __safeshCmdCtor("git", ...args),
  docker: (...args) => __safeshCmdCtor("docker", ...args),
  deno: (...args) => __safeshCmdCtor("deno", ...args),
  sleep: __safeshSleep,
}});
{vfs_line}
globalThis.$ = $;
globalThis.SAFESH_SHELL_ID = {shell_id:?};
"#
    )
}

/// Builds the epilogue appended after user code, run in a guaranteed-release
/// scope, that serializes `$.VARS`/`$.CWD`/`$.ENV` mutations back to stdout
/// preceded by [`EPILOGUE_SENTINEL`].
pub fn render_epilogue() -> String {
    format!(
        r#"
try {{
  const __out = {{ vars: globalThis.$.VARS, cwd: globalThis.$.CWD }};
  console.log({EPILOGUE_SENTINEL:?} + JSON.stringify(__out));
}} catch (_e) {{
  // Epilogue must never throw past the user snippet's own exit code.
}}
"#
    )
}

/// Assembles the full materialized script: preamble + user code + epilogue.
/// The concatenation of these three pieces (not just the user code) is what
/// gets content-hashed for the temp-file cache.
pub fn render_full_script(
    shell_id: &str,
    script_id: &str,
    cwd: &str,
    project_dir: Option<&str>,
    env: &HashMap<String, String>,
    vars: &HashMap<String, serde_json::Value>,
    vfs_enabled: bool,
    user_code: &str,
) -> String {
    format!(
        "{}\n{}\n{}",
        render_preamble(shell_id, script_id, cwd, project_dir, env, vars, vfs_enabled),
        user_code,
        render_epilogue()
    )
}

/// Extracts the trailing JSON blob written by the epilogue from collected
/// stdout, returning the cleaned stdout (sentinel line stripped) plus the
/// parsed `vars`/`cwd` update, if present.
pub fn extract_epilogue(stdout: &str) -> (String, Option<EpilogueUpdate>) {
    let mut cleaned_lines = Vec::new();
    let mut update = None;
    for line in stdout.lines() {
        if let Some(json) = line.strip_prefix(EPILOGUE_SENTINEL) {
            if let Ok(parsed) = serde_json::from_str::<EpilogueUpdate>(json) {
                update = Some(parsed);
                continue;
            }
        }
        cleaned_lines.push(line);
    }
    let mut cleaned = cleaned_lines.join("\n");
    if stdout.ends_with('\n') && !cleaned.is_empty() {
        cleaned.push('\n');
    }
    (cleaned, update)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EpilogueUpdate {
    #[serde(default)]
    pub vars: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// One job-lifecycle event the child's diagnostic (stderr) stream carries,
/// prefixed by [`JOB_EVENT_MARKER`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Start {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        pid: Option<u32>,
    },
    End {
        id: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
}

/// Scans `stderr` for [`JOB_EVENT_MARKER`]-prefixed lines, returning the
/// parsed events in encounter order (start/end pairing by id happens at the
/// call site, since events may arrive out of order) and the stderr with
/// those lines stripped.
pub fn extract_job_events(stderr: &str) -> (String, Vec<JobEvent>) {
    let mut cleaned_lines = Vec::new();
    let mut events = Vec::new();
    for line in stderr.lines() {
        if let Some(json) = line.strip_prefix(JOB_EVENT_MARKER) {
            if let Ok(event) = serde_json::from_str::<JobEvent>(json) {
                events.push(event);
                continue;
            }
        }
        cleaned_lines.push(line);
    }
    let mut cleaned = cleaned_lines.join("\n");
    if stderr.ends_with('\n') && !cleaned.is_empty() {
        cleaned.push('\n');
    }
    (cleaned, events)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn extract_epilogue_strips_sentinel_and_parses_update() {
        let stdout = format!(
            "hello\n{EPILOGUE_SENTINEL}{}\n",
            serde_json::json!({"vars": {"x": 1}, "cwd": "/tmp"})
        );
        let (cleaned, update) = extract_epilogue(&stdout);
        assert_eq!(cleaned, "hello\n");
        let update = update.unwrap();
        assert_eq!(update.vars["x"], 1);
        assert_eq!(update.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn extract_epilogue_is_noop_without_sentinel() {
        let (cleaned, update) = extract_epilogue("plain output\n");
        assert_eq!(cleaned, "plain output\n");
        assert!(update.is_none());
    }

    #[test]
    fn extract_job_events_parses_start_and_end() {
        let stderr = format!(
            "{JOB_EVENT_MARKER}{}\nsome warning\n{JOB_EVENT_MARKER}{}\n",
            serde_json::json!({"kind": "start", "id": "j1", "command": "ls", "args": [], "pid": 123}),
            serde_json::json!({"kind": "end", "id": "j1", "exitCode": 0}),
        );
        let (cleaned, events) = extract_job_events(&stderr);
        assert_eq!(cleaned, "some warning\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], JobEvent::Start { id, .. } if id == "j1"));
        assert!(matches!(&events[1], JobEvent::End { id, .. } if id == "j1"));
    }
}
