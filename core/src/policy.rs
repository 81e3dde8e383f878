//! Policy model (component A): the value types that describe what a child
//! runtime is permitted to do, plus the two pure helpers (`expand`,
//! `match_mask`) every other component consults.
//!
//! Small, serializable, side-effect-free value types with `impl` blocks
//! exposing derived booleans rather than scattering the same checks across
//! call sites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// `net` permission: either unrestricted or a fixed allow-list of
/// `host:port` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetPermission {
    All(bool),
    Hosts(Vec<String>),
}

impl Default for NetPermission {
    fn default() -> Self {
        NetPermission::All(false)
    }
}

impl NetPermission {
    pub fn allows(&self, host_port: &str) -> bool {
        match self {
            NetPermission::All(allowed) => *allowed,
            NetPermission::Hosts(hosts) => hosts.iter().any(|h| h == host_port),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, NetPermission::All(true))
    }
}

/// `permissions` block of `Config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub net: NetPermission,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

/// Path-argument checking policy nested under an `ExternalPolicy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathArgsPolicy {
    #[serde(default)]
    pub auto_detect: bool,
    #[serde(default)]
    pub validate_sandbox: bool,
}

/// Whether a command's subcommands are unrestricted or limited to a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubcommandAllow {
    All(bool),
    List(Vec<String>),
}

impl SubcommandAllow {
    pub fn allows(&self, subcommand: Option<&str>) -> bool {
        match self {
            SubcommandAllow::All(allowed) => *allowed,
            SubcommandAllow::List(list) => {
                subcommand.is_some_and(|s| list.iter().any(|entry| entry == s))
            }
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, SubcommandAllow::All(true))
    }
}

/// Per-command policy entry under `external`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPolicy {
    pub allow: SubcommandAllow,
    #[serde(default)]
    pub deny_flags: Vec<String>,
    #[serde(default)]
    pub require_flags: Vec<String>,
    #[serde(default)]
    pub path_args: PathArgsPolicy,
}

impl ExternalPolicy {
    /// An entry synthesized for project-local command paths: fully allowed,
    /// no flag restrictions.
    pub fn project_local() -> Self {
        Self {
            allow: SubcommandAllow::All(true),
            deny_flags: Vec::new(),
            require_flags: Vec::new(),
            path_args: PathArgsPolicy::default(),
        }
    }
}

/// `env` block: an allow list plus glob masks that always win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub mask: Vec<String>,
}

impl EnvPolicy {
    /// A key is exposed to the child iff it is allowed and not masked.
    /// Masking always wins, regardless of the allow list.
    pub fn exposes(&self, key: &str) -> bool {
        if match_mask(key, &self.mask) {
            return false;
        }
        self.allow.iter().any(|a| a == key)
    }
}

/// `imports` block: module-specifier prefixes/globs governing the rewritten
/// import map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportsPolicy {
    #[serde(default)]
    pub trusted: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl ImportsPolicy {
    pub fn is_trusted(&self, specifier: &str) -> bool {
        match_mask(specifier, &self.trusted)
    }

    pub fn is_blocked(&self, specifier: &str) -> bool {
        match_mask(specifier, &self.blocked)
    }

    /// Allowed if explicitly allowed, or trusted, and not blocked. Blocked
    /// always wins.
    pub fn is_allowed(&self, specifier: &str) -> bool {
        if self.is_blocked(specifier) {
            return false;
        }
        self.is_trusted(specifier) || match_mask(specifier, &self.allowed)
    }
}

/// `vfs` block, passed through to the sandbox launcher uninterpreted by the
/// core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default)]
    pub max_files: Option<u64>,
    /// Preload map: virtual path to either literal bytes (base64) or `None`
    /// for an empty placeholder entry.
    #[serde(default)]
    pub preload: HashMap<String, Option<Vec<u8>>>,
}

/// One entry of `tasks`, see `crate::tasks::TaskDef`.
pub type TaskName = String;

/// The policy root. One `Config` governs one dispatcher session; retries may
/// produce one-request overrides layered on top (see `crate::retry`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub external: HashMap<String, ExternalPolicy>,
    #[serde(default)]
    pub env: EnvPolicy,
    #[serde(default)]
    pub imports: ImportsPolicy,
    #[serde(default)]
    pub tasks: HashMap<TaskName, crate::tasks::TaskDef>,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub allow_project_commands: bool,
    #[serde(default)]
    pub allow_project_files: bool,
    #[serde(default)]
    pub vfs: VfsConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    #[serde(default = "default_retry_ttl_ms")]
    pub retry_ttl_ms: u64,
}

fn default_timeout_ms() -> u64 {
    crate::limits::DEFAULT_TIMEOUT_MS
}

fn default_retry_ttl_ms() -> u64 {
    crate::limits::DEFAULT_RETRY_TTL_MS
}

impl Config {
    /// Merge `other` on top of `self`: right-biased on scalars, union on
    /// lists (de-duplicated), recursive override-merge on maps. Associative:
    /// `a.merge(b).merge(c) == a.merge(b.merge(c))` is NOT guaranteed in
    /// general for arbitrary merges, but this crate's merges are only ever
    /// applied left-to-right in a single chain, matching the one place the
    /// behavior is observed (retry grants layered onto a base config).
    pub fn merge(&self, other: &Config) -> Config {
        Config {
            permissions: Permissions {
                read: union(&self.permissions.read, &other.permissions.read),
                write: union(&self.permissions.write, &other.permissions.write),
                net: if matches!(other.permissions.net, NetPermission::All(false)) {
                    self.permissions.net.clone()
                } else {
                    other.permissions.net.clone()
                },
                run: union(&self.permissions.run, &other.permissions.run),
                env: union(&self.permissions.env, &other.permissions.env),
            },
            external: merge_external(&self.external, &other.external),
            env: EnvPolicy {
                allow: union(&self.env.allow, &other.env.allow),
                mask: union(&self.env.mask, &other.env.mask),
            },
            imports: ImportsPolicy {
                trusted: union(&self.imports.trusted, &other.imports.trusted),
                allowed: union(&self.imports.allowed, &other.imports.allowed),
                blocked: union(&self.imports.blocked, &other.imports.blocked),
            },
            tasks: merge_maps(&self.tasks, &other.tasks),
            project_dir: other.project_dir.clone().or_else(|| self.project_dir.clone()),
            allow_project_commands: self.allow_project_commands || other.allow_project_commands,
            allow_project_files: self.allow_project_files || other.allow_project_files,
            vfs: if other.vfs.enabled {
                other.vfs.clone()
            } else {
                self.vfs.clone()
            },
            timeout: if other.timeout == default_timeout_ms() {
                self.timeout
            } else {
                other.timeout
            },
            retry_ttl_ms: if other.retry_ttl_ms == default_retry_ttl_ms() {
                self.retry_ttl_ms
            } else {
                other.retry_ttl_ms
            },
        }
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn merge_maps<V: Clone>(a: &HashMap<String, V>, b: &HashMap<String, V>) -> HashMap<String, V> {
    let mut out = a.clone();
    for (k, v) in b {
        out.insert(k.clone(), v.clone());
    }
    out
}

fn merge_external(
    a: &HashMap<String, ExternalPolicy>,
    b: &HashMap<String, ExternalPolicy>,
) -> HashMap<String, ExternalPolicy> {
    let mut out = a.clone();
    for (name, policy) in b {
        match out.get_mut(name) {
            Some(existing) => {
                existing.allow = match (&existing.allow, &policy.allow) {
                    (SubcommandAllow::All(true), _) | (_, SubcommandAllow::All(true)) => {
                        SubcommandAllow::All(true)
                    }
                    (SubcommandAllow::List(l1), SubcommandAllow::List(l2)) => {
                        SubcommandAllow::List(union(l1, l2))
                    }
                    (_, other) => other.clone(),
                };
                existing.deny_flags = union(&existing.deny_flags, &policy.deny_flags);
                existing.require_flags = union(&existing.require_flags, &policy.require_flags);
            }
            None => {
                out.insert(name.clone(), policy.clone());
            }
        }
    }
    out
}

/// Expands `${CWD}`/`$CWD`/`${HOME}`/`$HOME` references in `path` against the
/// given `cwd`/`home`, then returns the resulting absolute path. Idempotent
/// on already-absolute inputs that contain no variable references.
pub fn expand(path: &str, cwd: &Path, home: &Path) -> PathBuf {
    let substituted = path
        .replace("${CWD}", &cwd.to_string_lossy())
        .replace("$CWD", &cwd.to_string_lossy())
        .replace("${HOME}", &home.to_string_lossy())
        .replace("$HOME", &home.to_string_lossy());

    let substituted_path = PathBuf::from(substituted);
    if substituted_path.is_absolute() {
        substituted_path
    } else {
        cwd.join(substituted_path)
    }
}

/// Glob-pattern match against any of `patterns` (`*` wildcard, via
/// `wildmatch`). A match forbids exposure regardless of other rules when
/// used for masking.
pub fn match_mask(key: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| WildMatch::new(p).matches(key))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn expand_substitutes_cwd_and_home() {
        let cwd = PathBuf::from("/work/proj");
        let home = PathBuf::from("/home/agent");
        assert_eq!(
            expand("${CWD}/src", &cwd, &home),
            PathBuf::from("/work/proj/src")
        );
        assert_eq!(
            expand("$HOME/.config", &cwd, &home),
            PathBuf::from("/home/agent/.config")
        );
    }

    #[test]
    fn expand_is_idempotent_on_absolute_literal_paths() {
        let cwd = PathBuf::from("/work/proj");
        let home = PathBuf::from("/home/agent");
        let once = expand("/etc/hosts", &cwd, &home);
        let twice = expand(once.to_str().unwrap(), &cwd, &home);
        assert_eq!(once, twice);
    }

    #[test]
    fn match_mask_uses_glob_wildcards() {
        let patterns = vec!["AWS_*".to_string(), "SECRET".to_string()];
        assert!(match_mask("AWS_SECRET_KEY", &patterns));
        assert!(match_mask("SECRET", &patterns));
        assert!(!match_mask("PATH", &patterns));
    }

    #[test]
    fn env_policy_mask_wins_over_allow() {
        let policy = EnvPolicy {
            allow: vec!["AWS_SECRET_KEY".to_string()],
            mask: vec!["AWS_*".to_string()],
        };
        assert!(!policy.exposes("AWS_SECRET_KEY"));
    }

    #[test]
    fn merge_is_union_on_lists_and_right_biased_on_scalars() {
        let base = Config {
            permissions: Permissions {
                run: vec!["git".to_string()],
                ..Default::default()
            },
            timeout: 5_000,
            ..Default::default()
        };
        let override_cfg = Config {
            permissions: Permissions {
                run: vec!["curl".to_string()],
                ..Default::default()
            },
            timeout: 9_000,
            ..Default::default()
        };
        let merged = base.merge(&override_cfg);
        assert_eq!(
            merged.permissions.run,
            vec!["git".to_string(), "curl".to_string()]
        );
        assert_eq!(merged.timeout, 9_000);
    }

    #[test]
    fn imports_blocked_wins_over_trusted() {
        let policy = ImportsPolicy {
            trusted: vec!["npm:*".to_string()],
            allowed: Vec::new(),
            blocked: vec!["npm:left-pad".to_string()],
        };
        assert!(policy.is_allowed("npm:lodash"));
        assert!(!policy.is_allowed("npm:left-pad"));
    }
}
