//! Command registry & validator (component B): resolves a command
//! invocation against the policy model.
//!
//! A normalized command name is matched against a fixed classification
//! (allow-all, subcommand allow-list, deny-flags, require-flags, path-arg
//! validation), producing an aggregate of structured violations rather than
//! a single boolean.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{ErrorBody, ErrorCode};
use crate::policy::{expand, Config, ExternalPolicy};

/// A structured validation failure, richer than `SafeShellError` alone: it
/// carries the detail/hint fields the §6 tool surface and §7 error design
/// require (allowed-subcommand lists, missing-flag lists, the offending
/// path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    CommandNotWhitelisted {
        command: String,
    },
    CommandNotFound {
        command: String,
    },
    SubcommandNotAllowed {
        command: String,
        subcommand: String,
        allowed: Vec<String>,
    },
    FlagNotAllowed {
        command: String,
        flag: String,
    },
    MissingRequiredFlags {
        command: String,
        missing: Vec<String>,
    },
    PathViolation {
        path: String,
    },
    SymlinkViolation {
        path: String,
    },
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::CommandNotWhitelisted { .. } => ErrorCode::CommandNotWhitelisted,
            ValidationError::CommandNotFound { .. } => ErrorCode::CommandNotFound,
            ValidationError::SubcommandNotAllowed { .. } => ErrorCode::SubcommandNotAllowed,
            ValidationError::FlagNotAllowed { .. } => ErrorCode::FlagNotAllowed,
            ValidationError::MissingRequiredFlags { .. } => ErrorCode::FlagNotAllowed,
            ValidationError::PathViolation { .. } => ErrorCode::PathViolation,
            ValidationError::SymlinkViolation { .. } => ErrorCode::SymlinkViolation,
        }
    }

    /// Builds the structured error body, including an actionable
    /// `suggestion` referencing the effective config (§7 requirement).
    pub fn to_body(&self) -> ErrorBody {
        match self {
            ValidationError::CommandNotWhitelisted { command } => {
                ErrorBody::new(self.code(), format!("{command} is not on the command whitelist"))
                    .with_suggestion(format!("add '{command}' to external.{command}.allow"))
            }
            ValidationError::CommandNotFound { command } => {
                ErrorBody::new(self.code(), format!("{command} was not found on the host"))
            }
            ValidationError::SubcommandNotAllowed {
                command,
                subcommand,
                allowed,
            } => ErrorBody::new(
                self.code(),
                format!("subcommand '{subcommand}' of {command} is not allowed"),
            )
            .with_details(json!({ "allowed": allowed }))
            .with_suggestion(format!(
                "add '{subcommand}' to external.{command}.allow"
            )),
            ValidationError::FlagNotAllowed { command, flag } => {
                ErrorBody::new(self.code(), format!("flag {flag} is not allowed for {command}"))
                    .with_details(json!({ "flag": flag }))
                    .with_suggestion(format!(
                        "remove '{flag}' from the invocation, or drop it from external.{command}.denyFlags"
                    ))
            }
            ValidationError::MissingRequiredFlags { command, missing } => ErrorBody::new(
                self.code(),
                format!("{command} is missing required flags"),
            )
            .with_details(json!({ "missing": missing })),
            ValidationError::PathViolation { path } => ErrorBody::new(
                self.code(),
                format!("path {path} escapes the sandboxed read/write surface"),
            )
            .with_details(json!({ "path": path })),
            ValidationError::SymlinkViolation { path } => ErrorBody::new(
                self.code(),
                format!("path {path} resolves through a symlink that escapes the sandbox"),
            )
            .with_details(json!({ "path": path })),
        }
    }
}

/// Built from `config.external`; synthesizes project-local entries at
/// lookup time rather than materializing them into the map.
#[derive(Debug, Clone)]
pub struct Registry {
    project_dir: Option<PathBuf>,
    allow_project_commands: bool,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            project_dir: config.project_dir.clone(),
            allow_project_commands: config.allow_project_commands,
        }
    }

    pub fn rebuild(&mut self, config: &Config) {
        self.project_dir = config.project_dir.clone();
        self.allow_project_commands = config.allow_project_commands;
    }

    /// Normalizes a raw command invocation (as it appears on argv[0]) to its
    /// basename, e.g. `/usr/bin/git` -> `git`.
    pub fn normalize(command: &str) -> String {
        Path::new(command)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string())
    }

    /// Looks the command up in `config.external`, synthesizing a
    /// project-local entry when `allowProjectCommands` applies.
    fn resolve<'a>(
        &self,
        command: &str,
        cwd: &Path,
        config: &'a Config,
    ) -> Option<std::borrow::Cow<'a, ExternalPolicy>> {
        let normalized = Self::normalize(command);
        if let Some(entry) = config.external.get(&normalized) {
            return Some(std::borrow::Cow::Borrowed(entry));
        }
        if self.allow_project_commands {
            if let Some(project_dir) = &self.project_dir {
                let candidate = if Path::new(command).is_absolute() {
                    PathBuf::from(command)
                } else {
                    cwd.join(command)
                };
                if let Ok(resolved) = candidate.canonicalize() {
                    if let Ok(project_canon) = project_dir.canonicalize() {
                        if resolved.starts_with(&project_canon) {
                            return Some(std::borrow::Cow::Owned(ExternalPolicy::project_local()));
                        }
                    }
                }
            }
        }
        None
    }
}

/// One flag pulled out of an argument list, already case-normalized for
/// comparison (flag matching is case-insensitive).
fn extract_flags(args: &[String]) -> Vec<String> {
    let mut flags = Vec::new();
    for arg in args {
        if let Some(rest) = arg.strip_prefix("--") {
            let name = rest.split('=').next().unwrap_or(rest);
            flags.push(format!("--{name}"));
        } else if let Some(rest) = arg.strip_prefix('-') {
            if rest.is_empty() {
                continue;
            }
            if rest.len() == 1 {
                flags.push(format!("-{rest}"));
                continue;
            }
            // Longer -xyz: decompose into -x,-y,-z while each char is a
            // letter; a non-letter stops decomposition.
            for ch in rest.chars() {
                if ch.is_ascii_alphabetic() {
                    flags.push(format!("-{ch}"));
                } else {
                    break;
                }
            }
        }
    }
    flags
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with('-') && arg.len() > 1
}

fn flags_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn is_path_like(arg: &str) -> bool {
    !is_flag(arg) && (arg.contains('/') || arg.starts_with('.') || arg.starts_with('~'))
}

/// Whether any prefix of `path` is itself a symlink, per `symlink_metadata`
/// (which, unlike `metadata`, does not follow the final component). Used to
/// tell an actual symlink escape apart from plain `.`/`..` normalization,
/// since `canonicalize()` changes the path in both cases.
fn path_has_symlink_component(path: &Path) -> bool {
    let mut prefix = PathBuf::new();
    for component in path.components() {
        prefix.push(component);
        if std::fs::symlink_metadata(&prefix)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Resolves `arg` against `cwd`, following symlinks, and checks that it lies
/// inside the allowed read/write surface. Only stats the path; no other I/O.
fn validate_path_arg(
    arg: &str,
    cwd: &Path,
    home: &Path,
    read_roots: &[PathBuf],
    write_roots: &[PathBuf],
) -> Result<(), ValidationError> {
    let expanded = expand(arg, cwd, home);
    let resolved = expanded.canonicalize().unwrap_or_else(|_| expanded.clone());

    let inside = read_roots
        .iter()
        .chain(write_roots.iter())
        .any(|root| resolved.starts_with(root));

    if inside {
        return Ok(());
    }

    if path_has_symlink_component(&expanded) {
        Err(ValidationError::SymlinkViolation {
            path: arg.to_string(),
        })
    } else {
        Err(ValidationError::PathViolation {
            path: arg.to_string(),
        })
    }
}

/// Runs the full §4.B pipeline: normalize -> flag-extract -> subcommand ->
/// deny-flags -> require-flags -> path-args. Total and pure aside from
/// stat'ing candidate path arguments.
pub fn validate(
    registry: &Registry,
    config: &Config,
    cwd: &Path,
    home: &Path,
    command: &str,
    args: &[String],
) -> Result<(), ValidationError> {
    let normalized = Registry::normalize(command);

    let policy = registry
        .resolve(command, cwd, config)
        .ok_or_else(|| ValidationError::CommandNotWhitelisted {
            command: normalized.clone(),
        })?;

    let flags = extract_flags(args);
    let subcommand = args.iter().find(|a| !is_flag(a)).cloned();

    if !policy.allow.is_unrestricted() {
        let allowed = match &policy.allow {
            crate::policy::SubcommandAllow::List(list) => list.clone(),
            crate::policy::SubcommandAllow::All(_) => Vec::new(),
        };
        let ok = subcommand
            .as_deref()
            .is_some_and(|sub| allowed.iter().any(|a| a == sub));
        if !ok {
            return Err(ValidationError::SubcommandNotAllowed {
                command: normalized,
                subcommand: subcommand.unwrap_or_default(),
                allowed,
            });
        }
    }

    for flag in &flags {
        if policy.deny_flags.iter().any(|d| flags_match(d, flag)) {
            return Err(ValidationError::FlagNotAllowed {
                command: normalized,
                flag: flag.clone(),
            });
        }
    }

    let missing: Vec<String> = policy
        .require_flags
        .iter()
        .filter(|req| !flags.iter().any(|f| flags_match(f, req)))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingRequiredFlags {
            command: normalized,
            missing,
        });
    }

    if policy.path_args.auto_detect && policy.path_args.validate_sandbox {
        let read_roots: Vec<PathBuf> = config
            .permissions
            .read
            .iter()
            .map(|p| expand(p, cwd, home))
            .collect();
        let write_roots: Vec<PathBuf> = config
            .permissions
            .write
            .iter()
            .map(|p| expand(p, cwd, home))
            .collect();
        for arg in args {
            if is_path_like(arg) {
                validate_path_arg(arg, cwd, home, &read_roots, &write_roots)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::policy::{PathArgsPolicy, Permissions, SubcommandAllow};

    fn base_config() -> Config {
        Config {
            permissions: Permissions {
                run: vec!["git".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn normalize_strips_directory_component() {
        assert_eq!(Registry::normalize("/usr/bin/git"), "git");
        assert_eq!(Registry::normalize("git"), "git");
    }

    #[test]
    fn short_flag_decomposition_stops_at_non_letter() {
        assert_eq!(
            extract_flags(&["-abc".to_string()]),
            vec!["-a", "-b", "-c"]
        );
        assert_eq!(extract_flags(&["-o123".to_string()]), vec!["-o"]);
        assert_eq!(extract_flags(&["-1".to_string()]), Vec::<String>::new());
    }

    #[test]
    fn unknown_command_is_not_whitelisted() {
        let mut config = base_config();
        config.external.insert(
            "git".to_string(),
            ExternalPolicy {
                allow: SubcommandAllow::All(true),
                deny_flags: Vec::new(),
                require_flags: Vec::new(),
                path_args: PathArgsPolicy::default(),
            },
        );
        let registry = Registry::new(&config);
        let cwd = std::env::temp_dir();
        let home = std::env::temp_dir();
        let err = validate(&registry, &config, &cwd, &home, "curl", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotWhitelisted);
    }

    #[test]
    fn deny_flags_blocks_force_push() {
        let mut config = base_config();
        config.external.insert(
            "git".to_string(),
            ExternalPolicy {
                allow: SubcommandAllow::All(true),
                deny_flags: vec!["--force".to_string(), "-f".to_string()],
                require_flags: Vec::new(),
                path_args: PathArgsPolicy::default(),
            },
        );
        let registry = Registry::new(&config);
        let cwd = std::env::temp_dir();
        let home = std::env::temp_dir();
        let err = validate(
            &registry,
            &config,
            &cwd,
            &home,
            "git",
            &["push".to_string(), "--force".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::FlagNotAllowed { flag, .. } if flag == "--force"));

        assert!(validate(
            &registry,
            &config,
            &cwd,
            &home,
            "git",
            &["push".to_string()]
        )
        .is_ok());
    }

    #[test]
    fn subcommand_list_rejects_unlisted_subcommand() {
        let mut config = base_config();
        config.external.insert(
            "git".to_string(),
            ExternalPolicy {
                allow: SubcommandAllow::List(vec!["status".to_string(), "log".to_string()]),
                deny_flags: Vec::new(),
                require_flags: Vec::new(),
                path_args: PathArgsPolicy::default(),
            },
        );
        let registry = Registry::new(&config);
        let cwd = std::env::temp_dir();
        let home = std::env::temp_dir();
        let err = validate(
            &registry,
            &config,
            &cwd,
            &home,
            "git",
            &["push".to_string()],
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubcommandNotAllowed);
        assert!(validate(
            &registry,
            &config,
            &cwd,
            &home,
            "git",
            &["status".to_string()]
        )
        .is_ok());
    }

    #[test]
    fn validation_is_pure_and_repeatable() {
        let mut config = base_config();
        config.external.insert(
            "git".to_string(),
            ExternalPolicy {
                allow: SubcommandAllow::All(true),
                deny_flags: Vec::new(),
                require_flags: Vec::new(),
                path_args: PathArgsPolicy::default(),
            },
        );
        let registry = Registry::new(&config);
        let cwd = std::env::temp_dir();
        let home = std::env::temp_dir();
        let args = vec!["status".to_string()];
        let first = validate(&registry, &config, &cwd, &home, "git", &args);
        let second = validate(&registry, &config, &cwd, &home, "git", &args);
        assert_eq!(first.is_ok(), second.is_ok());
    }

    #[test]
    fn project_local_path_synthesizes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("build.sh");
        std::fs::write(&script_path, "#!/bin/sh\n").unwrap();

        let config = Config {
            project_dir: Some(dir.path().to_path_buf()),
            allow_project_commands: true,
            ..Default::default()
        };
        let registry = Registry::new(&config);
        let home = std::env::temp_dir();
        assert!(validate(
            &registry,
            &config,
            dir.path(),
            &home,
            script_path.to_str().unwrap(),
            &[]
        )
        .is_ok());
    }

    #[test]
    fn dotdot_normalization_is_path_violation_not_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        let outside = dir.path().join("outside");
        std::fs::create_dir(&allowed).unwrap();
        std::fs::create_dir(&outside).unwrap();
        std::fs::write(outside.join("secret"), b"hi").unwrap();

        let mut config = base_config();
        config.permissions.read = vec![allowed.to_str().unwrap().to_string()];
        config.external.insert(
            "cat".to_string(),
            ExternalPolicy {
                allow: SubcommandAllow::All(true),
                deny_flags: Vec::new(),
                require_flags: Vec::new(),
                path_args: PathArgsPolicy {
                    auto_detect: true,
                    validate_sandbox: true,
                },
            },
        );
        let registry = Registry::new(&config);
        let home = std::env::temp_dir();
        // No symlink anywhere here: plain `..` segments that happen to
        // canonicalize to a path outside `allowed`.
        let escaping = allowed.join("../outside/secret").to_str().unwrap().to_string();

        let err = validate(&registry, &config, &allowed, &home, "cat", &[escaping]).unwrap_err();
        assert!(matches!(err, ValidationError::PathViolation { .. }));
    }

    #[test]
    fn symlink_escape_is_symlink_violation() {
        #[cfg(unix)]
        {
            let dir = tempfile::tempdir().unwrap();
            let allowed = dir.path().join("allowed");
            let outside = dir.path().join("outside");
            std::fs::create_dir(&allowed).unwrap();
            std::fs::create_dir(&outside).unwrap();
            std::fs::write(outside.join("secret"), b"hi").unwrap();
            let link = allowed.join("escape");
            std::os::unix::fs::symlink(outside.join("secret"), &link).unwrap();

            let mut config = base_config();
            config.permissions.read = vec![allowed.to_str().unwrap().to_string()];
            config.external.insert(
                "cat".to_string(),
                ExternalPolicy {
                    allow: SubcommandAllow::All(true),
                    deny_flags: Vec::new(),
                    require_flags: Vec::new(),
                    path_args: PathArgsPolicy {
                        auto_detect: true,
                        validate_sandbox: true,
                    },
                },
            );
            let registry = Registry::new(&config);
            let home = std::env::temp_dir();
            let arg = link.to_str().unwrap().to_string();

            let err =
                validate(&registry, &config, &allowed, &home, "cat", &[arg]).unwrap_err();
            assert!(matches!(err, ValidationError::SymlinkViolation { .. }));
        }
    }
}
