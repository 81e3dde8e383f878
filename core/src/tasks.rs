//! Task orchestrator (component F): named tasks composed of atomic commands,
//! serial groups, parallel groups, string references, and the array-literal
//! shorthand (`"[a, b, c]"`, `"[-s, a, b, c]"`).
//!
//! The array-literal shorthand is tokenized and parsed by hand with a small
//! recursive-descent routine rather than pulling in a parser-generator
//! crate.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SafeShellError};
use crate::limits::MAX_TASK_NESTING_DEPTH;

/// One entry of `config.tasks`. A plain string is either a reference to
/// another named task, or an array-literal shorthand (`"[a, b]"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDef {
    Atomic {
        cmd: String,
    },
    Serial {
        serial: Vec<String>,
    },
    Parallel {
        parallel: Vec<String>,
    },
    Ref(String),
}

/// Outcome of running one task (atomic or group), mirroring a `Script`'s
/// terminal fields closely enough to hand back to a caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The atomic-execution hook the orchestrator calls into. Implemented by the
/// sandbox launcher in production; tests supply a stub.
#[async_trait]
pub trait SnippetRunner: Send + Sync {
    async fn run_snippet(&self, code: &str) -> Result<TaskOutcome>;
}

/// Runs a named task to completion, resolving string references (including
/// array-literal shorthand) and enforcing serial-stop-on-failure /
/// parallel-all-settled semantics.
pub async fn run_task(
    name: &str,
    tasks: &HashMap<String, TaskDef>,
    runner: &dyn SnippetRunner,
) -> Result<TaskOutcome> {
    let mut visited = HashSet::new();
    let mut synthetic = HashMap::new();
    run_task_inner(name, tasks, &mut synthetic, &mut visited, runner).await
}

/// Boxed because `async fn` cannot call itself directly without producing
/// an infinitely-sized future.
fn run_task_inner<'a>(
    name: &'a str,
    tasks: &'a HashMap<String, TaskDef>,
    synthetic: &'a mut HashMap<String, TaskDef>,
    visited: &'a mut HashSet<String>,
    runner: &'a dyn SnippetRunner,
) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>> {
    Box::pin(async move {
        if !visited.insert(name.to_string()) {
            return Err(SafeShellError::ConfigError(format!(
                "cycle detected while resolving task '{name}'"
            )));
        }

        let def = resolve(name, tasks, synthetic)?;

        let outcome = match def {
            TaskDef::Atomic { cmd } => runner.run_snippet(&cmd).await?,
            TaskDef::Serial { serial } => {
                run_serial(&serial, tasks, synthetic, visited, runner).await?
            }
            TaskDef::Parallel { parallel } => {
                run_parallel(&parallel, tasks, synthetic, visited, runner).await?
            }
            TaskDef::Ref(reference) => {
                run_task_inner(&reference, tasks, synthetic, visited, runner).await?
            }
        };

        visited.remove(name);
        Ok(outcome)
    })
}

/// Looks `name` up in `tasks`, falling back to `synthetic` (entries
/// materialized by array-literal expansion), expanding array-literal syntax
/// on demand.
fn resolve(
    name: &str,
    tasks: &HashMap<String, TaskDef>,
    synthetic: &mut HashMap<String, TaskDef>,
) -> Result<TaskDef> {
    if let Some(def) = synthetic.get(name) {
        return Ok(def.clone());
    }
    if let Some(def) = tasks.get(name) {
        if let TaskDef::Ref(reference) = def {
            if is_array_literal(reference) {
                let expanded = parse_array_literal(reference, synthetic)?;
                return Ok(expanded);
            }
        }
        return Ok(def.clone());
    }
    if is_array_literal(name) {
        return parse_array_literal(name, synthetic);
    }
    Err(SafeShellError::ConfigError(format!(
        "no task named '{name}'"
    )))
}

async fn run_serial(
    refs: &[String],
    tasks: &HashMap<String, TaskDef>,
    synthetic: &mut HashMap<String, TaskDef>,
    visited: &mut HashSet<String>,
    runner: &dyn SnippetRunner,
) -> Result<TaskOutcome> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for member in refs {
        let label = display_label(member);
        let outcome = run_task_inner(member, tasks, synthetic, visited, runner).await?;
        stdout.push_str(&format!("[{label}]\n{}", outcome.stdout));
        stderr.push_str(&format!("[{label}]\n{}", outcome.stderr));
        if !outcome.success {
            return Ok(TaskOutcome {
                success: false,
                stdout,
                stderr,
                exit_code: outcome.exit_code,
            });
        }
    }
    Ok(TaskOutcome {
        success: true,
        stdout,
        stderr,
        exit_code: 0,
    })
}

async fn run_parallel(
    refs: &[String],
    tasks: &HashMap<String, TaskDef>,
    synthetic: &mut HashMap<String, TaskDef>,
    visited: &mut HashSet<String>,
    runner: &dyn SnippetRunner,
) -> Result<TaskOutcome> {
    // All-settled join: every member runs to completion even if one fails,
    // and members actually overlap rather than running one at a time. Each
    // branch gets its own cloned `synthetic`/`visited` state so the fan-out
    // doesn't need shared mutable access across concurrent futures; cycle
    // detection still applies within each branch's own call chain.
    let branches = refs.iter().map(|member| {
        let label = display_label(member);
        let mut branch_synthetic = synthetic.clone();
        let mut branch_visited = visited.clone();
        async move {
            let result =
                run_task_inner(member, tasks, &mut branch_synthetic, &mut branch_visited, runner)
                    .await;
            (label, result)
        }
    });
    let results = join_all(branches).await;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut success = true;
    let mut exit_code = 0;
    for (label, result) in results {
        match result {
            Ok(outcome) => {
                stdout.push_str(&format!("[{label}]\n{}", outcome.stdout));
                stderr.push_str(&format!("[{label}]\n{}", outcome.stderr));
                if !outcome.success {
                    success = false;
                    exit_code = outcome.exit_code;
                }
            }
            Err(err) => {
                success = false;
                stderr.push_str(&format!("[{label}]\n{err}\n"));
            }
        }
    }
    Ok(TaskOutcome {
        success,
        stdout,
        stderr,
        exit_code,
    })
}

fn display_label(reference: &str) -> String {
    if is_array_literal(reference) {
        "group".to_string()
    } else {
        reference.to_string()
    }
}

fn is_array_literal(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.starts_with('[') && trimmed.ends_with(']')
}

// ---------------------------------------------------------------------
// Array-literal tokenizer/parser
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LBracket,
    RBracket,
    Comma,
    SerialFlag,
    Ident(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.trim().chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '[' => {
                tokens.push(Token::LBracket);
                chars.next();
            }
            ']' => {
                tokens.push(Token::RBracket);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '-' => {
                // Only the literal "-s" flag is recognized here; any other
                // leading dash belongs to an identifier (task names may
                // contain '-').
                let mut lookahead = chars.clone();
                lookahead.next();
                if lookahead.peek() == Some(&'s') {
                    let mut after = lookahead.clone();
                    after.next();
                    let next_breaks_ident = matches!(after.peek(), None | Some(',') | Some(']'))
                        || after.peek().is_some_and(|c| c.is_whitespace());
                    if next_breaks_ident {
                        tokens.push(Token::SerialFlag);
                        chars.next();
                        chars.next();
                        continue;
                    }
                }
                let ident = take_ident(&mut chars);
                tokens.push(Token::Ident(ident));
            }
            c if is_ident_char(c) => {
                let ident = take_ident(&mut chars);
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(SafeShellError::ConfigError(format!(
                    "unexpected character '{other}' in array literal"
                )));
            }
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':'
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
        if is_ident_char(c) {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArrayNode {
    Parallel(Vec<ArrayItem>),
    Serial(Vec<ArrayItem>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArrayItem {
    Name(String),
    Nested(ArrayNode),
}

struct ArrayParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ArrayParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_array(&mut self) -> Result<ArrayNode> {
        self.parse_array_at_depth(0)
    }

    fn parse_array_at_depth(&mut self, depth: usize) -> Result<ArrayNode> {
        if depth >= MAX_TASK_NESTING_DEPTH {
            return Err(SafeShellError::ConfigError(format!(
                "array literal nesting exceeds the limit of {MAX_TASK_NESTING_DEPTH}"
            )));
        }
        match self.next() {
            Some(Token::LBracket) => {}
            _ => return Err(SafeShellError::ConfigError("expected '['".to_string())),
        }

        let serial = matches!(self.peek(), Some(Token::SerialFlag));
        if serial {
            self.next();
        }

        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBracket) => {
                    self.next();
                    break;
                }
                Some(Token::Ident(_)) => {
                    if let Some(Token::Ident(name)) = self.next() {
                        items.push(ArrayItem::Name(name));
                    }
                }
                Some(Token::LBracket) => {
                    let nested = self.parse_array_at_depth(depth + 1)?;
                    items.push(ArrayItem::Nested(nested));
                }
                _ => {
                    return Err(SafeShellError::ConfigError(
                        "malformed array literal".to_string(),
                    ));
                }
            }
            match self.peek() {
                Some(Token::Comma) => {
                    self.next();
                }
                Some(Token::RBracket) => {
                    self.next();
                    break;
                }
                other => {
                    return Err(SafeShellError::ConfigError(format!(
                        "expected ',' or ']', found {other:?}"
                    )));
                }
            }
        }

        if items.is_empty() {
            return Err(SafeShellError::ConfigError(
                "empty array literal is not a valid task group".to_string(),
            ));
        }
        if serial && items.len() == 1 && matches!(items[0], ArrayItem::Name(_)) {
            // "[-s]" with no members is handled by the empty-items check
            // above; a lone member is still valid serial-of-one.
        }

        Ok(if serial {
            ArrayNode::Serial(items)
        } else {
            ArrayNode::Parallel(items)
        })
    }
}

fn parse_array_node(input: &str) -> Result<ArrayNode> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SafeShellError::ConfigError(
            "empty array literal".to_string(),
        ));
    }
    let mut parser = ArrayParser::new(tokens);
    let node = parser.parse_array()?;
    if parser.pos != parser.tokens.len() {
        return Err(SafeShellError::ConfigError(
            "trailing tokens after array literal".to_string(),
        ));
    }
    Ok(node)
}

/// Parses `literal`, materializing every nested group as a synthetic named
/// task in `synthetic`, and returns the root task def.
fn parse_array_literal(
    literal: &str,
    synthetic: &mut HashMap<String, TaskDef>,
) -> Result<TaskDef> {
    let node = parse_array_node(literal)?;
    let root_name = materialize(node, synthetic, &mut 0);
    Ok(TaskDef::Ref(root_name))
}

fn materialize(node: ArrayNode, synthetic: &mut HashMap<String, TaskDef>, counter: &mut u64) -> String {
    let members: Vec<String> = match &node {
        ArrayNode::Parallel(items) | ArrayNode::Serial(items) => items
            .iter()
            .map(|item| match item {
                ArrayItem::Name(name) => name.clone(),
                ArrayItem::Nested(nested) => materialize(nested.clone(), synthetic, counter),
            })
            .collect(),
    };

    *counter += 1;
    let name = format!("__array_{counter}");
    let def = match node {
        ArrayNode::Parallel(_) => TaskDef::Parallel { parallel: members },
        ArrayNode::Serial(_) => TaskDef::Serial { serial: members },
    };
    synthetic.insert(name.clone(), def);
    name
}

/// Serializes an `ArrayNode` back to its textual form, for the round-trip
/// property (parse -> serialize -> parse yields the same AST).
fn serialize_array_node(node: &ArrayNode) -> String {
    let (prefix, items) = match node {
        ArrayNode::Parallel(items) => ("", items),
        ArrayNode::Serial(items) => ("-s, ", items),
    };
    let body = items
        .iter()
        .map(|item| match item {
            ArrayItem::Name(name) => name.clone(),
            ArrayItem::Nested(nested) => serialize_array_node(nested),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{prefix}{body}]")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    struct EchoRunner;

    #[async_trait]
    impl SnippetRunner for EchoRunner {
        async fn run_snippet(&self, code: &str) -> Result<TaskOutcome> {
            Ok(TaskOutcome {
                success: true,
                stdout: code.to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    struct FailingRunner {
        fail_on: &'static str,
    }

    #[async_trait]
    impl SnippetRunner for FailingRunner {
        async fn run_snippet(&self, code: &str) -> Result<TaskOutcome> {
            if code == self.fail_on {
                Ok(TaskOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: "boom".to_string(),
                    exit_code: 1,
                })
            } else {
                Ok(TaskOutcome {
                    success: true,
                    stdout: code.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }
        }
    }

    fn tasks_with(entries: &[(&str, TaskDef)]) -> HashMap<String, TaskDef> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn serial_pipeline_stops_at_first_failure() {
        let tasks = tasks_with(&[
            ("a", TaskDef::Atomic { cmd: "console.log('A')".to_string() }),
            ("b", TaskDef::Atomic { cmd: "console.log('B')".to_string() }),
            (
                "pipeline",
                TaskDef::Ref("[-s, a, b]".to_string()),
            ),
        ]);
        let runner = EchoRunner;
        let outcome = run_task("pipeline", &tasks, &runner).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.contains("[a]"));
        assert!(outcome.stdout.contains("[b]"));
        assert!(outcome.stdout.find("[a]").unwrap() < outcome.stdout.find("[b]").unwrap());

        let failing_tasks = tasks_with(&[
            ("a", TaskDef::Atomic { cmd: "console.log('A')".to_string() }),
            ("b", TaskDef::Atomic { cmd: "console.log('B')".to_string() }),
            ("pipeline", TaskDef::Ref("[-s, a, b]".to_string())),
        ]);
        let runner = FailingRunner {
            fail_on: "console.log('A')",
        };
        let outcome = run_task("pipeline", &failing_tasks, &runner).await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.stdout.contains("[b]"));
    }

    #[test]
    fn empty_array_is_rejected() {
        assert!(parse_array_node("[]").is_err());
    }

    #[test]
    fn lone_serial_flag_is_rejected() {
        assert!(parse_array_node("[-s]").is_err());
    }

    #[test]
    fn single_element_parses_as_parallel_of_one() {
        let node = parse_array_node("[a]").unwrap();
        assert_eq!(node, ArrayNode::Parallel(vec![ArrayItem::Name("a".to_string())]));
    }

    #[test]
    fn array_literal_round_trips_through_serialize_and_parse() {
        for literal in ["[a, b, c]", "[-s, a, b, c]", "[a, [-s, b, c], d]"] {
            let parsed = parse_array_node(literal).unwrap();
            let serialized = serialize_array_node(&parsed);
            let reparsed = parse_array_node(&serialized).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[tokio::test]
    async fn cycle_detection_yields_config_error() {
        let tasks = tasks_with(&[
            ("a", TaskDef::Ref("b".to_string())),
            ("b", TaskDef::Ref("a".to_string())),
        ]);
        let runner = EchoRunner;
        let err = run_task("a", &tasks, &runner).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigError);
    }

    #[test]
    fn array_nesting_beyond_the_limit_is_rejected() {
        let mut literal = "a".to_string();
        for _ in 0..=MAX_TASK_NESTING_DEPTH {
            literal = format!("[{literal}]");
        }
        let err = parse_array_node(&literal).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigError);
    }

    #[test]
    fn array_nesting_at_the_limit_is_accepted() {
        let mut literal = "a".to_string();
        for _ in 0..MAX_TASK_NESTING_DEPTH {
            literal = format!("[{literal}]");
        }
        assert!(parse_array_node(&literal).is_ok());
    }
}
