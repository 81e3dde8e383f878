//! Pending-retry protocol (component E): records blocked-command requests,
//! issues one-shot retry tokens, and consumes them with a user permission
//! choice (once/session/always).
//!
//! Each pending retry is correlated by an id and consumed exactly once;
//! three escalating grant scopes (once/session/always) decide how far the
//! resulting allowance extends beyond that single request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, SafeShellError};
use crate::limits::DEFAULT_RETRY_TTL_MS;

/// The context a blocked request needs to be re-run unchanged once granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<u64>,
    pub background: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRetry {
    pub id: String,
    pub code: String,
    pub blocked_commands: Vec<String>,
    pub not_found_commands: Vec<String>,
    pub context: RetryContext,
    pub shell_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 1 (once) | 2 (session) | 3 (always).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    Once,
    Session,
    Always,
}

impl TryFrom<u8> for UserChoice {
    type Error = SafeShellError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(UserChoice::Once),
            2 => Ok(UserChoice::Session),
            3 => Ok(UserChoice::Always),
            other => Err(SafeShellError::ConfigError(format!(
                "invalid userChoice {other}, expected 1, 2, or 3"
            ))),
        }
    }
}

/// A map keyed by id with single-use (remove-on-get) semantics and a sweeper
/// for TTL expiry.
pub struct RetryStore {
    pending: Mutex<HashMap<String, PendingRetry>>,
    ttl: Duration,
}

impl RetryStore {
    pub fn new(ttl_ms: Option<u64>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl: Duration::from_millis(ttl_ms.unwrap_or(DEFAULT_RETRY_TTL_MS)),
        }
    }

    /// Creates a single-command retry. `create_multi` covers the case where
    /// snippet preflight surfaces several violations at once.
    pub async fn create(
        &self,
        code: String,
        blocked_command: String,
        not_found_commands: Vec<String>,
        context: RetryContext,
        shell_id: Option<String>,
    ) -> String {
        self.create_multi(code, vec![blocked_command], not_found_commands, context, shell_id)
            .await
    }

    pub async fn create_multi(
        &self,
        code: String,
        blocked_commands: Vec<String>,
        not_found_commands: Vec<String>,
        context: RetryContext,
        shell_id: Option<String>,
    ) -> String {
        let id = format!("retry-{}", Uuid::new_v4());
        let retry = PendingRetry {
            id: id.clone(),
            code,
            blocked_commands,
            not_found_commands,
            context,
            shell_id,
            created_at: Utc::now(),
        };
        let mut pending = self.pending.lock().await;
        self.sweep_locked(&mut pending);
        pending.insert(id.clone(), retry);
        id
    }

    /// Removes and returns the retry for `id`; a second call with the same
    /// id yields `RETRY_NOT_FOUND`, matching the one-shot invariant.
    pub async fn consume(&self, id: &str) -> Result<PendingRetry> {
        let mut pending = self.pending.lock().await;
        self.sweep_locked(&mut pending);
        pending
            .remove(id)
            .ok_or_else(|| SafeShellError::RetryNotFound(id.to_string()))
    }

    fn sweep_locked(&self, pending: &mut HashMap<String, PendingRetry>) {
        let ttl = self.ttl;
        let now = Utc::now();
        pending.retain(|_, retry| {
            let age = now.signed_duration_since(retry.created_at);
            age.to_std().map(|age| age < ttl).unwrap_or(true)
        });
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn ctx() -> RetryContext {
        RetryContext {
            cwd: PathBuf::from("/tmp"),
            env: HashMap::new(),
            timeout: None,
            background: false,
        }
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let store = RetryStore::new(None);
        let id = store
            .create("curl x".to_string(), "curl".to_string(), Vec::new(), ctx(), None)
            .await;
        let first = store.consume(&id).await;
        assert!(first.is_ok());
        let second = store.consume(&id).await.unwrap_err();
        assert_eq!(second.code(), crate::error::ErrorCode::RetryNotFound);
    }

    #[tokio::test]
    async fn user_choice_parses_1_2_3_only() {
        assert_eq!(UserChoice::try_from(1).unwrap(), UserChoice::Once);
        assert_eq!(UserChoice::try_from(2).unwrap(), UserChoice::Session);
        assert_eq!(UserChoice::try_from(3).unwrap(), UserChoice::Always);
        assert!(UserChoice::try_from(4).is_err());
    }

    #[tokio::test]
    async fn expired_retries_are_swept_on_next_access() {
        let store = RetryStore::new(Some(0));
        let id = store
            .create("curl x".to_string(), "curl".to_string(), Vec::new(), ctx(), None)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.consume(&id).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RetryNotFound);
    }
}
