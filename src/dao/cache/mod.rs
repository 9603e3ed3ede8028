//! Warm TTL cache keyed by join code.

pub mod memory;

use std::{future::Future, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dao::models::{SessionConfig, SessionStatus};

/// Default lifetime of a cached session snapshot.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60 * 60);

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache operation `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("cache unavailable: {message}")]
    Unavailable { message: String },
}

/// Snapshot of a live session kept under its join code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub quiz_id: Uuid,
    pub question_count: u32,
    /// Playable order of the current question, `0` before the first one.
    pub current_question: u32,
    pub status: SessionStatus,
    pub config: SessionConfig,
}

/// Number of participants that picked one option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OptionCount {
    pub option_id: Uuid,
    pub count: u32,
}

/// Answer distribution of one question, cached when the answer is revealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResponseAggregate {
    pub question_order: u32,
    pub question_id: Uuid,
    /// Number of participants that answered.
    pub total: u32,
    pub options: Vec<OptionCount>,
}

/// Key under which the snapshot of `code` lives.
pub fn snapshot_key(code: &str) -> String {
    format!("lqs:{code}")
}

/// Key under which the aggregated responses of question `order` live.
pub fn responses_key(code: &str, order: u32) -> String {
    format!("lqs:{code}:q:{order}")
}

/// Match `key` against a glob where `*` stands for any (possibly empty) run of characters.
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let pieces: Vec<&str> = parts.collect();
    let Some((last, middle)) = pieces.split_last() else {
        // No `*` at all.
        return rest.is_empty();
    };
    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Run a cache future under the soft deadline, mapping expiry to [`CacheError::Timeout`].
pub async fn with_cache_deadline<T, Fut>(
    operation: &'static str,
    limit: Duration,
    future: Fut,
) -> CacheResult<T>
where
    Fut: Future<Output = CacheResult<T>>,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or(Err(CacheError::Timeout {
            operation,
            after: limit,
        }))
}

/// Abstraction over the warm session cache.
pub trait SessionCache: Send + Sync {
    fn put(
        &self,
        code: String,
        snapshot: SessionSnapshot,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>>;
    fn get(&self, code: String) -> BoxFuture<'static, CacheResult<Option<SessionSnapshot>>>;
    /// Replace the snapshot and refresh its TTL. Returns `false` when the code is not cached.
    fn update(
        &self,
        code: String,
        snapshot: SessionSnapshot,
    ) -> BoxFuture<'static, CacheResult<bool>>;
    /// Keys (snapshot and response keys) matching a `*` glob.
    fn scan(&self, pattern: String) -> BoxFuture<'static, CacheResult<Vec<String>>>;
    /// Drop the snapshot of `code` together with its response aggregates.
    fn delete(&self, code: String) -> BoxFuture<'static, CacheResult<()>>;
    fn put_responses(
        &self,
        code: String,
        aggregate: ResponseAggregate,
    ) -> BoxFuture<'static, CacheResult<()>>;
    fn get_responses(
        &self,
        code: String,
        order: u32,
    ) -> BoxFuture<'static, CacheResult<Option<ResponseAggregate>>>;
}
