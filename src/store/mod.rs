//! # Store Module
//!
//! Shared key-value store used by every resilience component: the lookup
//! cache, the request locks, the cookie health pool and telemetry.
//!
//! The store is always passed in explicitly as an `Arc<dyn KvStore>` handle.
//! The owning process decides whether that handle is backed by Redis
//! ([`RedisStore`]) or by the in-process [`MemoryStore`].
//!
//! ## Atomicity
//!
//! Single commands are atomic on their own. Multi-step writes are collected
//! in a [`Batch`] and submitted through [`KvStore::execute`], which applies
//! them as one unit so other workers never observe half a record.
//!
//! ## Failure policy
//!
//! Callers never let a store failure break the request flow. Results go
//! through [`BestEffort`], which logs and degrades to a safe default.

pub mod keys;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errores del almacén compartido
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Single write inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    SAdd {
        key: String,
        member: String,
    },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

/// Ordered group of writes applied atomically by [`KvStore::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hincr_by(mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        self.ops.push(BatchOp::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn zincr_by(mut self, key: impl Into<String>, member: impl Into<String>, delta: f64) -> Self {
        self.ops.push(BatchOp::ZIncrBy {
            key: key.into(),
            member: member.into(),
            delta,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Handle to the shared key-value store.
///
/// Every method is a single bounded round-trip. Implementations must apply
/// their own per-operation timeout and report it as [`StoreError::Timeout`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Comprueba que el almacén responde
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Returns every field of a hash; an absent key yields an empty map.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Remaining time to live, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Refreshes the expiry of an existing key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomic "create if absent, with TTL". Returns true when the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes a key. Returns whether something was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Increments `field` of an existing hash, writes `touch` fields and
    /// refreshes the TTL, all atomically. Absent hashes are left untouched and
    /// `false` is returned.
    async fn hincr_existing(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        touch: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Members of a sorted set, highest score first, at most `limit` entries.
    async fn zrevrange_withscores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>>;

    /// Applies every operation of the batch as one atomic unit.
    async fn execute(&self, batch: Batch) -> StoreResult<()>;
}

/// Best-effort handling of store results.
///
/// Telemetry, TTL refreshes and usage accounting must never abort the caller.
/// This trait centralizes "log and carry on" so call sites stay explicit about
/// the fallback they get.
pub trait BestEffort<T> {
    /// Logs the failure and yields `None`.
    fn best_effort(self, what: &str) -> Option<T>;

    /// Logs the failure and yields the provided fallback.
    fn or_fallback(self, what: &str, fallback: T) -> T
    where
        Self: Sized,
    {
        self.best_effort(what).unwrap_or(fallback)
    }
}

impl<T> BestEffort<T> for StoreResult<T> {
    fn best_effort(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("⚠️ {} falló (continuando sin él): {}", what, e);
                None
            }
        }
    }
}

/// Timestamp actual en segundos unix
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
