use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

use super::{Batch, BatchOp, KvStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

/// Entrada con expiración opcional
#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key '{}'", key))
}

/// In-process [`KvStore`] backed by a `DashMap`.
///
/// Expiry uses `tokio::time::Instant`, so a paused test clock drives TTLs.
/// Expired keys are dropped lazily on access or by [`MemoryStore::cleanup_expired`].
/// Batches take an exclusive gate, so readers never see half-applied writes.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Arc<DashMap<String, StoredEntry>>,
    gate: Arc<RwLock<()>>,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            gate: Arc::new(RwLock::new(())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`StoreError::Connection`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("Limpiadas {} entradas expiradas del store", removed);
        }

        removed
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection("memory store marked unavailable".into()))
        }
    }

    /// Runs `f` against a live entry, dropping it first if it has expired.
    fn read<R>(&self, key: &str, f: impl FnOnce(&StoredEntry) -> R) -> Option<R> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(f(entry.value())),
            None => return None,
        };
        if expired {
            self.data.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    /// Gets or creates the value at `key`, replacing expired entries.
    fn upsert(
        &self,
        key: &str,
        now: Instant,
        make: fn() -> Value,
        f: impl FnOnce(&str, &mut Value) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(make()));
        if slot.is_expired(now) {
            *slot = StoredEntry::new(make());
        }
        f(key, &mut slot.value)
    }

    fn apply(&self, op: &BatchOp, now: Instant) -> StoreResult<()> {
        match op {
            BatchOp::HSet { key, fields } => self.upsert(key, now, || Value::Hash(HashMap::new()), |key, value| {
                let Value::Hash(hash) = value else {
                    return Err(wrong_type(key));
                };
                for (field, v) in fields {
                    hash.insert(field.clone(), v.clone());
                }
                Ok(())
            }),
            BatchOp::HIncrBy { key, field, delta } => {
                self.upsert(key, now, || Value::Hash(HashMap::new()), |key, value| {
                    let Value::Hash(hash) = value else {
                        return Err(wrong_type(key));
                    };
                    incr_field(hash, field, *delta).map(|_| ())
                })
            }
            BatchOp::Set { key, value, ttl } => {
                let mut entry = StoredEntry::new(Value::Str(value.clone()));
                entry.expires_at = ttl.map(|ttl| now + ttl);
                self.data.insert(key.clone(), entry);
                Ok(())
            }
            BatchOp::SAdd { key, member } => self.upsert(key, now, || Value::Set(HashSet::new()), |key, value| {
                let Value::Set(set) = value else {
                    return Err(wrong_type(key));
                };
                set.insert(member.clone());
                Ok(())
            }),
            BatchOp::ZIncrBy { key, member, delta } => {
                self.upsert(key, now, || Value::ZSet(HashMap::new()), |key, value| {
                    let Value::ZSet(zset) = value else {
                        return Err(wrong_type(key));
                    };
                    *zset.entry(member.clone()).or_insert(0.0) += *delta;
                    Ok(())
                })
            }
            BatchOp::Expire { key, ttl } => {
                if let Some(mut entry) = self.data.get_mut(key) {
                    if !entry.is_expired(now) {
                        entry.expires_at = Some(now + *ttl);
                    }
                }
                Ok(())
            }
            BatchOp::Del { key } => {
                self.data.remove(key);
                Ok(())
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn incr_field(hash: &mut HashMap<String, String>, field: &str, delta: i64) -> StoreResult<i64> {
    let current = match hash.get(field) {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| StoreError::Command(format!("hash field '{}' is not an integer", field)))?,
        None => 0,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StoreError::Command(format!("increment of hash field '{}' would overflow", field)))?;
    hash.insert(field.to_string(), next.to_string());
    Ok(next)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let _gate = self.gate.read();
        match self.read(key, |entry| entry.value.clone()) {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        let _gate = self.gate.read();
        match self.read(key, |entry| entry.value.clone()) {
            Some(Value::Hash(hash)) => Ok(hash),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check()?;
        let _gate = self.gate.read();
        let now = Instant::now();
        Ok(self
            .read(key, |entry| entry.expires_at)
            .flatten()
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let _gate = self.gate.read();
        Ok(self.read(key, |_| ()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let _gate = self.gate.read();
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let _gate = self.gate.read();
        let now = Instant::now();
        let mut fresh = StoredEntry::new(Value::Str(value.to_string()));
        fresh.expires_at = Some(now + ttl);

        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let _gate = self.gate.read();
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let _gate = self.gate.read();
        match self.read(key, |entry| entry.value.clone()) {
            Some(Value::Set(set)) => {
                let mut members: Vec<String> = set.into_iter().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn hincr_existing(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        touch: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        let _gate = self.gate.read();
        let now = Instant::now();
        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        incr_field(hash, field, delta)?;
        for (f, v) in touch {
            hash.insert(f.clone(), v.clone());
        }
        entry.expires_at = Some(now + ttl);
        Ok(true)
    }

    async fn zrevrange_withscores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        self.check()?;
        let _gate = self.gate.read();
        match self.read(key, |entry| entry.value.clone()) {
            Some(Value::ZSet(zset)) => {
                let mut members: Vec<(String, f64)> = zset.into_iter().collect();
                members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                members.truncate(limit);
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn execute(&self, batch: Batch) -> StoreResult<()> {
        self.check()?;
        let _gate = self.gate.write();
        let now = Instant::now();

        // Como EXEC: un comando fallido no deshace los demás
        let mut first_error = None;
        for op in batch.ops() {
            if let Err(e) = self.apply(op, now) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
