use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use super::{normalize_query, CacheEntry, StableId, F_TS, F_USAGE};
use crate::store::{now_unix, BestEffort, Batch, KeySpace, KvStore};

/// Metadata cache over the shared store.
///
/// Entries are written under the normalized query and, when the result has a
/// video id, under that id too. A `q2id` pointer lets every phrasing of a
/// request converge on the id-keyed record, which is authoritative. Reads
/// refresh the TTL so popular entries stay while unused ones expire on their
/// own.
///
/// Store failures never surface: reads degrade into misses and writes are
/// logged and dropped.
#[derive(Clone)]
pub struct LookupCache {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl LookupCache {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Busca por texto libre, prefiriendo la entrada por video id
    pub async fn get_by_query(&self, query: &str) -> Option<CacheEntry> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return None;
        }
        let alias_key = self.keys.query_to_id(normalized.as_str());

        let alias = self
            .store
            .get(&alias_key)
            .await
            .best_effort("lectura de alias q2id")
            .flatten()
            .and_then(StableId::new);

        if let Some(stable_id) = alias {
            let id_key = self.keys.id(stable_id.as_str());
            if let Some(entry) = self.read_entry(&id_key).await {
                self.refresh(&[id_key.as_str(), alias_key.as_str()]).await;
                debug!("✅ Cache hit (alias → {}) para: '{}'", stable_id, normalized);
                return Some(entry);
            }
        }

        let query_key = self.keys.query(normalized.as_str());
        match self.read_entry(&query_key).await {
            Some(entry) => {
                self.refresh(&[query_key.as_str()]).await;
                debug!("✅ Cache hit para: '{}'", normalized);
                Some(entry)
            }
            None => {
                debug!("❌ Cache miss para: '{}'", normalized);
                None
            }
        }
    }

    /// Busca directamente por video id
    pub async fn get_by_id(&self, stable_id: &StableId) -> Option<CacheEntry> {
        let id_key = self.keys.id(stable_id.as_str());
        let entry = self.read_entry(&id_key).await?;
        self.refresh(&[id_key.as_str()]).await;
        debug!("✅ Cache hit por id: {}", stable_id);
        Some(entry)
    }

    /// Stores an extraction result in one atomic batch.
    ///
    /// Writes the query-keyed hash and, if the entry carries a video id, the
    /// id-keyed hash, the `q2id` pointer and the alias-set membership, all
    /// with the same TTL. Returns whether the batch reached the store.
    pub async fn put(&self, query: &str, entry: &CacheEntry) -> bool {
        let normalized = normalize_query(query);
        let fields = entry.to_fields(now_unix());
        let mut batch = Batch::new();

        if !normalized.is_empty() {
            let query_key = self.keys.query(normalized.as_str());
            batch = batch.hset(query_key.clone(), fields.clone()).expire(query_key, self.ttl);
        }

        if let Some(stable_id) = &entry.stable_id {
            let id_key = self.keys.id(stable_id.as_str());
            batch = batch.hset(id_key.clone(), fields).expire(id_key, self.ttl);

            if !normalized.is_empty() {
                let aliases_key = self.keys.aliases(stable_id.as_str());
                batch = batch
                    .set(
                        self.keys.query_to_id(normalized.as_str()),
                        stable_id.as_str(),
                        Some(self.ttl),
                    )
                    .sadd(aliases_key.clone(), normalized.as_str())
                    .expire(aliases_key, self.ttl);
            }
        }

        if batch.is_empty() {
            debug!("⚠️ Entrada sin query ni id, no se guarda: {}", entry.title);
            return false;
        }

        let stored = self.store.execute(batch).await.best_effort("guardado en caché").is_some();
        if stored {
            debug!("💾 Guardado en caché: '{}' ({})", normalized, entry.title);
        }
        stored
    }

    /// Counts a reuse of whichever keyed entries exist.
    ///
    /// Increments `usage`, stamps `ts` and refreshes the TTL. Absent entries
    /// are not created. Failures are only logged.
    pub async fn bump_usage(&self, query: Option<&str>, stable_id: Option<&StableId>) {
        let touch = [(F_TS.to_string(), now_unix().to_string())];

        if let Some(stable_id) = stable_id {
            let id_key = self.keys.id(stable_id.as_str());
            self.store
                .hincr_existing(&id_key, F_USAGE, 1, &touch, self.ttl)
                .await
                .best_effort("incremento de uso (id)");
        }

        if let Some(query) = query {
            let normalized = normalize_query(query);
            if !normalized.is_empty() {
                let query_key = self.keys.query(normalized.as_str());
                self.store
                    .hincr_existing(&query_key, F_USAGE, 1, &touch, self.ttl)
                    .await
                    .best_effort("incremento de uso (query)");
            }
        }
    }

    /// Normalized queries currently aliased to a video id.
    pub async fn aliases(&self, stable_id: &StableId) -> Vec<String> {
        self.store
            .smembers(&self.keys.aliases(stable_id.as_str()))
            .await
            .or_fallback("lectura de alias", Vec::new())
    }

    /// Drops the id entry, its alias set, and every query entry and pointer
    /// that resolved to it, in one atomic batch.
    pub async fn invalidate_id(&self, stable_id: &StableId) -> bool {
        let aliases = self.aliases(stable_id).await;
        let mut batch = Batch::new()
            .del(self.keys.id(stable_id.as_str()))
            .del(self.keys.aliases(stable_id.as_str()));
        for alias in &aliases {
            batch = batch.del(self.keys.query_to_id(alias)).del(self.keys.query(alias));
        }

        let done = self.store.execute(batch).await.best_effort("invalidación por id").is_some();
        if done {
            info!("🗑️ Invalidado {} junto con {} alias", stable_id, aliases.len());
        }
        done
    }

    /// Drops a single query entry and its id pointer.
    pub async fn invalidate_query(&self, query: &str) -> bool {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return false;
        }
        let batch = Batch::new()
            .del(self.keys.query(normalized.as_str()))
            .del(self.keys.query_to_id(normalized.as_str()));
        self.store.execute(batch).await.best_effort("invalidación por query").is_some()
    }

    async fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let fields = self.store.hgetall(key).await.best_effort("lectura de caché")?;
        CacheEntry::from_fields(&fields)
    }

    async fn refresh(&self, keys: &[&str]) {
        let batch = keys
            .iter()
            .fold(Batch::new(), |batch, key| batch.expire(*key, self.ttl));
        self.store.execute(batch).await.best_effort("refresco de TTL");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    const TTL: Duration = Duration::from_secs(3600);

    fn setup() -> (Arc<MemoryStore>, LookupCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = LookupCache::new(store.clone(), KeySpace::default(), TTL);
        (store, cache)
    }

    fn entry_with_id(id: &str) -> CacheEntry {
        CacheEntry::new("file-xyz", "Li Beirut")
            .with_performer("Fairuz")
            .with_duration(272)
            .with_stable_id(StableId::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_put_then_get_by_query() {
        let (_, cache) = setup();
        let entry = entry_with_id("abc123def");
        assert!(cache.put("Fairuz Li Beirut", &entry).await);

        let hit = cache.get_by_query("Fairuz Li Beirut").await.unwrap();
        assert_eq!(hit.stable_id, entry.stable_id);
        assert_eq!(hit.title, entry.title);
        assert_eq!(hit.file_ref, entry.file_ref);
    }

    #[tokio::test]
    async fn test_get_by_id_matches_query_entry() {
        let (_, cache) = setup();
        let entry = entry_with_id("abc123def");
        cache.put("fairuz", &entry).await;

        let by_id = cache.get_by_id(&StableId::new("abc123def").unwrap()).await.unwrap();
        let by_query = cache.get_by_query("fairuz").await.unwrap();
        assert_eq!(by_id, by_query);
    }

    #[tokio::test]
    async fn test_alias_prefers_id_entry() {
        let (_, cache) = setup();
        let id = StableId::new("abc123def").unwrap();
        cache.put("li beirut", &entry_with_id("abc123def")).await;

        // Otra frase que converge en el mismo id con datos más nuevos
        let newer = CacheEntry::new("file-new", "Li Beirut (Live)").with_stable_id(id.clone());
        cache.put("fairuz li beirut live", &newer).await;

        let hit = cache.get_by_query("li beirut").await.unwrap();
        assert_eq!(hit.file_ref, "file-new");
        assert_eq!(cache.aliases(&id).await, vec![
            "fairuz li beirut live".to_string(),
            "li beirut".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_entry_without_id_uses_query_key() {
        let (_, cache) = setup();
        let entry = CacheEntry::new("file-plain", "Some upload");
        cache.put("some upload", &entry).await;

        let hit = cache.get_by_query("SOME   upload").await.unwrap();
        assert_eq!(hit.file_ref, "file-plain");
        assert_eq!(hit.stable_id, None);
    }

    #[tokio::test]
    async fn test_empty_query_is_never_a_key() {
        let (store, cache) = setup();
        assert!(!cache.put("   ", &CacheEntry::new("f", "t")).await);
        assert!(store.is_empty());
        assert_eq!(cache.get_by_query("   ").await, None);
    }

    #[tokio::test]
    async fn test_bump_usage_increments_existing_entries() {
        let (_, cache) = setup();
        let entry = entry_with_id("abc123def");
        cache.put("fairuz", &entry).await;

        cache.bump_usage(Some("FAIRUZ"), entry.stable_id.as_ref()).await;
        cache.bump_usage(None, entry.stable_id.as_ref()).await;

        let by_id = cache.get_by_id(entry.stable_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(by_id.usage_count, 3);
        let raw = cache.read_entry(&KeySpace::default().query("fairuz")).await.unwrap();
        assert_eq!(raw.usage_count, 2);
    }

    #[tokio::test]
    async fn test_bump_usage_on_missing_entry_is_noop() {
        let (store, cache) = setup();
        cache
            .bump_usage(Some("nothing here"), Some(&StableId::new("zzz999zzz").unwrap()))
            .await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_refresh_ttl() {
        let (_, cache) = setup();
        cache.put("fairuz", &entry_with_id("abc123def")).await;

        // Un hit a mitad del TTL extiende la vida de la entrada
        tokio::time::advance(TTL / 2 + Duration::from_secs(1)).await;
        assert!(cache.get_by_query("fairuz").await.is_some());
        tokio::time::advance(TTL / 2 + Duration::from_secs(1)).await;
        assert!(cache.get_by_query("fairuz").await.is_some());

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(cache.get_by_query("fairuz").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_id_removes_all_aliases() {
        let (store, cache) = setup();
        let id = StableId::new("abc123def").unwrap();
        cache.put("li beirut", &entry_with_id("abc123def")).await;
        cache.put("fairuz li beirut", &entry_with_id("abc123def")).await;

        assert!(cache.invalidate_id(&id).await);
        assert_eq!(cache.get_by_query("li beirut").await, None);
        assert_eq!(cache.get_by_query("fairuz li beirut").await, None);
        assert_eq!(cache.get_by_id(&id).await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_query_keeps_id_entry() {
        let (_, cache) = setup();
        let id = StableId::new("abc123def").unwrap();
        cache.put("li beirut", &entry_with_id("abc123def")).await;

        assert!(cache.invalidate_query("LI BEIRUT").await);
        assert_eq!(cache.get_by_query("li beirut").await, None);
        assert!(cache.get_by_id(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_miss() {
        let (store, cache) = setup();
        cache.put("fairuz", &entry_with_id("abc123def")).await;

        store.set_available(false);
        assert_eq!(cache.get_by_query("fairuz").await, None);
        assert!(!cache.put("other", &entry_with_id("def456ghi")).await);
        cache.bump_usage(Some("fairuz"), None).await;

        store.set_available(true);
        assert!(cache.get_by_query("fairuz").await.is_some());
    }
}
