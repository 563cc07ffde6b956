use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use super::StableId;
use crate::store::{BestEffort, Batch, KeySpace, KvStore};

/// Short-lived cache of resolved stream URLs, keyed by video id only.
///
/// Resolved googlevideo-style URLs stop working within minutes, so this lives
/// apart from the metadata cache with a much shorter TTL and no refresh on
/// read. It also carries the "hard video" marker: ids that just failed with
/// every cookie are skipped for a while instead of being retried blindly.
#[derive(Clone)]
pub struct DirectUrlCache {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    default_ttl: Duration,
}

impl DirectUrlCache {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, default_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get(&self, stable_id: &StableId) -> Option<String> {
        let url = self
            .store
            .get(&self.keys.direct_url(stable_id.as_str()))
            .await
            .best_effort("lectura de URL directa")
            .flatten()
            .filter(|url| !url.is_empty());

        if url.is_some() {
            debug!("⚡ URL directa en caché para {}", stable_id);
        }
        url
    }

    pub async fn set(&self, stable_id: &StableId, url: &str, ttl: Duration) -> bool {
        let batch = Batch::new().set(self.keys.direct_url(stable_id.as_str()), url, Some(ttl));
        self.store.execute(batch).await.best_effort("guardado de URL directa").is_some()
    }

    /// Whether the id recently failed resolution across every cookie.
    /// An unreachable store answers `false` so callers still try.
    pub async fn is_hard(&self, stable_id: &StableId) -> bool {
        self.store
            .exists(&self.keys.hard_video(stable_id.as_str()))
            .await
            .or_fallback("lectura de marca hard", false)
    }

    pub async fn mark_hard(&self, stable_id: &StableId, ttl: Duration) -> bool {
        let batch = Batch::new().set(self.keys.hard_video(stable_id.as_str()), "1", Some(ttl));
        let marked = self.store.execute(batch).await.best_effort("marca hard").is_some();
        if marked {
            info!("🧱 Video {} marcado como difícil durante {}", stable_id, humantime::format_duration(ttl));
        }
        marked
    }
}
