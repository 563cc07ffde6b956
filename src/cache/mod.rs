//! # Cache Module
//!
//! Shared caching for the Open Music download path.
//!
//! Extraction through yt-dlp is slow and, with cookie-authenticated sessions,
//! it is also the thing that gets us rate-limited. Everything in here exists to
//! run it less often:
//!
//! - [`normalize`]: canonical query keys and video ids pulled from links
//! - [`lookup`]: metadata cache keyed by normalized query and by video id,
//!   with a query → id alias layer and refresh-on-read TTLs
//! - [`direct_url`]: short-lived cache of resolved stream URLs plus the
//!   "hard video" marker
//!
//! ## Storage
//!
//! All state lives in the shared [`KvStore`](crate::store::KvStore), never in
//! process memory, so several bot workers share the same cache.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_TTL_SECONDS=259200     # Metadata TTL (3 days), refreshed on every hit
//! DIRECT_URL_TTL_SECONDS=300   # Stream URLs expire quickly upstream
//! HARD_VIDEO_TTL_SECONDS=900   # Skip blind retries for failing videos
//! CACHE_SCHEMA_VERSION=1       # Bump to invalidate every stored entry
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_relay::cache::{CacheEntry, LookupCache};
//! use open_music_relay::store::{KeySpace, MemoryStore};
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example() {
//! let store = Arc::new(MemoryStore::new());
//! let cache = LookupCache::new(store, KeySpace::default(), Duration::from_secs(3600));
//!
//! let entry = CacheEntry::new("telegram-file-id", "Li Beirut").with_performer("Fairuz");
//! cache.put("Fairuz Li Beirut", &entry).await;
//!
//! if let Some(hit) = cache.get_by_query("fairuz   LI BEIRUT").await {
//!     println!("Found cached track: {}", hit.title);
//! }
//! # }
//! ```

pub mod direct_url;
pub mod lookup;
pub mod normalize;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use direct_url::DirectUrlCache;
pub use lookup::LookupCache;
pub use normalize::{extract_stable_id, normalize_query, NormalizedQuery, StableId};

// Campos del hash en el almacén
const F_FILE: &str = "file_id";
const F_TITLE: &str = "title";
const F_DURATION: &str = "duration";
const F_PERFORMER: &str = "performer";
const F_VIDEO_ID: &str = "video_id";
const F_SOURCE: &str = "source";
pub(crate) const F_USAGE: &str = "usage";
pub(crate) const F_TS: &str = "ts";

const DEFAULT_SOURCE: &str = "youtube";

/// Stored extraction result.
///
/// Callers always receive copies; the store owns the canonical record.
/// Numeric fields that are missing or unparseable come back as their
/// defaults rather than failing the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Reference to the already-uploaded media (chat file id)
    pub file_ref: String,
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub performer: Option<String>,
    pub stable_id: Option<StableId>,
    /// Source service ("youtube", ...)
    pub source: String,
    pub usage_count: u64,
    /// Unix seconds of the last write or reuse
    pub last_access: i64,
}

impl CacheEntry {
    pub fn new(file_ref: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            file_ref: file_ref.into(),
            title: title.into(),
            duration_seconds: None,
            performer: None,
            stable_id: None,
            source: DEFAULT_SOURCE.to_string(),
            usage_count: 0,
            last_access: 0,
        }
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_performer(mut self, performer: impl Into<String>) -> Self {
        self.performer = Some(performer.into());
        self
    }

    pub fn with_stable_id(mut self, stable_id: StableId) -> Self {
        self.stable_id = Some(stable_id);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// A hit without a file reference cannot be replayed and should be
    /// handled like a miss.
    pub fn is_playable(&self) -> bool {
        !self.file_ref.is_empty()
    }

    /// Hash fields for a fresh write: usage starts at 1, `ts` is `now`.
    pub(crate) fn to_fields(&self, now: i64) -> Vec<(String, String)> {
        vec![
            (F_FILE.to_string(), self.file_ref.clone()),
            (F_TITLE.to_string(), self.title.clone()),
            (
                F_DURATION.to_string(),
                self.duration_seconds.map(|d| d.to_string()).unwrap_or_default(),
            ),
            (F_PERFORMER.to_string(), self.performer.clone().unwrap_or_default()),
            (
                F_VIDEO_ID.to_string(),
                self.stable_id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
            ),
            (F_SOURCE.to_string(), self.source.clone()),
            (F_USAGE.to_string(), "1".to_string()),
            (F_TS.to_string(), now.to_string()),
        ]
    }

    /// Rebuilds an entry from stored hash fields; an empty hash is a miss.
    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let non_empty = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

        Some(Self {
            file_ref: text(F_FILE),
            title: text(F_TITLE),
            duration_seconds: fields.get(F_DURATION).and_then(|v| v.parse().ok()),
            performer: non_empty(F_PERFORMER),
            stable_id: fields.get(F_VIDEO_ID).cloned().and_then(StableId::new),
            source: non_empty(F_SOURCE).unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            usage_count: fields.get(F_USAGE).and_then(|v| v.parse().ok()).unwrap_or(0),
            last_access: fields.get(F_TS).and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fields_roundtrip_keeps_metadata() {
        let entry = CacheEntry::new("file-1", "Li Beirut")
            .with_duration(272)
            .with_performer("Fairuz")
            .with_stable_id(StableId::new("abc123def").unwrap());

        let fields: HashMap<String, String> = entry.to_fields(1_700_000_000).into_iter().collect();
        let back = CacheEntry::from_fields(&fields).unwrap();

        assert_eq!(back.file_ref, "file-1");
        assert_eq!(back.duration_seconds, Some(272));
        assert_eq!(back.stable_id, entry.stable_id);
        assert_eq!(back.usage_count, 1);
        assert_eq!(back.last_access, 1_700_000_000);
    }

    #[test]
    fn test_partial_fields_fall_back_to_defaults() {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), "Only a title".to_string());
        fields.insert("duration".to_string(), "not-a-number".to_string());
        fields.insert("video_id".to_string(), "".to_string());

        let entry = CacheEntry::from_fields(&fields).unwrap();
        assert_eq!(entry.title, "Only a title");
        assert_eq!(entry.duration_seconds, None);
        assert_eq!(entry.stable_id, None);
        assert_eq!(entry.source, "youtube");
        assert!(!entry.is_playable());
    }

    #[test]
    fn test_empty_hash_is_a_miss() {
        assert_eq!(CacheEntry::from_fields(&HashMap::new()), None);
    }
}
