use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::{ExtractionError, Extractor};
use crate::cache::{extract_stable_id, normalize_query, CacheEntry, DirectUrlCache, LookupCache, StableId};
use crate::config::Config;
use crate::cookies::{ArtifactDirectory, CookieArtifact, CookiePool, DiscoveryError};
use crate::lock::RequestLock;
use crate::store::KvStore;
use crate::telemetry::Telemetry;

/// Terminal failures surfaced to the chat layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("empty query")]
    EmptyQuery,
    #[error(transparent)]
    NoArtifacts(#[from] DiscoveryError),
    #[error("all {attempts} cookies failed, last error: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Servido desde la caché, sin tocar el extractor
    Cached(CacheEntry),
    Fetched { entry: CacheEntry, artifact: CookieArtifact },
    /// Otro worker ya está extrayendo esta consulta
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Cached(String),
    Resolved { url: String, artifact: CookieArtifact },
    InFlight,
    /// Falló hace poco con todas las cookies; no reintentar todavía
    Hard,
}

/// Cache → lock → ranked cookie attempts, with every outcome fed back into
/// the pool and telemetry.
pub struct ResilientFetcher {
    extractor: Arc<dyn Extractor>,
    cache: LookupCache,
    direct: DirectUrlCache,
    extraction_lock: RequestLock,
    direct_lock: RequestLock,
    directory: ArtifactDirectory,
    pool: CookiePool,
    telemetry: Telemetry,
    hard_ttl: Duration,
    attempt_timeout: Duration,
}

impl ResilientFetcher {
    pub fn from_config(config: &Config, store: Arc<dyn KvStore>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            extractor,
            cache: config.lookup_cache(store.clone()),
            direct: config.direct_url_cache(store.clone()),
            extraction_lock: config.extraction_lock(store.clone()),
            direct_lock: config.direct_url_lock(store.clone()),
            directory: config.artifact_directory(),
            pool: config.cookie_pool(store.clone()),
            telemetry: config.telemetry(store),
            hard_ttl: config.hard_video_ttl(),
            attempt_timeout: config.extractor_timeout(),
        }
    }

    /// Reemplaza el pool (p. ej. con semilla fija)
    pub fn with_pool(mut self, pool: CookiePool) -> Self {
        self.pool = pool;
        self
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    pub fn direct_urls(&self) -> &DirectUrlCache {
        &self.direct
    }

    pub fn pool(&self) -> &CookiePool {
        &self.pool
    }

    pub fn directory(&self) -> &ArtifactDirectory {
        &self.directory
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Resolves a query or link to a playable entry.
    ///
    /// Cache hits never reach the extractor. On a miss only one worker per
    /// normalized query extracts; the rest get [`FetchOutcome::InFlight`].
    pub async fn fetch(&self, query: &str) -> Result<FetchOutcome, FetchError> {
        let normalized = normalize_query(query);
        let stable_id = extract_stable_id(query);
        if normalized.is_empty() && stable_id.is_none() {
            return Err(FetchError::EmptyQuery);
        }

        if let Some(hit) = self.lookup(query, stable_id.as_ref()).await {
            self.cache.bump_usage(Some(query), hit.stable_id.as_ref().or(stable_id.as_ref())).await;
            info!("🎯 Caché: '{}' → {}", normalized, hit.title);
            return Ok(FetchOutcome::Cached(hit));
        }

        if !self.extraction_lock.acquire_default(query).await {
            info!("⏳ '{}' ya se está descargando en otro worker", normalized);
            return Ok(FetchOutcome::InFlight);
        }

        let result = self.extract_with_rotation(query, stable_id).await;
        self.extraction_lock.release(query).await;
        result
    }

    async fn lookup(&self, query: &str, stable_id: Option<&StableId>) -> Option<CacheEntry> {
        if let Some(id) = stable_id {
            if let Some(hit) = self.cache.get_by_id(id).await.filter(CacheEntry::is_playable) {
                return Some(hit);
            }
        }
        self.cache.get_by_query(query).await.filter(CacheEntry::is_playable)
    }

    async fn extract_with_rotation(
        &self,
        query: &str,
        stable_id: Option<StableId>,
    ) -> Result<FetchOutcome, FetchError> {
        let candidates = self.candidates().await?;
        let target = query.trim();
        let mut last_error = String::new();

        for (attempt, artifact) in candidates.iter().enumerate() {
            debug!("🔄 Intento {}/{} con cookie {}", attempt + 1, candidates.len(), artifact);
            let started = Instant::now();
            let outcome = timeout(self.attempt_timeout, self.extractor.extract(target, artifact))
                .await
                .unwrap_or(Err(ExtractionError::TimedOut(self.attempt_timeout)));
            let latency_ms = elapsed_ms(started);

            match outcome {
                Ok(mut entry) => {
                    if entry.stable_id.is_none() {
                        entry.stable_id = stable_id;
                    }
                    self.record_attempt(artifact, Ok(()), latency_ms).await;
                    self.cache.put(query, &entry).await;
                    info!("✅ Extraído '{}' con {} en {}ms", entry.title, artifact, latency_ms);
                    return Ok(FetchOutcome::Fetched {
                        entry,
                        artifact: artifact.clone(),
                    });
                }
                Err(e) => {
                    warn!("❌ Cookie {} falló para '{}': {}", artifact, target, e);
                    self.record_attempt(artifact, Err(&e), latency_ms).await;
                    last_error = e.to_string();
                }
            }
        }

        error!("💥 Todas las cookies fallaron para '{}'", target);
        Err(FetchError::Exhausted {
            attempts: candidates.len(),
            last_error,
        })
    }

    /// Resolves the direct stream URL of a video.
    ///
    /// Ids that just failed with every cookie are reported as
    /// [`StreamOutcome::Hard`] until the marker expires.
    pub async fn stream_url(&self, stable_id: &StableId) -> Result<StreamOutcome, FetchError> {
        if self.direct.is_hard(stable_id).await {
            debug!("🧱 {} marcado como difícil, se omite", stable_id);
            return Ok(StreamOutcome::Hard);
        }

        if let Some(url) = self.direct.get(stable_id).await {
            return Ok(StreamOutcome::Cached(url));
        }

        if !self.direct_lock.acquire_default(stable_id.as_str()).await {
            return Ok(StreamOutcome::InFlight);
        }

        let result = self.resolve_with_rotation(stable_id).await;
        self.direct_lock.release(stable_id.as_str()).await;
        result
    }

    async fn resolve_with_rotation(&self, stable_id: &StableId) -> Result<StreamOutcome, FetchError> {
        let candidates = self.candidates().await?;
        let mut last_error = String::new();

        for artifact in &candidates {
            let started = Instant::now();
            let outcome = timeout(self.attempt_timeout, self.extractor.resolve_stream_url(stable_id, artifact))
                .await
                .unwrap_or(Err(ExtractionError::TimedOut(self.attempt_timeout)));
            let latency_ms = elapsed_ms(started);

            match outcome {
                Ok(url) => {
                    self.record_attempt(artifact, Ok(()), latency_ms).await;
                    self.direct.set(stable_id, &url, self.direct.default_ttl()).await;
                    debug!("🔗 URL directa de {} resuelta con {}", stable_id, artifact);
                    return Ok(StreamOutcome::Resolved {
                        url,
                        artifact: artifact.clone(),
                    });
                }
                Err(e) => {
                    warn!("❌ Cookie {} no resolvió {}: {}", artifact, stable_id, e);
                    self.record_attempt(artifact, Err(&e), latency_ms).await;
                    last_error = e.to_string();
                }
            }
        }

        self.direct.mark_hard(stable_id, self.hard_ttl).await;
        Err(FetchError::Exhausted {
            attempts: candidates.len(),
            last_error,
        })
    }

    async fn candidates(&self) -> Result<Vec<CookieArtifact>, FetchError> {
        let artifacts = self.directory.list().await?;
        Ok(self.pool.rank_candidates(&artifacts).await)
    }

    async fn record_attempt(&self, artifact: &CookieArtifact, outcome: Result<(), &ExtractionError>, latency_ms: u64) {
        match outcome {
            Ok(()) => {
                tokio::join!(
                    self.pool.report_success(artifact),
                    self.telemetry.record_success(latency_ms),
                    self.telemetry.bump_artifact_leaderboard(&artifact.name, true, latency_ms),
                );
            }
            Err(e) => {
                let error_text = e.to_string();
                tokio::join!(
                    self.pool.report_outcome(artifact, Err(&error_text)),
                    self.telemetry.record_failure(latency_ms, Some(e.kind().code())),
                    self.telemetry.bump_artifact_leaderboard(&artifact.name, false, latency_ms),
                );
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockExtractor;
    use crate::store::{KeySpace, MemoryStore};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const NETSCAPE: &str = "# Netscape HTTP Cookie File\n";

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        config: Config,
    }

    impl Harness {
        fn new(cookies: &[&str]) -> Self {
            let dir = TempDir::new().unwrap();
            for name in cookies {
                std::fs::write(dir.path().join(name), NETSCAPE).unwrap();
            }
            let config = Config {
                cookies_dir: dir.path().to_path_buf(),
                ..Config::default()
            };
            Self {
                _dir: dir,
                store: Arc::new(MemoryStore::new()),
                config,
            }
        }

        fn fetcher(&self, extractor: MockExtractor) -> ResilientFetcher {
            ResilientFetcher::from_config(&self.config, self.store.clone(), Arc::new(extractor))
                .with_pool(self.config.cookie_pool(self.store.clone()).with_seed(42))
        }
    }

    fn track(id: &str) -> CacheEntry {
        CacheEntry::new("tg-file-1", "Li Beirut")
            .with_performer("Fairuz")
            .with_stable_id(StableId::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_miss_extracts_then_hits_cache() {
        let harness = Harness::new(&["a.txt"]);
        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract()
            .withf(|target, artifact| target == "Fairuz Li Beirut" && artifact.name == "a.txt")
            .times(1)
            .returning(|_, _| Ok(track("abc123def")));
        let fetcher = harness.fetcher(extractor);

        let first = fetcher.fetch("  Fairuz Li Beirut ").await.unwrap();
        assert!(matches!(first, FetchOutcome::Fetched { ref artifact, .. } if artifact.name == "a.txt"));

        // Segunda consulta: mismo resultado sin llamar al extractor
        match fetcher.fetch("fairuz   LI BEIRUT").await.unwrap() {
            FetchOutcome::Cached(entry) => {
                assert_eq!(entry.file_ref, "tg-file-1");
                assert_eq!(entry.usage_count, 1);
            }
            other => panic!("expected cache hit, got {:?}", other),
        }
        assert_eq!(fetcher.cache().get_by_query("fairuz li beirut").await.unwrap().usage_count, 2);

        let metrics = fetcher.telemetry().snapshot().await;
        assert_eq!((metrics.total, metrics.successes), (1, 1));
    }

    #[tokio::test]
    async fn test_rotates_until_a_cookie_works() {
        let harness = Harness::new(&["a.txt", "b.txt"]);
        let keys = KeySpace::default();
        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract()
            .withf(|_, artifact| artifact.name == "a.txt")
            .times(1)
            .returning(|_, _| Err(ExtractionError::failed("Sign in to confirm you're not a bot")));
        extractor
            .expect_extract()
            .withf(|_, artifact| artifact.name == "b.txt")
            .times(1)
            .returning(|_, _| Ok(track("abc123def")));

        // a.txt primero: b.txt tiene más uso
        let fetcher = harness.fetcher(extractor);
        let b = CookieArtifact::new("b.txt", harness.config.cookies_dir.join("b.txt"));
        fetcher.pool().report_success(&b).await;
        harness
            .store
            .execute(crate::store::Batch::new().del(keys.cookie_good("b.txt")))
            .await
            .unwrap();

        let outcome = fetcher.fetch("https://youtu.be/abc123def").await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched { ref artifact, .. } if artifact.name == "b.txt"));

        let a = CookieArtifact::new("a.txt", harness.config.cookies_dir.join("a.txt"));
        let health = fetcher.pool().health_of(&a).await.unwrap();
        assert_eq!(health.failures, 1);
        assert!(health.cooling);
        assert_eq!(
            fetcher.telemetry().snapshot().await.errors.get("bot_check").copied(),
            Some(1)
        );

        let id = StableId::new("abc123def").unwrap();
        assert!(fetcher.cache().get_by_id(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error_and_releases_lock() {
        let harness = Harness::new(&["a.txt", "b.txt"]);
        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract()
            .times(2)
            .returning(|_, artifact| Err(ExtractionError::failed(format!("HTTP 429 via {}", artifact.name))));
        let fetcher = harness.fetcher(extractor);

        match fetcher.fetch("song-x").await {
            Err(FetchError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.starts_with("HTTP 429 via"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        let lock = harness.config.extraction_lock(harness.store.clone());
        assert!(lock.acquire_default("song-x").await);
    }

    #[tokio::test]
    async fn test_contended_lock_skips_extraction() {
        let harness = Harness::new(&["a.txt"]);
        let mut extractor = MockExtractor::new();
        extractor.expect_extract().never();
        let fetcher = harness.fetcher(extractor);

        let lock = harness.config.extraction_lock(harness.store.clone());
        assert!(lock.acquire_default("Song X").await);
        assert_eq!(fetcher.fetch("song   x").await.unwrap(), FetchOutcome::InFlight);
    }

    #[tokio::test]
    async fn test_empty_query_and_missing_cookies() {
        let harness = Harness::new(&[]);
        let mut extractor = MockExtractor::new();
        extractor.expect_extract().never();
        let fetcher = harness.fetcher(extractor);

        assert!(matches!(fetcher.fetch("   ").await, Err(FetchError::EmptyQuery)));
        assert!(matches!(
            fetcher.fetch("song").await,
            Err(FetchError::NoArtifacts(DiscoveryError::NoArtifacts(_)))
        ));
    }

    struct SlowExtractor;

    #[async_trait::async_trait]
    impl Extractor for SlowExtractor {
        async fn extract(&self, _target: &str, _artifact: &CookieArtifact) -> Result<CacheEntry, ExtractionError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(track("abc123def"))
        }

        async fn resolve_stream_url(
            &self,
            _stable_id: &StableId,
            _artifact: &CookieArtifact,
        ) -> Result<String, ExtractionError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok("https://rr1.example/slow".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_counts_as_failure() {
        let mut harness = Harness::new(&["a.txt"]);
        harness.config.extractor_timeout_seconds = 1;
        let fetcher = ResilientFetcher::from_config(&harness.config, harness.store.clone(), Arc::new(SlowExtractor));

        match fetcher.fetch("slow song").await {
            Err(FetchError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(
            fetcher.telemetry().snapshot().await.errors.get("timeout").copied(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_stream_url_caches_and_marks_hard() {
        let harness = Harness::new(&["a.txt"]);
        let good = StableId::new("goodvideo1").unwrap();
        let bad = StableId::new("badvideo22").unwrap();

        let mut extractor = MockExtractor::new();
        extractor
            .expect_resolve_stream_url()
            .with(eq(good.clone()), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok("https://rr1.example/videoplayback?id=1".to_string()));
        extractor
            .expect_resolve_stream_url()
            .with(eq(bad.clone()), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Err(ExtractionError::failed("Video unavailable")));
        let fetcher = harness.fetcher(extractor);

        assert!(matches!(fetcher.stream_url(&good).await.unwrap(), StreamOutcome::Resolved { .. }));
        assert_eq!(
            fetcher.stream_url(&good).await.unwrap(),
            StreamOutcome::Cached("https://rr1.example/videoplayback?id=1".to_string())
        );

        assert!(matches!(fetcher.stream_url(&bad).await, Err(FetchError::Exhausted { .. })));
        assert_eq!(fetcher.stream_url(&bad).await.unwrap(), StreamOutcome::Hard);
    }

    #[tokio::test]
    async fn test_stream_url_respects_direct_lock() {
        let harness = Harness::new(&["a.txt"]);
        let id = StableId::new("abc123def").unwrap();
        let mut extractor = MockExtractor::new();
        extractor.expect_resolve_stream_url().never();
        let fetcher = harness.fetcher(extractor);

        let lock = harness.config.direct_url_lock(harness.store.clone());
        assert!(lock.acquire_default("abc123def").await);
        assert_eq!(fetcher.stream_url(&id).await.unwrap(), StreamOutcome::InFlight);
    }
}
