//! # Telemetry
//!
//! Process-wide counters for operators: global attempt totals, latency sums,
//! failure codes, and a per-cookie leaderboard. Nothing here influences
//! routing; the cookie pool keeps its own state.
//!
//! Every write is fire-and-forget. A store outage loses data points, never
//! requests.

use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

use crate::store::{now_unix, BestEffort, Batch, KeySpace, KvStore};

const F_TOTAL: &str = "total";
const F_OK: &str = "ok";
const F_FAIL: &str = "fail";
const F_LATENCY: &str = "latency_ms_sum";
const F_LAST: &str = "last_ts";

/// Snapshot of the global counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_sum: u64,
    pub last_activity: Option<i64>,
    /// Failures per error code
    pub errors: BTreeMap<String, u64>,
}

impl GlobalMetrics {
    pub fn average_latency_ms(&self) -> Option<u64> {
        (self.total > 0).then(|| self.latency_ms_sum / self.total)
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.successes as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardRow {
    pub artifact: String,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_sum: u64,
}

#[derive(Clone)]
pub struct Telemetry {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
}

impl Telemetry {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn record_success(&self, latency_ms: u64) {
        let batch = self.global_batch(F_OK, latency_ms);
        self.store.execute(batch).await.best_effort("métrica de éxito");
    }

    pub async fn record_failure(&self, latency_ms: u64, error_code: Option<&str>) {
        let mut batch = self.global_batch(F_FAIL, latency_ms);
        if let Some(code) = error_code.map(str::trim).filter(|code| !code.is_empty()) {
            batch = batch.hincr_by(self.keys.metrics_errors(), code, 1);
        }
        self.store.execute(batch).await.best_effort("métrica de fallo");
    }

    fn global_batch(&self, outcome_field: &str, latency_ms: u64) -> Batch {
        let key = self.keys.metrics();
        Batch::new()
            .hincr_by(key.clone(), F_TOTAL, 1)
            .hincr_by(key.clone(), outcome_field, 1)
            .hincr_by(key.clone(), F_LATENCY, clamp_i64(latency_ms))
            .hset(key, vec![(F_LAST.to_string(), now_unix().to_string())])
    }

    pub async fn bump_artifact_leaderboard(&self, artifact: &str, success: bool, latency_ms: u64) {
        let outcome_key = if success {
            self.keys.leaderboard_ok()
        } else {
            self.keys.leaderboard_fail()
        };
        let batch = Batch::new()
            .zincr_by(outcome_key, artifact, 1.0)
            .zincr_by(self.keys.leaderboard_latency(), artifact, latency_ms as f64);

        if self.store.execute(batch).await.best_effort("leaderboard de cookies").is_some() {
            debug!("📊 Leaderboard: {} {} ({}ms)", artifact, if success { "ok" } else { "fail" }, latency_ms);
        }
    }

    /// Reads the global counters. An unreachable store yields zeros.
    pub async fn snapshot(&self) -> GlobalMetrics {
        let counters = self
            .store
            .hgetall(&self.keys.metrics())
            .await
            .or_fallback("lectura de métricas", Default::default());
        let errors = self
            .store
            .hgetall(&self.keys.metrics_errors())
            .await
            .or_fallback("lectura de errores", Default::default());

        let count = |field: &str| counters.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        GlobalMetrics {
            total: count(F_TOTAL),
            successes: count(F_OK),
            failures: count(F_FAIL),
            latency_ms_sum: count(F_LATENCY),
            last_activity: counters.get(F_LAST).and_then(|v| v.parse().ok()),
            errors: errors
                .into_iter()
                .filter_map(|(code, n)| n.parse().ok().map(|n| (code, n)))
                .collect(),
        }
    }

    /// Top `limit` cookies by successes. Cookies that only ever failed are
    /// listed after them, worst last.
    pub async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardRow> {
        if limit == 0 {
            return Vec::new();
        }

        let ok_key = self.keys.leaderboard_ok();
        let fail_key = self.keys.leaderboard_fail();
        let latency_key = self.keys.leaderboard_latency();
        let (ok, fail, latency) = futures::join!(
            self.store.zrevrange_withscores(&ok_key, usize::MAX),
            self.store.zrevrange_withscores(&fail_key, usize::MAX),
            self.store.zrevrange_withscores(&latency_key, usize::MAX),
        );
        let ok = ok.or_fallback("leaderboard ok", Vec::new());
        let fail: BTreeMap<String, f64> = fail.or_fallback("leaderboard fail", Vec::new()).into_iter().collect();
        let latency: BTreeMap<String, f64> = latency.or_fallback("leaderboard latencia", Vec::new()).into_iter().collect();

        let row = |artifact: &str, successes: f64| LeaderboardRow {
            artifact: artifact.to_string(),
            successes: successes.max(0.0) as u64,
            failures: fail.get(artifact).copied().unwrap_or(0.0).max(0.0) as u64,
            latency_ms_sum: latency.get(artifact).copied().unwrap_or(0.0).max(0.0) as u64,
        };

        let mut rows: Vec<LeaderboardRow> = ok.iter().map(|(artifact, score)| row(artifact, *score)).collect();

        let mut only_failed: Vec<LeaderboardRow> = fail
            .keys()
            .filter(|artifact| !ok.iter().any(|(name, _)| name == *artifact))
            .map(|artifact| row(artifact, 0.0))
            .collect();
        only_failed.sort_by(|a, b| a.failures.cmp(&b.failures).then_with(|| a.artifact.cmp(&b.artifact)));
        rows.extend(only_failed);

        rows.truncate(limit);
        rows
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MemoryStore>, Telemetry) {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Telemetry::new(store.clone(), KeySpace::default());
        (store, telemetry)
    }

    #[tokio::test]
    async fn test_global_counters_accumulate() {
        let (_, telemetry) = setup();
        telemetry.record_success(120).await;
        telemetry.record_success(80).await;
        telemetry.record_failure(300, Some("bot_check")).await;
        telemetry.record_failure(100, None).await;

        let metrics = telemetry.snapshot().await;
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.latency_ms_sum, 600);
        assert_eq!(metrics.average_latency_ms(), Some(150));
        assert_eq!(metrics.errors, BTreeMap::from([("bot_check".to_string(), 1)]));
        assert!(metrics.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let (_, telemetry) = setup();
        let metrics = telemetry.snapshot().await;
        assert_eq!(metrics, GlobalMetrics::default());
        assert_eq!(metrics.success_rate(), None);
    }

    #[tokio::test]
    async fn test_leaderboard_ranks_by_successes() {
        let (_, telemetry) = setup();
        telemetry.bump_artifact_leaderboard("a.txt", true, 100).await;
        telemetry.bump_artifact_leaderboard("b.txt", true, 50).await;
        telemetry.bump_artifact_leaderboard("b.txt", true, 70).await;
        telemetry.bump_artifact_leaderboard("b.txt", false, 900).await;
        telemetry.bump_artifact_leaderboard("c.txt", false, 10).await;

        let rows = telemetry.leaderboard(10).await;
        assert_eq!(
            rows,
            vec![
                LeaderboardRow {
                    artifact: "b.txt".into(),
                    successes: 2,
                    failures: 1,
                    latency_ms_sum: 1020,
                },
                LeaderboardRow {
                    artifact: "a.txt".into(),
                    successes: 1,
                    failures: 0,
                    latency_ms_sum: 100,
                },
                LeaderboardRow {
                    artifact: "c.txt".into(),
                    successes: 0,
                    failures: 1,
                    latency_ms_sum: 10,
                },
            ]
        );
        assert_eq!(telemetry.leaderboard(1).await.len(), 1);
        assert!(telemetry.leaderboard(0).await.is_empty());
    }

    #[tokio::test]
    async fn test_outage_is_absorbed() {
        let (store, telemetry) = setup();
        store.set_available(false);

        telemetry.record_success(10).await;
        telemetry.record_failure(10, Some("timeout")).await;
        telemetry.bump_artifact_leaderboard("a.txt", true, 10).await;

        assert_eq!(telemetry.snapshot().await, GlobalMetrics::default());
        assert!(telemetry.leaderboard(5).await.is_empty());

        store.set_available(true);
        assert_eq!(telemetry.snapshot().await.total, 0);
    }
}
