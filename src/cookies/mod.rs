//! # Cookie Health Pool
//!
//! Rotation over the cookie files used to authenticate yt-dlp.
//!
//! Every cookie has routing state in the shared store:
//!
//! - a counters hash (`usage`, `fail`, `ts`) that survives restarts
//! - a cooldown marker, set after a failure and expiring on its own
//! - a "good" marker, set after a success for a few minutes
//!
//! [`CookiePool::rank_candidates`] turns that state into an order to try
//! cookies in. Lower score is better:
//!
//! ```text
//! score = fail × 1_000_000 + usage × 10 + jitter(0..=5)
//!       + 10¹² if cooling
//!       − 10¹² if recently good
//! ```
//!
//! Failures dominate, usage spreads load across healthy cookies and the
//! jitter keeps workers from all piling onto the same one. If the store is
//! unreachable the pool just shuffles; it is an optimization, never a hard
//! dependency of the download path.

pub mod discovery;
pub mod policy;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::store::{now_unix, BestEffort, Batch, KeySpace, KvStore, StoreError, StoreResult};

pub use discovery::{ArtifactDirectory, CookieArtifact, DiscoveryError};
pub use policy::{CooldownPolicy, FailureKind, SignatureCooldownPolicy};

const F_USAGE: &str = "usage";
const F_FAIL: &str = "fail";
const F_TS: &str = "ts";

/// Weights of the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreWeights {
    pub failure: i64,
    pub usage: i64,
    pub max_jitter: i64,
    pub cooldown_penalty: i64,
    pub good_bonus: i64,
    /// Upper bound (exclusive) of the random score given to unreadable state
    pub unreadable_spread: i64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            failure: 1_000_000,
            usage: 10,
            max_jitter: 5,
            cooldown_penalty: 1_000_000_000_000,
            good_bonus: 1_000_000_000_000,
            unreadable_spread: 1_000,
        }
    }
}

/// Routing state of one cookie as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactHealth {
    pub usage: u64,
    pub failures: u64,
    pub last_used: Option<i64>,
    pub cooling: bool,
    pub good: bool,
}

impl ArtifactHealth {
    /// Score without jitter
    pub fn base_score(&self, weights: &ScoreWeights) -> i64 {
        let failures = i64::try_from(self.failures).unwrap_or(i64::MAX);
        let usage = i64::try_from(self.usage).unwrap_or(i64::MAX);
        let counters = failures
            .saturating_mul(weights.failure)
            .saturating_add(usage.saturating_mul(weights.usage));
        let mut score = counters;
        if self.cooling {
            score = score.saturating_add(weights.cooldown_penalty);
        }
        if self.good {
            score = score.saturating_sub(weights.good_bonus);
        }
        score
    }
}

/// A cookie with the score it was ranked by.
#[derive(Debug, Clone, Serialize)]
pub struct RankedArtifact {
    pub artifact: CookieArtifact,
    pub score: i64,
    /// `None` when the state could not be read and the score is random
    pub health: Option<ArtifactHealth>,
}

/// Health-scored rotation pool over cookie files.
pub struct CookiePool {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    policy: Arc<dyn CooldownPolicy>,
    weights: ScoreWeights,
    good_ttl: Duration,
    rng: Mutex<StdRng>,
}

impl CookiePool {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            policy: Arc::new(SignatureCooldownPolicy::default()),
            weights: ScoreWeights::default(),
            good_ttl: Duration::from_secs(300),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CooldownPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_good_ttl(mut self, good_ttl: Duration) -> Self {
        self.good_ttl = good_ttl;
        self
    }

    /// Fija la semilla del jitter (tests y reproducibilidad)
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn policy(&self) -> &dyn CooldownPolicy {
        self.policy.as_ref()
    }

    /// Orders `artifacts` best first.
    pub async fn rank_candidates(&self, artifacts: &[CookieArtifact]) -> Vec<CookieArtifact> {
        self.rank_with_scores(artifacts)
            .await
            .into_iter()
            .map(|ranked| ranked.artifact)
            .collect()
    }

    /// Same ordering as [`rank_candidates`](Self::rank_candidates), keeping the
    /// score and health each cookie was ranked by. In degraded mode every
    /// entry has score 0 and no health.
    pub async fn rank_with_scores(&self, artifacts: &[CookieArtifact]) -> Vec<RankedArtifact> {
        if artifacts.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self.store.ping().await {
            warn!("⚠️ Almacén no disponible, orden aleatorio de cookies: {}", e);
            let mut shuffled = artifacts.to_vec();
            shuffled.shuffle(&mut *self.rng.lock());
            return shuffled
                .into_iter()
                .map(|artifact| RankedArtifact {
                    artifact,
                    score: 0,
                    health: None,
                })
                .collect();
        }

        let states = join_all(artifacts.iter().map(|artifact| self.read_health(artifact))).await;

        let mut rng = self.rng.lock();
        let mut ranked: Vec<RankedArtifact> = artifacts
            .iter()
            .zip(states)
            .map(|(artifact, state)| match state {
                Ok(health) => RankedArtifact {
                    artifact: artifact.clone(),
                    score: health
                        .base_score(&self.weights)
                        .saturating_add(rng.gen_range(0..=self.weights.max_jitter)),
                    health: Some(health),
                },
                Err(e) => {
                    debug!("Estado ilegible para cookie {}: {}", artifact, e);
                    RankedArtifact {
                        artifact: artifact.clone(),
                        score: rng.gen_range(0..self.weights.unreadable_spread.max(1)),
                        health: None,
                    }
                }
            })
            .collect();
        drop(rng);

        ranked.sort_by_key(|r| r.score);
        debug!(
            "🍪 Orden de cookies: {}",
            ranked
                .iter()
                .map(|r| format!("{}={}", r.artifact, r.score))
                .collect::<Vec<_>>()
                .join(", ")
        );
        ranked
    }

    /// Current score of one cookie (with jitter), `None` if unreadable.
    pub async fn score_of(&self, artifact: &CookieArtifact) -> Option<i64> {
        let health = self.read_health(artifact).await.ok()?;
        let jitter = self.rng.lock().gen_range(0..=self.weights.max_jitter);
        Some(health.base_score(&self.weights).saturating_add(jitter))
    }

    pub async fn health_of(&self, artifact: &CookieArtifact) -> Option<ArtifactHealth> {
        self.read_health(artifact).await.best_effort("lectura de salud de cookie")
    }

    async fn read_health(&self, artifact: &CookieArtifact) -> StoreResult<ArtifactHealth> {
        let name = artifact.name.as_str();
        let record_key = self.keys.cookie(name);
        let cooldown_key = self.keys.cookie_cooldown(name);
        let good_key = self.keys.cookie_good(name);

        let (record, cooldown, good) = tokio::try_join!(
            self.store.hgetall(&record_key),
            self.store.ttl(&cooldown_key),
            self.store.exists(&good_key),
        )?;

        Ok(ArtifactHealth {
            usage: parse_counter(&record, F_USAGE)?,
            failures: parse_counter(&record, F_FAIL)?,
            last_used: record.get(F_TS).and_then(|ts| ts.parse().ok()),
            cooling: cooldown.is_some_and(|remaining| !remaining.is_zero()),
            good,
        })
    }

    /// Counts a successful attempt and gives the cookie the short "good" boost.
    pub async fn report_success(&self, artifact: &CookieArtifact) {
        let name = artifact.name.as_str();
        let batch = Batch::new()
            .hincr_by(self.keys.cookie(name), F_USAGE, 1)
            .hset(self.keys.cookie(name), vec![(F_TS.to_string(), now_unix().to_string())])
            .set(self.keys.cookie_good(name), "1", Some(self.good_ttl));

        if self.store.execute(batch).await.best_effort("registro de éxito de cookie").is_some() {
            debug!("✅ Cookie {} marcada como buena", artifact);
        }
    }

    /// Counts a failed attempt and benches the cookie for `cooldown`.
    /// A failure also cancels any pending "good" boost.
    pub async fn report_failure(&self, artifact: &CookieArtifact, cooldown: Duration) {
        let name = artifact.name.as_str();
        let mut batch = Batch::new()
            .hincr_by(self.keys.cookie(name), F_FAIL, 1)
            .hset(self.keys.cookie(name), vec![(F_TS.to_string(), now_unix().to_string())])
            .del(self.keys.cookie_good(name));
        if !cooldown.is_zero() {
            batch = batch.set(self.keys.cookie_cooldown(name), "1", Some(cooldown));
        }

        if self.store.execute(batch).await.best_effort("registro de fallo de cookie").is_some() {
            info!("🧊 Cookie {} en enfriamiento durante {}", artifact, humantime::format_duration(cooldown));
        }
    }

    /// Reports an attempt outcome, picking the cooldown from the policy.
    pub async fn report_outcome(&self, artifact: &CookieArtifact, outcome: Result<(), &str>) {
        match outcome {
            Ok(()) => self.report_success(artifact).await,
            Err(error_text) => {
                let cooldown = self.policy.cooldown_for(error_text);
                self.report_failure(artifact, cooldown).await;
            }
        }
    }
}

fn parse_counter(record: &HashMap<String, String>, field: &str) -> StoreResult<u64> {
    match record.get(field) {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| StoreError::Command(format!("counter '{}' is not a number: {:?}", field, raw))),
    }
}
