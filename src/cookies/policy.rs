//! Failure-signature heuristics.
//!
//! Upstream error wording changes without notice, so everything here is a
//! replaceable policy: the pool only asks a [`CooldownPolicy`] how long to
//! bench a cookie, and telemetry only asks [`FailureKind`] for a short code.

use std::time::Duration;

/// Frases con las que YouTube pide verificación humana
const CHALLENGE_SIGNATURES: &[&str] = &["sign in to confirm", "not a bot", "not a robot"];
const RATE_LIMIT_SIGNATURES: &[&str] = &["429", "too many requests", "rate limit"];
const UNAVAILABLE_SIGNATURES: &[&str] = &["video unavailable", "private video", "has been removed"];
const TIMEOUT_SIGNATURES: &[&str] = &["timed out", "timeout"];

/// Decides how long a cookie stays benched after a failed attempt.
pub trait CooldownPolicy: Send + Sync {
    fn cooldown_for(&self, error_text: &str) -> Duration;
}

/// Substring-matching policy: bot challenges get the long cooldown,
/// everything else the default one.
#[derive(Debug, Clone)]
pub struct SignatureCooldownPolicy {
    pub default_cooldown: Duration,
    pub challenge_cooldown: Duration,
}

impl SignatureCooldownPolicy {
    pub fn new(default_cooldown: Duration, challenge_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            challenge_cooldown,
        }
    }
}

impl Default for SignatureCooldownPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800), Duration::from_secs(7200))
    }
}

impl CooldownPolicy for SignatureCooldownPolicy {
    fn cooldown_for(&self, error_text: &str) -> Duration {
        match FailureKind::classify(error_text) {
            FailureKind::BotCheck => self.challenge_cooldown,
            _ => self.default_cooldown,
        }
    }
}

/// Coarse failure category used as the telemetry error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    BotCheck,
    RateLimited,
    Unavailable,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn classify(error_text: &str) -> Self {
        let lowered = error_text.to_lowercase();
        let matches_any = |signatures: &[&str]| signatures.iter().any(|s| lowered.contains(s));

        if matches_any(CHALLENGE_SIGNATURES) {
            FailureKind::BotCheck
        } else if matches_any(RATE_LIMIT_SIGNATURES) {
            FailureKind::RateLimited
        } else if matches_any(UNAVAILABLE_SIGNATURES) {
            FailureKind::Unavailable
        } else if matches_any(TIMEOUT_SIGNATURES) {
            FailureKind::Timeout
        } else {
            FailureKind::Other
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::BotCheck => "bot_check",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }
}
