//! # Sources
//!
//! The boundary with the media extractor (yt-dlp or anything equivalent).
//!
//! This crate never builds extractor command lines. It only decides which
//! cookie to try next and what to do with the outcome; the actual download
//! lives behind the [`Extractor`] trait, implemented by the bot.

pub mod fetcher;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CacheEntry, StableId};
use crate::cookies::{CookieArtifact, FailureKind};

pub use fetcher::{FetchError, FetchOutcome, ResilientFetcher, StreamOutcome};

/// Failure of a single extractor attempt with one cookie.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// Error text as reported by the extractor (stderr, HTTP error...)
    #[error("{0}")]
    Failed(String),
    #[error("extractor attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl ExtractionError {
    pub fn failed(text: impl Into<String>) -> Self {
        ExtractionError::Failed(text.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::Failed(text) => FailureKind::classify(text),
            ExtractionError::TimedOut(_) => FailureKind::Timeout,
        }
    }
}

/// External extractor driven by the fetcher, one cookie per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extrae metadatos y sube el audio; `target` es la consulta o URL original
    async fn extract(&self, target: &str, artifact: &CookieArtifact) -> Result<CacheEntry, ExtractionError>;

    /// Resuelve la URL directa de streaming para un video
    async fn resolve_stream_url(
        &self,
        stable_id: &StableId,
        artifact: &CookieArtifact,
    ) -> Result<String, ExtractionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_error_kinds() {
        assert_eq!(
            ExtractionError::failed("Sign in to confirm you're not a bot").kind(),
            FailureKind::BotCheck
        );
        assert_eq!(ExtractionError::TimedOut(Duration::from_secs(5)).kind(), FailureKind::Timeout);
        assert_eq!(ExtractionError::failed("boom").to_string(), "boom");
    }
}
