//! # Open Music Relay
//!
//! Resilience layer between "a user asked for a track" and "yt-dlp runs".
//!
//! - [`cache`]: normalized lookup cache and the short-lived direct URL cache
//! - [`lock`]: lease locks so only one worker extracts a given request
//! - [`cookies`]: health-scored rotation over cookie files
//! - [`telemetry`]: global counters and the per-cookie leaderboard
//! - [`sources`]: the extractor seam and the fetch orchestration
//!
//! All shared state lives in a [`store::KvStore`] (Redis in production),
//! so any number of bot workers cooperate through it.

pub mod cache;
pub mod config;
pub mod cookies;
pub mod lock;
pub mod sources;
pub mod store;
pub mod telemetry;

pub use config::Config;
