//! Dialogue Translator - resilient subtitle translation orchestration
//!
//! This library wraps a hosted language model with a daily token reservoir,
//! a circuit breaker, classified retries and deduplicated batch translation,
//! with a CLI and an HTTP API on top.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod processors;
pub mod server;

// Re-export key types for convenience
pub use core::{
    client::{ChunkStream, GeminiBackend, TranslationBackend},
    config::OrchestratorConfig,
    errors::{ErrorKind, Result, TranslationError},
    metrics::{HealthStatus, MetricsSnapshot, Subscription},
    models::{ModelChoice, Tier, Tone, TokenReservoir, TranslationContext, TranslationResult},
    orchestrator::{BatchOutcome, BatchReport, BatchRequest, Orchestrator},
    store::{FileStore, KeyValueStore, MemoryStore},
};

pub use processors::{cleaner::SubtitleCleaner, dedup::SubtitleFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
