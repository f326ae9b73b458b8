#![deny(missing_docs)]
//! pelo_core: shared building blocks for the cycling data collector
//! (config, KV store, logging, job model, fetching, extraction, cleaning, recovery).

/// Configuration helpers (AppId, dirs, load_or_init, env overrides).
pub mod cfg;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Shared job model used by the scheduler, status output and tools.
pub mod job;
/// Error taxonomy shared by every stage of the pipeline.
pub mod error;
/// Rate-limited, robots-aware HTTP fetching.
pub mod fetch;
/// HTML to structured record extraction.
pub mod extract;
/// Normalization, validation and data-quality scoring.
pub mod clean;
/// Error classification, recovery strategies, circuit breakers and backups.
pub mod recovery;

pub use error::{Error, ErrorKind, Result};
