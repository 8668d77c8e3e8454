//! # lib_resman
//!
//! Adaptive resource management for a data-heavy client talking to a remote
//! backend. The crate bounds what the client asks for, keeps, and computes:
//!
//! - **Query cache** ([`core::query_cache`]): concurrent requests for the same
//!   key share one producer call; results are kept under per-prefix freshness
//!   policies.
//! - **Subscription multiplexer** ([`core::multiplexer`]): many logical
//!   realtime subscriptions ride one physical channel, with capacity control,
//!   priority delivery and idle teardown.
//! - **Worker scheduler** ([`workers::scheduler`]): CPU-heavy kernels run on a
//!   small prioritized thread pool with deadlines and crash recovery.
//! - **Pressure monitor** ([`core::memory_guard`]): memory and visibility
//!   samples drive graceful degradation in the cache and the multiplexer.
//!
//! [`ResourceManager`] wires all four from a single [`ResourceManagerConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// JSON5 configuration for every component.
pub mod configs;
/// Cache, multiplexer and pressure monitoring.
pub mod core;
/// The shared error type.
pub mod error;
/// `tracing` subscriber setup for binaries.
#[cfg(feature = "loggers")]
pub mod loggers;
/// The bootstrap that wires the components together.
pub mod manager;
/// Worker kernels and the scheduler.
pub mod workers;

mod sync;

// --- Public API Re-exports ---
pub use configs::{
    CacheSettings, ConfigError, MultiplexerSettings, PressureSettings, ResourceManagerConfig,
    WorkerSettings, MAX_WORKERS,
};
pub use error::{ResourceError, ResourceResult};
pub use manager::ResourceManager;
pub use workers::{SchedulerStats, TaskKind, TaskRunner, WorkerScheduler};
