//! # Core Resource Management Module
//!
//! The components that govern how the client talks to its backend. Data flows
//! one way: callers issue requests into the cache and the multiplexer, and the
//! pressure monitor feeds control signals into both.
//!
//! ## Core Components:
//!
//! - **`policy`**: the static freshness table (key prefix → ttl, priority,
//!   max entries).
//!
//! - **`query_cache`**: deduplicates concurrent fetches per key and caches the
//!   results under their freshness policy.
//!
//! - **`multiplexer`**: folds many logical realtime subscriptions onto one
//!   physical channel. Built from the `registry` (capacity and weak
//!   registration), the `dispatcher` (routing and coalesced delivery) and the
//!   `upstream_manager` (physical channel lifecycle).
//!
//! - **`memory_guard`**: samples memory usage and visibility and pushes them to
//!   registered listeners.

/// Static freshness policies.
pub mod policy;
/// Memory sampling, pressure levels and the listener registry.
pub mod memory_guard;
/// Deduplicating, policy-driven query cache.
pub mod query_cache;
/// Subscription index with capacity control.
pub mod registry;
/// Event routing, filters and coalesced delivery.
pub mod dispatcher;
/// Physical channel lifecycle and the realtime backend seam.
pub mod upstream_manager;
/// The realtime subscription multiplexer.
pub mod multiplexer;

// --- Public API Re-exports ---
pub use dispatcher::{ChangeEvent, EventKind, FieldFilter};
pub use memory_guard::{
    ManualProbe, MemoryProbe, NoopProbe, PressureLevel, PressureListener, PressureMonitor,
    PressureSample, PressureThresholds, ProcStatusProbe,
};
pub use multiplexer::{
    EventSink, MultiplexerStats, SubscriptionConfig, SubscriptionHandle, SubscriptionMultiplexer,
};
pub use policy::{builtin_policies, default_policy, PolicyConfig, PolicyTable, Priority};
pub use query_cache::{CacheStats, GetOptions, QueryCache};
pub use registry::{EventFn, RegisterOutcome};
pub use upstream_manager::{ConnectionState, LoopbackBackend, RealtimeBackend};
