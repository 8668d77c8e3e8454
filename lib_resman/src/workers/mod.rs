//! # Worker Offloading Module
//!
//! CPU-bound work that should not run on the async executor.
//!
//! ## Core Components:
//!
//! - **`kernels`**: the named, pure computations a worker can run
//!   (`xp-calculation`, `leaderboard-ranking`, `collection-transform`).
//!
//! - **`scheduler`**: the bounded thread pool with a priority queue, deadlines,
//!   crash recovery and an inline fallback path.

/// Pure task kernels addressed by name.
pub mod kernels;
/// Priority scheduling onto the worker pool.
pub mod scheduler;

// --- Public API Re-exports ---
pub use kernels::TaskKind;
pub use scheduler::{SchedulerStats, TaskRunner, WorkerScheduler};
