//! # Memory Guard and Pressure Monitor
//!
//! Cross-cutting control component. On every tick it samples memory usage and
//! the current visibility state into a [`PressureSample`], classifies the ratio
//! into a [`PressureLevel`], and pushes the sample to every registered
//! [`PressureListener`]. The cache and the subscription multiplexer are the two
//! listeners wired by the bootstrap; they decide for themselves what to evict.
//!
//! ## Core Functionality:
//!
//! - **Probing**: memory usage comes from a [`MemoryProbe`]. When no probe is
//!   available the monitor degrades to a constant ratio of `0.0`, which keeps
//!   every component in its nominal mode.
//!
//! - **Visibility**: visibility changes are pushed to listeners immediately
//!   instead of waiting for the next tick, so hidden-tab behaviour starts at
//!   once.
//!
//! - **Explicit observers**: listeners are held in a plain registry owned by the
//!   monitor; there is no global event bus.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::mutex_lock;

const SOURCE: &str = "core::memory_guard";

/// One observation of the environment. Recomputed every tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSample {
    /// Used-to-available memory ratio, clamped to `0.0..=1.0`.
    pub used_ratio: f64,
    /// Whether the client surface is currently visible to the user.
    pub visible: bool,
    /// When the sample was taken.
    pub sampled_at: Instant,
}

impl PressureSample {
    /// Builds a sample stamped with the current instant.
    pub fn new(used_ratio: f64, visible: bool) -> Self {
        Self {
            used_ratio: used_ratio.clamp(0.0, 1.0),
            visible,
            sampled_at: Instant::now(),
        }
    }
}

/// Degradation level derived from a sample's `used_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PressureLevel {
    /// Below every threshold.
    #[default]
    Nominal,
    /// Soft mode: only critical data may be inserted.
    Soft,
    /// Non-critical state is dropped.
    Hard,
    /// Everything is dropped, critical included.
    Emergency,
}

/// Ratio thresholds separating the [`PressureLevel`]s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PressureThresholds {
    /// Soft mode starts at or above this ratio.
    pub soft: f64,
    /// Hard eviction starts at or above this ratio.
    pub hard: f64,
    /// Emergency clear starts strictly above this ratio.
    pub emergency: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            soft: 0.60,
            hard: 0.75,
            emergency: 0.85,
        }
    }
}

impl PressureThresholds {
    /// Classifies a used-memory ratio.
    pub fn level(&self, used_ratio: f64) -> PressureLevel {
        if used_ratio > self.emergency {
            PressureLevel::Emergency
        } else if used_ratio >= self.hard {
            PressureLevel::Hard
        } else if used_ratio >= self.soft {
            PressureLevel::Soft
        } else {
            PressureLevel::Nominal
        }
    }
}

/// Source of memory usage figures.
pub trait MemoryProbe: Send + Sync {
    /// Current used-to-available ratio, or `None` when the platform cannot tell.
    fn used_ratio(&self) -> Option<f64>;
}

/// Probe for environments without a memory API. Always reports "unknown".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl MemoryProbe for NoopProbe {
    fn used_ratio(&self) -> Option<f64> {
        None
    }
}

/// # Manual Probe
///
/// A probe whose ratio is set from the outside. Used by tests and demos to
/// simulate pressure. The ratio is stored as `f64` bits in an `AtomicU64` so it
/// can be updated from any thread without a lock.
#[derive(Debug, Default)]
pub struct ManualProbe {
    ratio_bits: AtomicU64,
}

impl ManualProbe {
    /// Creates a probe reporting `ratio`.
    pub fn new(ratio: f64) -> Self {
        let probe = Self::default();
        probe.set(ratio);
        probe
    }

    /// Sets the ratio reported on the next sample.
    pub fn set(&self, ratio: f64) {
        self.ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    /// Returns the ratio currently reported.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.ratio_bits.load(Ordering::Relaxed))
    }
}

impl MemoryProbe for ManualProbe {
    fn used_ratio(&self) -> Option<f64> {
        Some(self.get())
    }
}

/// # Resident-Set Probe
///
/// Reads `VmRSS` from `/proc/self/status` and divides it by a configured memory
/// budget. On platforms without procfs the read fails and the probe reports
/// "unknown", which the monitor treats as no pressure.
#[derive(Debug, Clone)]
pub struct ProcStatusProbe {
    budget_bytes: u64,
    status_path: PathBuf,
}

impl ProcStatusProbe {
    /// Creates a probe measuring against `budget_bytes`.
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            status_path: PathBuf::from("/proc/self/status"),
        }
    }
}

impl MemoryProbe for ProcStatusProbe {
    fn used_ratio(&self) -> Option<f64> {
        if self.budget_bytes == 0 {
            return None;
        }
        let status = fs::read_to_string(&self.status_path).ok()?;
        let rss = parse_vm_rss(&status)?;
        Some(rss as f64 / self.budget_bytes as f64)
    }
}

/// Extracts the resident set size, in bytes, from a procfs status document.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value: u64 = fields.next()?.parse().ok()?;
    let multiplier = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") => 1024 * 1024,
        Some(_) => return None,
    };
    Some(value * multiplier)
}

/// Receiver of pressure and visibility signals.
pub trait PressureListener: Send + Sync {
    /// Called with every fresh sample.
    fn on_pressure(&self, sample: &PressureSample);

    /// Called when visibility flips.
    fn on_visibility(&self, _visible: bool) {}
}

/// # Pressure Monitor
///
/// Samples the probe on a timer and fans the result out to its listeners.
pub struct PressureMonitor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: PressureThresholds,
    visible: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn PressureListener>>>,
    last: Mutex<Option<PressureSample>>,
}

impl PressureMonitor {
    /// Creates a monitor that starts out visible.
    pub fn new(probe: Arc<dyn MemoryProbe>, thresholds: PressureThresholds) -> Self {
        Self {
            probe,
            thresholds,
            visible: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        }
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn PressureListener>) {
        mutex_lock(&self.listeners, SOURCE, "add_listener").push(listener);
    }

    /// The configured thresholds.
    pub fn thresholds(&self) -> PressureThresholds {
        self.thresholds
    }

    /// Reads the probe without notifying anyone.
    pub fn sample(&self) -> PressureSample {
        let ratio = self.probe.used_ratio().unwrap_or(0.0);
        PressureSample::new(ratio, self.is_visible())
    }

    /// Samples the probe and pushes the sample to every listener.
    pub fn tick(&self) -> PressureSample {
        let sample = self.sample();
        self.publish(sample);
        sample
    }

    /// Pushes an externally produced sample to every listener.
    pub fn publish(&self, sample: PressureSample) {
        let level = self.thresholds.level(sample.used_ratio);
        let previous = mutex_lock(&self.last, SOURCE, "publish.last").replace(sample);
        let previous_level = previous
            .map(|p| self.thresholds.level(p.used_ratio))
            .unwrap_or_default();

        if level != previous_level {
            if level > previous_level {
                warn!(?previous_level, ?level, used_ratio = sample.used_ratio, "Memory pressure rising");
            } else {
                info!(?previous_level, ?level, used_ratio = sample.used_ratio, "Memory pressure easing");
            }
        } else {
            debug!(?level, used_ratio = sample.used_ratio, "Pressure sample");
        }

        for listener in self.listeners_snapshot() {
            listener.on_pressure(&sample);
        }
    }

    /// Level of the most recent sample, `Nominal` before the first tick.
    pub fn level(&self) -> PressureLevel {
        self.last_sample()
            .map(|sample| self.thresholds.level(sample.used_ratio))
            .unwrap_or_default()
    }

    /// The most recent sample, if any.
    pub fn last_sample(&self) -> Option<PressureSample> {
        *mutex_lock(&self.last, SOURCE, "last_sample")
    }

    /// Current visibility state.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// Records a visibility change and notifies listeners if it flipped.
    pub fn set_visible(&self, visible: bool) {
        let previous = self.visible.swap(visible, Ordering::Relaxed);
        if previous == visible {
            return;
        }
        info!(visible, "Visibility changed");
        for listener in self.listeners_snapshot() {
            listener.on_visibility(visible);
        }
    }

    /// Ticks every `period` until `shutdown` is cancelled.
    pub async fn run(&self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Pressure monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    // Listeners are invoked outside the registry lock so they may call back in.
    fn listeners_snapshot(&self) -> Vec<Arc<dyn PressureListener>> {
        mutex_lock(&self.listeners, SOURCE, "listeners_snapshot").clone()
    }
}
