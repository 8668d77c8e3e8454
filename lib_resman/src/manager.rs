//! # Resource Manager
//!
//! Bootstrap that builds the four components from one configuration and wires
//! the pressure monitor to its two listeners.
//!
//! ## Core Functionality:
//!
//! - **Wiring**: the query cache and the subscription multiplexer are
//!   registered as pressure listeners, in that order.
//! - **Background loops**: [`ResourceManager::start`] spawns the pressure
//!   sampler, the cache sweeper and the idle-channel check. All three stop
//!   when the manager's cancellation token fires.
//! - **Facade**: `query`, `subscribe` and `execute` forward to the owning
//!   component so domain code only needs one handle.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::configs::{ConfigError, ResourceManagerConfig};
use crate::core::{
    GetOptions, MemoryProbe, NoopProbe, PressureMonitor, PressureSample, ProcStatusProbe,
    QueryCache, RealtimeBackend, SubscriptionConfig, SubscriptionHandle, SubscriptionMultiplexer,
};
use crate::error::ResourceResult;
use crate::sync::mutex_lock;
use crate::workers::WorkerScheduler;

const SOURCE: &str = "manager";

const IDLE_CHECK_CEILING: Duration = Duration::from_secs(30);
const IDLE_CHECK_FLOOR: Duration = Duration::from_millis(100);

/// # Resource Manager
///
/// Owns one instance of every component. Cheap to share behind an `Arc`.
pub struct ResourceManager {
    config: ResourceManagerConfig,
    cache: QueryCache<Value>,
    multiplexer: SubscriptionMultiplexer,
    scheduler: WorkerScheduler,
    monitor: Arc<PressureMonitor>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceManager {
    /// Builds the manager with the probe implied by the configuration:
    /// a resident-set probe when a memory budget is set, a no-op probe
    /// otherwise.
    pub fn new(
        config: ResourceManagerConfig,
        backend: Arc<dyn RealtimeBackend>,
    ) -> Result<Self, ConfigError> {
        let probe: Arc<dyn MemoryProbe> = match config.pressure.memory_budget_mb {
            Some(mb) => Arc::new(ProcStatusProbe::new(mb.saturating_mul(1024 * 1024))),
            None => Arc::new(NoopProbe),
        };
        Self::with_probe(config, backend, probe)
    }

    /// Builds the manager around an explicit memory probe.
    pub fn with_probe(
        config: ResourceManagerConfig,
        backend: Arc<dyn RealtimeBackend>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // --- Components ---
        let thresholds = config.pressure.thresholds;
        let cache = QueryCache::new(Arc::new(config.policy_table()), config.cache.clone(), thresholds);
        let multiplexer = SubscriptionMultiplexer::new(config.multiplexer.clone(), backend);
        let scheduler = WorkerScheduler::new(config.workers.clone());
        let monitor = Arc::new(PressureMonitor::new(probe, thresholds));

        // --- Listener wiring ---
        monitor.add_listener(Arc::new(cache.clone()));
        monitor.add_listener(Arc::new(multiplexer.clone()));

        info!(
            policies = config.policies.len(),
            max_subscriptions = config.multiplexer.max_subscriptions,
            pool_size = scheduler.pool_size(),
            "Resource manager assembled"
        );

        Ok(Self {
            config,
            cache,
            multiplexer,
            scheduler,
            monitor,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the background loops on the current Tokio runtime. Calling it
    /// again while the loops are running is a no-op.
    pub fn start(&self) {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "start");
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        let monitor = Arc::clone(&self.monitor);
        let token = self.shutdown.clone();
        let period = self.config.pressure.sample_interval;
        tasks.push(tokio::spawn(async move { monitor.run(period, token).await }));

        let cache = self.cache.clone();
        let token = self.shutdown.clone();
        let period = self.config.cache.sweep_interval;
        tasks.push(tokio::spawn(async move { cache.run_sweeper(period, token).await }));

        let multiplexer = self.multiplexer.clone();
        let token = self.shutdown.clone();
        let period = idle_check_period(self.config.multiplexer.idle_timeout);
        tasks.push(tokio::spawn(async move { multiplexer.run_idle_check(period, token).await }));

        info!(background_tasks = tasks.len(), "Resource manager started");
    }

    /// Stops the background loops and the worker pool. In-flight producers
    /// and subscriptions are left to settle on their own.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
        let tasks: Vec<_> = mutex_lock(&self.tasks, SOURCE, "shutdown").drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Resource manager stopped");
    }

    /// Deduplicated, cached fetch. See [`QueryCache::get`].
    pub async fn query<F, Fut>(&self, key: &str, producer: F, options: GetOptions) -> ResourceResult<Arc<Value>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.cache.get(key, producer, options).await
    }

    /// Registers a realtime subscription. See [`SubscriptionMultiplexer::register`].
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.multiplexer.register(config)
    }

    /// Runs a worker task. See [`WorkerScheduler::execute`].
    pub async fn execute(&self, kind: &str, payload: Value, priority: i32) -> ResourceResult<Value> {
        self.scheduler.execute(kind, payload, priority).await
    }

    /// Forwards a visibility change to every listener.
    pub fn set_visible(&self, visible: bool) {
        self.monitor.set_visible(visible);
    }

    /// Takes a pressure sample immediately instead of waiting for the timer.
    pub fn sample_pressure(&self) -> PressureSample {
        self.monitor.tick()
    }

    /// The configuration the manager was built from.
    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// The query cache.
    pub fn cache(&self) -> &QueryCache<Value> {
        &self.cache
    }

    /// The subscription multiplexer.
    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.multiplexer
    }

    /// The worker scheduler.
    pub fn scheduler(&self) -> &WorkerScheduler {
        &self.scheduler
    }

    /// The pressure monitor.
    pub fn monitor(&self) -> &Arc<PressureMonitor> {
        &self.monitor
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
    }
}

fn idle_check_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 10).clamp(IDLE_CHECK_FLOOR, IDLE_CHECK_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LoopbackBackend, ManualProbe, PressureLevel};

    #[test]
    fn idle_check_period_is_bounded() {
        assert_eq!(idle_check_period(Duration::from_secs(300)), IDLE_CHECK_CEILING);
        assert_eq!(idle_check_period(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(idle_check_period(Duration::from_millis(50)), IDLE_CHECK_FLOOR);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = ResourceManagerConfig::default();
        config.cache.max_pending = 0;
        let result = ResourceManager::new(config, Arc::new(LoopbackBackend::new()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn sampling_reaches_both_listeners() {
        let probe = Arc::new(ManualProbe::new(0.80));
        let manager = ResourceManager::with_probe(
            ResourceManagerConfig::default(),
            Arc::new(LoopbackBackend::new()),
            probe.clone(),
        )
        .unwrap();

        let sample = manager.sample_pressure();
        assert_eq!(sample.used_ratio, 0.80);
        assert_eq!(manager.monitor().level(), PressureLevel::Hard);
        assert_eq!(manager.cache().level(), PressureLevel::Hard);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let manager =
            ResourceManager::new(ResourceManagerConfig::default(), Arc::new(LoopbackBackend::new())).unwrap();
        manager.start();
        manager.start();
        manager.shutdown().await;
        manager.shutdown().await;
        manager.start();
    }
}
