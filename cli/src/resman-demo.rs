//! # Resource Manager Demo
//!
//! Drives a scripted session through a [`ResourceManager`] wired to an
//! in-process loopback backend and a manual memory probe, logging what each
//! component does along the way.
//!
//! ## Scenario Phases:
//!
//! 1. Three concurrent profile fetches collapse into one producer call.
//! 2. A critical and a normal subscription share one physical channel.
//! 3. XP and leaderboard kernels run on the worker pool.
//! 4. Memory pressure is raised to the configured peak and then released.
//! 5. The client is hidden and shown again.
//!
//! Settings come from (lowest to highest precedence) built-in defaults, the
//! optional JSON5 file, environment variables and command-line flags.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lib_resman::core::{
    ChangeEvent, GetOptions, LoopbackBackend, ManualProbe, Priority, SubscriptionConfig,
};
use lib_resman::loggers::init_tracing;
use lib_resman::{ResourceManager, ResourceManagerConfig};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Scripted walkthrough of the adaptive resource manager", version)]
pub struct Config {
    #[clap(long, env = "RESMAN_CONFIG_PATH", help = "Path to the JSON5 resource manager configuration.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RESMAN_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RESMAN_LOG_JSON", help = "Emit logs as JSON lines (true/false).")]
    pub log_json: Option<bool>,

    #[clap(long, env = "RESMAN_MAX_SUBSCRIPTIONS", help = "Override the subscription capacity.")]
    pub max_subscriptions: Option<usize>,

    #[clap(long, env = "RESMAN_POOL_SIZE", help = "Override the worker pool size (0 disables the pool).")]
    pub pool_size: Option<usize>,

    #[clap(long, env = "RESMAN_PEAK_PRESSURE", help = "Memory ratio simulated during the pressure phase.")]
    pub peak_pressure: Option<f64>,

    #[clap(long, env = "RESMAN_PRODUCER_DELAY_MS", help = "Latency of the simulated backend fetch, in milliseconds.")]
    pub producer_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            max_subscriptions: other.max_subscriptions.or(self.max_subscriptions),
            pool_size: other.pool_size.or(self.pool_size),
            peak_pressure: other.peak_pressure.or(self.peak_pressure),
            producer_delay_ms: other.producer_delay_ms.or(self.producer_delay_ms),
        }
    }

    /// Applies the flag overrides on top of the file configuration.
    fn apply(&self, config: &mut ResourceManagerConfig) {
        if let Some(max) = self.max_subscriptions {
            config.multiplexer.max_subscriptions = max;
        }
        if let Some(size) = self.pool_size {
            config.workers.pool_size = Some(size);
        }
    }
}

fn load_config() -> Config {
    let defaults = Config {
        log_level: Some("info".to_string()),
        log_json: Some(false),
        peak_pressure: Some(0.90),
        producer_delay_ms: Some(50),
        ..Default::default()
    };
    defaults.merge(Config::parse())
}

fn load_manager_config(cli: &Config) -> anyhow::Result<ResourceManagerConfig> {
    let mut config = match &cli.config_path {
        Some(path) => ResourceManagerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ResourceManagerConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Phase 1: Configuration & Logging ---
    let cli = load_config();
    init_tracing(
        cli.log_level.as_deref().unwrap_or("info"),
        cli.log_json.unwrap_or(false),
    )?;
    let config = load_manager_config(&cli)?;
    let delay = Duration::from_millis(cli.producer_delay_ms.unwrap_or(50));

    // --- Phase 2: Core Infrastructure ---
    let backend = Arc::new(LoopbackBackend::new());
    let probe = Arc::new(ManualProbe::new(0.10));
    let manager = ResourceManager::with_probe(config, backend.clone(), probe.clone())?;
    manager.start();

    // --- Phase 3: Deduplicated Fetches ---
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = move |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(json!({ "id": "u1", "displayName": "Ada", "xp": 2_500 }))
        }
    };
    let (a, b, c) = tokio::join!(
        manager.query("user-profile:u1", fetch(calls.clone()), GetOptions::new()),
        manager.query("user-profile:u1", fetch(calls.clone()), GetOptions::new()),
        manager.query("user-profile:u1", fetch(calls.clone()), GetOptions::new()),
    );
    let profile = a?;
    info!(
        producer_calls = calls.load(Ordering::SeqCst),
        shared = Arc::ptr_eq(&profile, &b?) && Arc::ptr_eq(&profile, &c?),
        "Profile fetched"
    );

    // --- Phase 4: Realtime Subscriptions ---
    let duel = manager.subscribe(
        SubscriptionConfig::new("duel-live", "duels", |event: &ChangeEvent| {
            info!(table = %event.table, kind = %event.kind, record = %event.record, "Duel update (immediate)");
        })
        .priority(Priority::Critical),
    );
    let chat = manager.subscribe(SubscriptionConfig::new("lobby-chat", "chat_messages", |event: &ChangeEvent| {
        info!(table = %event.table, record = %event.record, "Chat message (coalesced)");
    }));
    info!(
        duel = ?duel.outcome(),
        chat = ?chat.outcome(),
        tables = ?manager.multiplexer().bound_tables(),
        "Subscriptions registered"
    );
    backend.emit(ChangeEvent::update("duels", json!({ "id": 9, "round": 2 }), None));
    backend.emit(ChangeEvent::insert("chat_messages", json!({ "id": 41, "text": "gg" })));
    tokio::time::sleep(manager.config().multiplexer.coalesce_delay * 2).await;

    // --- Phase 5: Worker Offloading ---
    let xp = manager
        .execute("xp-calculation", json!({ "totalXp": profile["xp"] }), 1)
        .await?;
    info!(level = %xp["level"], progress = %xp["progress"], "XP computed");
    let board = manager
        .execute(
            "leaderboard-ranking",
            json!({
                "entries": [
                    { "userId": "u1", "score": 2_500 },
                    { "userId": "u2", "score": 3_100 },
                    { "userId": "u3", "score": 2_500, "achievedAt": 1 },
                ],
                "limit": 3,
            }),
            0,
        )
        .await?;
    info!(ranking = %board["entries"], "Leaderboard ranked");

    // --- Phase 6: Memory Pressure ---
    let peak = cli.peak_pressure.unwrap_or(0.90);
    probe.set(peak);
    let sample = manager.sample_pressure();
    warn!(
        used_ratio = sample.used_ratio,
        level = ?manager.monitor().level(),
        cached_entries = manager.cache().len(),
        duel_active = duel.is_active(),
        chat_active = chat.is_active(),
        "Pressure peak applied"
    );
    probe.set(0.10);
    manager.sample_pressure();

    // --- Phase 7: Visibility ---
    manager.set_visible(false);
    backend.emit(ChangeEvent::insert("chat_messages", json!({ "id": 42, "text": "anyone?" })));
    manager.set_visible(true);

    // --- Phase 8: Report & Shutdown ---
    info!(stats = ?manager.cache().stats(), "Cache stats");
    info!(stats = ?manager.multiplexer().stats(), "Multiplexer stats");
    info!(stats = ?manager.scheduler().stats(), "Scheduler stats");
    drop(duel);
    drop(chat);
    manager.shutdown().await;
    Ok(())
}
