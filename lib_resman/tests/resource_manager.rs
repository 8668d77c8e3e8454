//! # Resource Manager Scenarios
//!
//! End-to-end checks through the public facade: one manager, a loopback
//! realtime backend and a manual memory probe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use lib_resman::core::{
    ChangeEvent, EventKind, GetOptions, LoopbackBackend, ManualProbe, PressureLevel, Priority,
    SubscriptionConfig,
};
use lib_resman::{ResourceError, ResourceManager, ResourceManagerConfig};
use serde_json::{json, Value};

fn manager_with(probe: Arc<ManualProbe>, backend: Arc<LoopbackBackend>, pool_size: usize) -> ResourceManager {
    let mut config = ResourceManagerConfig::default();
    config.workers.pool_size = Some(pool_size);
    ResourceManager::with_probe(config, backend, probe).unwrap()
}

fn counted(
    calls: &Arc<AtomicUsize>,
    value: Value,
    delay: Duration,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        .boxed()
    }
}

fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> impl Fn(&ChangeEvent) + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |event: &ChangeEvent| {
        log.lock().unwrap().push(format!("{label}:{}", event.record["id"]));
    }
}

#[tokio::test(start_paused = true)]
async fn profile_requests_collapse_into_one_fetch() {
    let manager = manager_with(Arc::new(ManualProbe::new(0.1)), Arc::new(LoopbackBackend::new()), 0);
    let calls = Arc::new(AtomicUsize::new(0));
    let profile = json!({ "id": "u1", "displayName": "Ada" });
    let delay = Duration::from_millis(50);

    let (a, b, c) = tokio::join!(
        manager.query("user-profile:u1", counted(&calls, profile.clone(), delay), GetOptions::new()),
        manager.query("user-profile:u1", counted(&calls, profile.clone(), delay), GetOptions::new()),
        manager.query("user-profile:u1", counted(&calls, profile.clone(), delay), GetOptions::new()),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
    assert_eq!(*a, profile);

    // Within the 30 s policy the entry is served without a new fetch.
    tokio::time::advance(Duration::from_secs(10)).await;
    let again = manager
        .query("user-profile:u1", counted(&calls, json!(null), delay), GetOptions::new())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pressure_sheds_cache_and_subscriptions_in_steps() {
    let probe = Arc::new(ManualProbe::new(0.1));
    let backend = Arc::new(LoopbackBackend::new());
    let manager = manager_with(Arc::clone(&probe), Arc::clone(&backend), 0);
    let calls = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    manager
        .query("user-profile:u1", counted(&calls, json!({ "id": "u1" }), Duration::ZERO), GetOptions::new())
        .await
        .unwrap();
    manager
        .query("questions:set-1", counted(&calls, json!([1, 2, 3]), Duration::ZERO), GetOptions::new())
        .await
        .unwrap();
    let duel = manager.subscribe(
        SubscriptionConfig::new("duel-live", "duels", recorder(&log, "duel")).priority(Priority::Critical),
    );
    let chat = manager.subscribe(SubscriptionConfig::new("chat", "chat_messages", recorder(&log, "chat")));
    assert_eq!(manager.multiplexer().len(), 2);

    // Hard: non-critical cache entries and subscriptions go, critical stay.
    probe.set(0.80);
    manager.sample_pressure();
    assert_eq!(manager.cache().level(), PressureLevel::Hard);
    assert!(manager.cache().peek("user-profile:u1").is_some());
    assert!(manager.cache().peek("questions:set-1").is_none());
    assert!(duel.is_active());
    assert!(!chat.is_active());
    assert_eq!(manager.multiplexer().bound_tables(), vec!["duels".to_string()]);

    // Emergency: the cache is emptied, the critical subscription survives.
    probe.set(0.90);
    manager.sample_pressure();
    assert!(manager.cache().is_empty());
    assert!(duel.is_active());
    assert!(backend.emit(ChangeEvent::insert("duels", json!({ "id": 7 }))));
    assert_eq!(*log.lock().unwrap(), vec!["duel:7".to_string()]);

    // Back to nominal: the shed low-priority key is fetched again.
    probe.set(0.2);
    manager.sample_pressure();
    manager
        .query("questions:set-1", counted(&calls, json!([1, 2, 3]), Duration::ZERO), GetOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(manager.cache().peek("questions:set-1").is_some());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn order_inserts_reach_matching_subscribers_by_priority() {
    let backend = Arc::new(LoopbackBackend::new());
    let manager = manager_with(Arc::new(ManualProbe::new(0.1)), Arc::clone(&backend), 0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let _paid = manager.subscribe(
        SubscriptionConfig::new("paid-orders", "orders", recorder(&log, "paid"))
            .event_kind(EventKind::Insert)
            .filter("status=eq.paid"),
    );
    let _desk = manager.subscribe(
        SubscriptionConfig::new("order-desk", "orders", recorder(&log, "desk")).priority(Priority::Critical),
    );
    assert_eq!(backend.bound_tables("resman-consolidated"), Some(vec!["orders".to_string()]));

    backend.emit(ChangeEvent::insert("orders", json!({ "id": 1, "status": "paid" })));
    backend.emit(ChangeEvent::insert("orders", json!({ "id": 2, "status": "open" })));
    backend.emit(ChangeEvent::update("orders", json!({ "id": 1, "status": "paid" }), None));

    // Critical deliveries are synchronous; the filtered Normal one waits for the flush.
    assert_eq!(*log.lock().unwrap(), vec!["desk:1", "desk:2", "desk:1"]);
    assert_eq!(manager.multiplexer().pending_deliveries(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*log.lock().unwrap(), vec!["desk:1", "desk:2", "desk:1", "paid:1"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn workers_and_fallback_produce_identical_results() {
    let pooled = manager_with(Arc::new(ManualProbe::new(0.1)), Arc::new(LoopbackBackend::new()), 2);
    let inline = manager_with(Arc::new(ManualProbe::new(0.1)), Arc::new(LoopbackBackend::new()), 0);
    let board = json!({
        "entries": [
            { "userId": "kim", "score": 310 },
            { "userId": "lee", "score": 420, "achievedAt": 5 },
            { "userId": "max", "score": 310, "achievedAt": 1 },
        ],
    });

    for (kind, payload) in [
        ("leaderboard-ranking", board),
        ("xp-calculation", json!({ "totalXp": 2_500 })),
    ] {
        let a = pooled.execute(kind, payload.clone(), 1).await.unwrap();
        let b = inline.execute(kind, payload, 1).await.unwrap();
        assert_eq!(a, b, "{kind}");
    }

    assert_eq!(pooled.scheduler().stats().completed_on_workers, 2);
    assert_eq!(inline.scheduler().stats().completed_on_fallback, 2);

    let err = inline.execute("render-video", json!({}), 0).await.unwrap_err();
    assert!(matches!(err, ResourceError::UnknownTaskKind(_)));

    pooled.shutdown().await;
    inline.shutdown().await;
}
