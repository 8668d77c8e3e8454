//! # Realtime Subscription Multiplexer
//!
//! Consolidates many logical subscriptions onto one physical realtime channel.
//!
//! ## Core Functionality:
//!
//! - **Weak registration**: [`SubscriptionMultiplexer::register`] returns a
//!   [`SubscriptionHandle`] that owns the callback. The multiplexer only keeps a
//!   weak reference, so a dropped handle stops deliveries immediately and its
//!   registration is pruned on the next pass.
//! - **Consolidated channel**: the physical channel is created lazily on the
//!   first registration and rebound (one binding per distinct table) whenever
//!   the set of tables changes.
//! - **Capacity control**: a fixed number of concurrent registrations. See
//!   [`crate::core::registry`] for the admission rules.
//! - **Lifecycle**: hidden clients drop non-critical events; a visible client
//!   with no activity for the idle window loses its physical channel until the
//!   next registration; memory pressure sheds every non-critical subscription.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configs::MultiplexerSettings;
use crate::core::dispatcher::{self, ChangeEvent, DeferredQueue, EventKind, FieldFilter};
use crate::core::memory_guard::{PressureListener, PressureSample};
use crate::core::policy::Priority;
use crate::core::registry::{EventFn, RegisterOutcome, Registration, SubscriptionRegistry};
use crate::core::upstream_manager::{ConnectionState, RealtimeBackend, UpstreamManager};
use crate::sync::mutex_lock;

const SOURCE: &str = "core::multiplexer";

/// # Subscription Config
///
/// A logical subscription: which rows of which table the caller wants, and
/// the callback to invoke for them.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Caller-chosen identifier. Registering the same id again replaces it.
    pub id: String,
    /// Table to watch.
    pub table: String,
    /// Change kind to accept; [`EventKind::Any`] accepts all.
    pub event_kind: EventKind,
    /// Optional `field=eq.value` filter.
    pub filter: Option<String>,
    /// Delivery and shedding class.
    pub priority: Priority,
    /// Callback invoked for every matching event.
    pub on_event: Arc<EventFn>,
}

impl SubscriptionConfig {
    /// A `Normal` subscription to every change on `table`.
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        on_event: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            event_kind: EventKind::Any,
            filter: None,
            priority: Priority::Normal,
            on_event: Arc::new(on_event),
        }
    }

    /// Restricts the subscription to one change kind.
    pub fn event_kind(mut self, kind: EventKind) -> Self {
        self.event_kind = kind;
        self
    }

    /// Adds a field-equality filter.
    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    /// Sets the priority class.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("event_kind", &self.event_kind)
            .field("filter", &self.filter)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Counters describing multiplexer behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Registrations admitted into a slot (fresh or by eviction).
    pub registered: u64,
    /// Same-id re-registrations.
    pub replaced: u64,
    /// Registrations refused at capacity or for a malformed filter.
    pub rejected: u64,
    /// Registrations forcibly removed to admit a critical one.
    pub evicted: u64,
    /// Registrations dropped under memory pressure.
    pub shed: u64,
    /// Registrations pruned because their handle was dropped.
    pub pruned: u64,
    /// Events accepted from the live binding.
    pub events_received: u64,
    /// Events ignored because they came from a superseded binding.
    pub stale_events: u64,
    /// Critical callbacks invoked on receipt.
    pub immediate_deliveries: u64,
    /// Normal/Low callbacks invoked by a coalesced flush.
    pub deferred_deliveries: u64,
    /// Non-critical deliveries dropped while hidden.
    pub dropped_hidden: u64,
    /// Physical channel binds, rebinds and closes.
    pub rebuilds: u64,
    /// Channels torn down after the idle window.
    pub idle_teardowns: u64,
}

/// # Event Sink
///
/// Handed to the [`RealtimeBackend`] on every (re)bind; the backend pushes
/// change events through it. Holds only a weak reference to the multiplexer.
#[derive(Clone)]
pub struct EventSink {
    inner: Weak<MuxInner>,
    generation: u64,
}

impl EventSink {
    /// Routes `event` to the matching subscribers. Silently ignored when the
    /// binding this sink belongs to has been superseded or the multiplexer is gone.
    pub fn deliver(&self, event: ChangeEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch(self.generation, event);
        }
    }

    /// Whether the multiplexer behind this sink still exists.
    pub fn is_attached(&self) -> bool {
        self.inner.strong_count() > 0
    }

    #[cfg(test)]
    pub(crate) fn detached(generation: u64) -> Self {
        Self {
            inner: Weak::new(),
            generation,
        }
    }
}

/// # Subscription Handle
///
/// Returned by [`SubscriptionMultiplexer::register`]. Owns the subscriber's
/// callback: dropping the handle stops deliveries.
#[must_use = "dropping the handle ends the subscription"]
pub struct SubscriptionHandle {
    id: String,
    serial: u64,
    outcome: RegisterOutcome,
    _callback: Option<Arc<EventFn>>,
    mux: Weak<MuxInner>,
}

impl SubscriptionHandle {
    /// The subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// How the registration was handled.
    pub fn outcome(&self) -> &RegisterOutcome {
        &self.outcome
    }

    /// Whether this registration is still live (not rejected, evicted, shed,
    /// replaced or unregistered).
    pub fn is_active(&self) -> bool {
        let Some(inner) = self.mux.upgrade() else {
            return false;
        };
        let state = mutex_lock(&inner.state, SOURCE, "is_active");
        state.registry.contains(&self.id, self.serial)
    }

    /// Removes the registration. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        match self.mux.upgrade() {
            Some(inner) => inner.remove(&self.id, Some(self.serial)),
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

struct MuxState {
    registry: SubscriptionRegistry,
    upstream: UpstreamManager,
    deferred: DeferredQueue,
    visible: bool,
    /// The channel was torn down for inactivity; only a registration reopens it.
    idle_closed: bool,
    last_activity: Instant,
    stats: MultiplexerStats,
}

struct MuxInner {
    settings: MultiplexerSettings,
    runtime: Option<Handle>,
    state: Mutex<MuxState>,
}

/// # Subscription Multiplexer
///
/// Cheap to clone; clones share the same registry and physical channel.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl SubscriptionMultiplexer {
    /// Creates a multiplexer on top of `backend`. No channel is opened until
    /// the first registration.
    ///
    /// When called inside a Tokio runtime, coalesced flushes are scheduled on
    /// that runtime even if events later arrive from a foreign thread.
    pub fn new(settings: MultiplexerSettings, backend: Arc<dyn RealtimeBackend>) -> Self {
        let upstream = UpstreamManager::new(settings.channel_name.clone(), backend);
        let registry = SubscriptionRegistry::new(settings.max_subscriptions);
        Self {
            inner: Arc::new(MuxInner {
                settings,
                runtime: Handle::try_current().ok(),
                state: Mutex::new(MuxState {
                    registry,
                    upstream,
                    deferred: DeferredQueue::default(),
                    visible: true,
                    idle_closed: false,
                    last_activity: Instant::now(),
                    stats: MultiplexerStats::default(),
                }),
            }),
        }
    }

    /// # Register
    ///
    /// Admits `config` subject to capacity and (re)binds the physical channel
    /// if needed. Never suspends. A rejected registration is a no-op: the
    /// returned handle reports [`RegisterOutcome::Rejected`] and never fires.
    pub fn register(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let mut guard = mutex_lock(&self.inner.state, SOURCE, "register");
        let state = &mut *guard;

        let filter = match config.filter.as_deref() {
            Some(expr) => match FieldFilter::parse(expr) {
                Some(filter) => Some(filter),
                None => {
                    state.stats.rejected += 1;
                    warn!(id = %config.id, filter = expr, "Rejected subscription with malformed filter");
                    return self.rejected_handle(config.id);
                }
            },
            None => None,
        };

        let pruned = state.registry.prune_dead();
        state.stats.pruned += pruned.len() as u64;

        let (outcome, serial) = state.registry.admit(Registration {
            id: config.id.clone(),
            table: config.table.clone(),
            event_kind: config.event_kind,
            filter,
            priority: config.priority,
            serial: 0,
            callback: Arc::downgrade(&config.on_event),
        });

        match &outcome {
            RegisterOutcome::Added => {
                state.stats.registered += 1;
                debug!(id = %config.id, table = %config.table, priority = %config.priority, "Subscription registered");
            }
            RegisterOutcome::Replaced => {
                state.stats.replaced += 1;
                debug!(id = %config.id, table = %config.table, "Subscription re-registered");
            }
            RegisterOutcome::Evicted { victim } => {
                state.stats.registered += 1;
                state.stats.evicted += 1;
                warn!(id = %config.id, %victim, "Subscription capacity reached; evicted lowest-priority registration");
            }
            RegisterOutcome::Rejected => {
                state.stats.rejected += 1;
                warn!(
                    id = %config.id,
                    priority = %config.priority,
                    capacity = self.inner.settings.max_subscriptions,
                    "Subscription capacity reached; registration rejected"
                );
            }
        }

        if outcome.is_admitted() {
            state.idle_closed = false;
        }
        if outcome.is_admitted() || !pruned.is_empty() {
            state.last_activity = Instant::now();
            state.deferred.retain_registered(&state.registry);
            self.inner.rebuild(state);
        }

        let admitted = outcome.is_admitted();
        SubscriptionHandle {
            id: config.id,
            serial,
            outcome,
            _callback: admitted.then_some(config.on_event),
            mux: Arc::downgrade(&self.inner),
        }
    }

    fn rejected_handle(&self, id: String) -> SubscriptionHandle {
        SubscriptionHandle {
            id,
            serial: 0,
            outcome: RegisterOutcome::Rejected,
            _callback: None,
            mux: Arc::downgrade(&self.inner),
        }
    }

    /// Removes the registration with `id`, whatever handle created it.
    pub fn unregister(&self, id: &str) -> bool {
        self.inner.remove(id, None)
    }

    /// # Set Visible
    ///
    /// Hiding drops every queued non-critical delivery; becoming visible
    /// restarts the idle window.
    pub fn set_visible(&self, visible: bool) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "set_visible");
        if state.visible == visible {
            return;
        }
        state.visible = visible;
        if visible {
            state.last_activity = Instant::now();
        } else {
            let dropped = state.deferred.discard() as u64;
            state.stats.dropped_hidden += dropped;
        }
        debug!(visible, "Multiplexer visibility changed");
    }

    /// # Check Idle
    ///
    /// Tears the physical channel down when the client is visible and nothing
    /// was registered, unregistered or dispatched for the idle window. The
    /// registry is kept; the next registration rebinds every table.
    pub fn check_idle(&self) -> bool {
        let mut guard = mutex_lock(&self.inner.state, SOURCE, "check_idle");
        let state = &mut *guard;

        let pruned = state.registry.prune_dead();
        if !pruned.is_empty() {
            state.stats.pruned += pruned.len() as u64;
            self.inner.rebuild(state);
        }

        let idle_for = Instant::now().saturating_duration_since(state.last_activity);
        if !state.visible || !state.upstream.is_open() || idle_for < self.inner.settings.idle_timeout {
            return false;
        }
        state.upstream.teardown("idle");
        state.idle_closed = true;
        state.stats.rebuilds += 1;
        state.stats.idle_teardowns += 1;
        info!(idle_secs = idle_for.as_secs(), "Realtime channel idle; torn down until next registration");
        true
    }

    /// # Apply Pressure
    ///
    /// At or above the shed threshold every non-critical subscription is
    /// dropped without notifying its holder, and the channel is rebound with
    /// the survivors. Returns how many registrations were shed.
    pub fn apply_pressure(&self, sample: &PressureSample) -> usize {
        if sample.used_ratio < self.inner.settings.shed_threshold {
            return 0;
        }
        let mut guard = mutex_lock(&self.inner.state, SOURCE, "apply_pressure");
        let state = &mut *guard;

        let shed = state.registry.shed_below(Priority::Critical);
        if shed.is_empty() {
            return 0;
        }
        state.stats.shed += shed.len() as u64;
        state.deferred.retain_registered(&state.registry);
        warn!(
            used_ratio = sample.used_ratio,
            ?shed,
            remaining = state.registry.len(),
            "Shedding non-critical subscriptions under memory pressure"
        );
        self.inner.rebuild(state);
        shed.len()
    }

    /// Current state of the physical channel.
    pub fn connection_state(&self) -> ConnectionState {
        mutex_lock(&self.inner.state, SOURCE, "connection_state")
            .upstream
            .state()
            .clone()
    }

    /// Tables bound on the physical channel right now.
    pub fn bound_tables(&self) -> Vec<String> {
        mutex_lock(&self.inner.state, SOURCE, "bound_tables")
            .upstream
            .tables()
            .to_vec()
    }

    /// Ids of the registrations currently admitted, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        mutex_lock(&self.inner.state, SOURCE, "active_ids").registry.ids()
    }

    /// Number of registrations currently admitted.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").registry.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliveries waiting for the next coalesced flush.
    pub fn pending_deliveries(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "pending_deliveries").deferred.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MultiplexerStats {
        mutex_lock(&self.inner.state, SOURCE, "stats").stats
    }

    /// Runs [`Self::check_idle`] every `period` until `shutdown` is cancelled.
    pub async fn run_idle_check(&self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check_idle();
                }
            }
        }
    }
}

impl MuxInner {
    fn rebuild(self: &Arc<Self>, state: &mut MuxState) {
        if state.idle_closed {
            return;
        }
        let weak = Arc::downgrade(self);
        let tables = state.registry.tables();
        if state
            .upstream
            .reconcile(tables, |generation| EventSink { inner: weak, generation })
        {
            state.stats.rebuilds += 1;
        }
    }

    fn remove(self: &Arc<Self>, id: &str, serial: Option<u64>) -> bool {
        let mut guard = mutex_lock(&self.state, SOURCE, "unregister");
        let state = &mut *guard;
        let serial = match serial.or_else(|| state.registry.get(id).map(|r| r.serial)) {
            Some(serial) => serial,
            None => return false,
        };
        if !state.registry.remove(id, serial) {
            return false;
        }
        debug!(id, "Subscription unregistered");
        state.last_activity = Instant::now();
        state.deferred.retain_registered(&state.registry);
        self.rebuild(state);
        true
    }

    fn dispatch(self: &Arc<Self>, generation: u64, event: ChangeEvent) {
        let event = Arc::new(event);
        let (immediate, flush_epoch) = {
            let mut guard = mutex_lock(&self.state, SOURCE, "dispatch");
            let state = &mut *guard;
            if !state.upstream.accepts(generation) {
                state.stats.stale_events += 1;
                debug!(table = %event.table, generation, "Ignoring event from superseded binding");
                return;
            }
            state.stats.events_received += 1;

            let plan = dispatcher::route(&state.registry, &event, state.visible);
            if plan.dead > 0 {
                // Bindings catch up on the next rebuild.
                state.stats.pruned += state.registry.prune_dead().len() as u64;
            }
            if !plan.immediate.is_empty() || !plan.deferred.is_empty() {
                state.last_activity = Instant::now();
            }
            state.stats.dropped_hidden += plan.dropped_hidden as u64;
            state.stats.immediate_deliveries += plan.immediate.len() as u64;
            let flush_epoch = state.deferred.push(plan.deferred);
            (plan.immediate, flush_epoch)
        };

        // Callbacks run outside the lock so they may (un)register freely.
        for callback in immediate {
            callback(&event);
        }
        if let Some(epoch) = flush_epoch {
            self.schedule_flush(epoch);
        }
    }

    fn schedule_flush(self: &Arc<Self>, epoch: u64) {
        let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            self.flush(epoch);
            return;
        };
        let weak = Arc::downgrade(self);
        let delay = self.settings.coalesce_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush(epoch);
            }
        });
    }

    fn flush(&self, epoch: u64) {
        let deliveries: Vec<(Arc<EventFn>, Arc<ChangeEvent>)> = {
            let mut guard = mutex_lock(&self.state, SOURCE, "flush");
            let state = &mut *guard;
            let batch = state.deferred.take(epoch);
            let deliveries: Vec<_> = batch
                .into_iter()
                .filter_map(|delivery| {
                    let registration = state.registry.get(&delivery.id)?;
                    if registration.serial != delivery.serial {
                        return None;
                    }
                    Some((registration.callback.upgrade()?, delivery.event))
                })
                .collect();
            state.stats.deferred_deliveries += deliveries.len() as u64;
            deliveries
        };
        for (callback, event) in deliveries {
            callback(&event);
        }
    }
}

impl PressureListener for SubscriptionMultiplexer {
    fn on_pressure(&self, sample: &PressureSample) {
        self.apply_pressure(sample);
    }

    fn on_visibility(&self, visible: bool) {
        self.set_visible(visible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream_manager::LoopbackBackend;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<String>>>;

    fn settings(max_subscriptions: usize) -> MultiplexerSettings {
        MultiplexerSettings {
            max_subscriptions,
            ..MultiplexerSettings::default()
        }
    }

    fn recorder(log: &Log, label: &str) -> impl Fn(&ChangeEvent) + Send + Sync + 'static {
        let log = Arc::clone(log);
        let label = label.to_string();
        move |event: &ChangeEvent| {
            let row = event.record.get("id").cloned().unwrap_or_default();
            log.lock().unwrap().push(format!("{label}:{row}"));
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn critical_is_immediate_and_normal_is_coalesced() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();

        let _duel = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );
        let _feed = mux.register(SubscriptionConfig::new("feed", "duels", recorder(&log, "feed")));

        backend.emit(ChangeEvent::insert("duels", json!({"id": 1})));
        backend.emit(ChangeEvent::insert("duels", json!({"id": 2})));
        assert_eq!(entries(&log), vec!["duel:1", "duel:2"]);
        assert_eq!(mux.pending_deliveries(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(entries(&log), vec!["duel:1", "duel:2", "feed:1", "feed:2"]);

        let stats = mux.stats();
        assert_eq!(stats.immediate_deliveries, 2);
        assert_eq!(stats.deferred_deliveries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_keeps_highest_priorities_on_one_channel() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();

        let low = mux.register(
            SubscriptionConfig::new("chat", "chat_messages", recorder(&log, "chat")).priority(Priority::Low),
        );
        let normal = mux.register(SubscriptionConfig::new("board", "leaderboard", recorder(&log, "board")));
        let critical = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );
        let late = mux.register(SubscriptionConfig::new("quiz", "quizzes", recorder(&log, "quiz")));

        assert_eq!(critical.outcome(), &RegisterOutcome::Evicted { victim: "chat".into() });
        assert_eq!(late.outcome(), &RegisterOutcome::Rejected);
        assert!(!low.is_active());
        assert!(normal.is_active());
        assert_eq!(mux.active_ids(), vec!["board".to_string(), "duel".to_string()]);

        assert_eq!(backend.open_channels(), 1);
        assert_eq!(
            backend.bound_tables("resman-consolidated"),
            Some(vec!["duels".to_string(), "leaderboard".to_string()])
        );
        assert!(!backend.emit(ChangeEvent::insert("chat_messages", json!({"id": 1}))));
    }

    #[tokio::test(start_paused = true)]
    async fn re_registration_is_idempotent() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();

        let first = mux.register(SubscriptionConfig::new("duel", "duels", recorder(&log, "a")));
        let second = mux.register(SubscriptionConfig::new("duel", "duels", recorder(&log, "b")));

        assert_eq!(second.outcome(), &RegisterOutcome::Replaced);
        assert_eq!(mux.len(), 1);
        assert!(!first.is_active());
        assert_eq!(backend.subscribe_calls(), 1);

        // The superseded handle cannot remove its replacement.
        assert!(!first.unregister());
        assert!(second.is_active());
        assert!(second.unregister());
        assert_eq!(mux.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_client_drops_non_critical_events() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let _duel = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );
        let _feed = mux.register(SubscriptionConfig::new("feed", "duels", recorder(&log, "feed")));

        backend.emit(ChangeEvent::insert("duels", json!({"id": 1})));
        mux.set_visible(false);
        backend.emit(ChangeEvent::insert("duels", json!({"id": 2})));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(entries(&log), vec!["duel:1", "duel:2"]);

        mux.set_visible(true);
        backend.emit(ChangeEvent::insert("duels", json!({"id": 3})));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(entries(&log), vec!["duel:1", "duel:2", "duel:3", "feed:3"]);
        // One queued delivery discarded on hide, one dropped while hidden.
        assert_eq!(mux.stats().dropped_hidden, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn routing_respects_kind_and_filter() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let _mine = mux.register(
            SubscriptionConfig::new("mine", "orders", recorder(&log, "mine"))
                .event_kind(EventKind::Insert)
                .filter("user_id=eq.7")
                .priority(Priority::Critical),
        );
        let _updates = mux.register(
            SubscriptionConfig::new("updates", "orders", recorder(&log, "upd"))
                .event_kind(EventKind::Update)
                .priority(Priority::Critical),
        );

        backend.emit(ChangeEvent::insert("orders", json!({"id": 1, "user_id": 7})));
        backend.emit(ChangeEvent::insert("orders", json!({"id": 2, "user_id": 8})));
        backend.emit(ChangeEvent::update("orders", json!({"id": 3, "user_id": 7}), None));

        assert_eq!(entries(&log), vec!["mine:1", "upd:3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_filter_is_rejected() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let handle = mux.register(SubscriptionConfig::new("bad", "orders", |_: &ChangeEvent| {}).filter("garbage"));

        assert_eq!(handle.outcome(), &RegisterOutcome::Rejected);
        assert!(mux.is_empty());
        assert_eq!(backend.subscribe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_is_torn_down_and_recreated_lazily() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let _duel = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!mux.check_idle());
        backend.emit(ChangeEvent::insert("duels", json!({"id": 1})));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!mux.check_idle());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(mux.check_idle());
        assert_eq!(mux.connection_state(), ConnectionState::Closed);
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(mux.len(), 1);

        let _feed = mux.register(SubscriptionConfig::new("feed", "leaderboard", recorder(&log, "feed")));
        assert!(mux.connection_state().is_connected());
        assert_eq!(
            backend.bound_tables("resman-consolidated"),
            Some(vec!["duels".to_string(), "leaderboard".to_string()])
        );
        assert_eq!(mux.stats().idle_teardowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_closed_channel_stays_closed_until_next_registration() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(3), backend.clone());
        let _duel = mux.register(
            SubscriptionConfig::new("duel", "duels", |_: &ChangeEvent| {}).priority(Priority::Critical),
        );
        let chat = mux.register(
            SubscriptionConfig::new("chat", "chat_messages", |_: &ChangeEvent| {}).priority(Priority::Low),
        );
        let board = mux.register(SubscriptionConfig::new("board", "leaderboard", |_: &ChangeEvent| {}));

        let binds = backend.subscribe_calls();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(mux.check_idle());

        // Pruning and shedding while idle leave the channel closed.
        drop(board);
        assert!(!mux.check_idle());
        assert_eq!(mux.apply_pressure(&PressureSample::new(0.90, true)), 1);
        assert!(!chat.is_active());
        assert_eq!(mux.connection_state(), ConnectionState::Closed);
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(backend.subscribe_calls(), binds);

        let _quiz = mux.register(
            SubscriptionConfig::new("quiz", "quizzes", |_: &ChangeEvent| {}).priority(Priority::Critical),
        );
        assert!(mux.connection_state().is_connected());
        assert_eq!(
            backend.bound_tables("resman-consolidated"),
            Some(vec!["duels".to_string(), "quizzes".to_string()])
        );
        assert_eq!(backend.subscribe_calls(), binds + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_armed_before_hiding_does_not_cut_the_next_batch_short() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let _feed = mux.register(SubscriptionConfig::new("feed", "duels", recorder(&log, "feed")));

        backend.emit(ChangeEvent::insert("duels", json!({"id": 1})));
        tokio::time::sleep(Duration::from_millis(10)).await;
        mux.set_visible(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        mux.set_visible(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.emit(ChangeEvent::insert("duels", json!({"id": 2})));

        // The timer armed for the discarded batch fires at 100 ms and finds nothing.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(entries(&log).is_empty());
        assert_eq!(mux.pending_deliveries(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entries(&log), vec!["feed:2"]);
        assert_eq!(mux.stats().deferred_deliveries, 1);
        assert_eq!(mux.stats().dropped_hidden, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_client_never_goes_idle() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let _duel = mux.register(SubscriptionConfig::new("duel", "duels", |_: &ChangeEvent| {}));

        mux.set_visible(false);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(!mux.check_idle());
        assert!(mux.connection_state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn pressure_sheds_non_critical_and_rebinds() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let duel = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );
        let chat = mux.register(
            SubscriptionConfig::new("chat", "chat_messages", recorder(&log, "chat")).priority(Priority::Low),
        );

        assert_eq!(mux.apply_pressure(&PressureSample::new(0.70, true)), 0);
        assert_eq!(mux.apply_pressure(&PressureSample::new(0.90, true)), 1);

        assert!(duel.is_active());
        assert!(!chat.is_active());
        assert_eq!(backend.bound_tables("resman-consolidated"), Some(vec!["duels".to_string()]));
        assert_eq!(mux.stats().shed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handles_stop_deliveries() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        let log: Log = Arc::default();
        let handle = mux.register(
            SubscriptionConfig::new("duel", "duels", recorder(&log, "duel")).priority(Priority::Critical),
        );
        drop(handle);

        backend.emit(ChangeEvent::insert("duels", json!({"id": 1})));
        assert!(entries(&log).is_empty());
        assert!(mux.is_empty());
        assert_eq!(mux.stats().pruned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bind_failure_is_pollable_and_retried_on_next_registration() {
        let backend = Arc::new(LoopbackBackend::new());
        let mux = SubscriptionMultiplexer::new(settings(2), backend.clone());
        backend.fail_next_subscribe();

        let _duel = mux.register(SubscriptionConfig::new("duel", "duels", |_: &ChangeEvent| {}));
        assert!(matches!(mux.connection_state(), ConnectionState::Failed(_)));

        let _board = mux.register(SubscriptionConfig::new("board", "leaderboard", |_: &ChangeEvent| {}));
        assert!(mux.connection_state().is_connected());
        assert_eq!(backend.subscribe_calls(), 2);
    }
}
