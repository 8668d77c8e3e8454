//! # Upstream Channel Manager
//!
//! Owns the lifecycle of the single consolidated realtime channel. The
//! multiplexer tells it which tables must be bound; it decides whether the
//! physical channel needs to be opened, rebound or torn down, and tracks the
//! resulting [`ConnectionState`].
//!
//! Every (re)bind gets a fresh generation number. The [`EventSink`] handed to
//! the backend carries that generation, so events arriving on a superseded
//! binding are ignored instead of being routed against the new index.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::core::dispatcher::ChangeEvent;
use crate::core::multiplexer::EventSink;
use crate::error::ResourceError;
use crate::sync::mutex_lock;

const SOURCE: &str = "core::upstream_manager";

/// Connection state of the physical channel, pollable by callers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No physical channel exists (never opened, idle teardown, or no tables).
    #[default]
    Closed,
    /// The channel is bound and receiving events.
    Connected,
    /// The last open or rebind attempt failed. Retried on the next registration.
    Failed(String),
}

impl ConnectionState {
    /// Returns `true` for [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// # Realtime Backend
///
/// The collaborator's pub/sub client. One call to [`RealtimeBackend::subscribe`]
/// (re)binds the named channel to exactly `tables`, replacing any previous
/// binding for that channel.
///
/// Implementations must not call back into the sink from inside `subscribe`
/// or `unsubscribe`; events are delivered later from the backend's own context.
pub trait RealtimeBackend: Send + Sync {
    /// Opens or rebinds `channel` with one binding per table.
    fn subscribe(&self, channel: &str, tables: &[String], sink: EventSink) -> Result<(), ResourceError>;

    /// Closes `channel`. Closing an unknown channel is a no-op.
    fn unsubscribe(&self, channel: &str);
}

/// Physical channel bookkeeping. Lives inside the multiplexer's state lock.
pub(crate) struct UpstreamManager {
    name: String,
    backend: Arc<dyn RealtimeBackend>,
    generation: u64,
    tables: Vec<String>,
    state: ConnectionState,
}

impl UpstreamManager {
    pub(crate) fn new(name: impl Into<String>, backend: Arc<dyn RealtimeBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            generation: 0,
            tables: Vec::new(),
            state: ConnectionState::Closed,
        }
    }

    /// Brings the channel in line with `tables`. Returns `true` when the
    /// backend was actually (re)bound or closed.
    pub(crate) fn reconcile(&mut self, tables: Vec<String>, sink_for: impl FnOnce(u64) -> EventSink) -> bool {
        if tables.is_empty() {
            return self.teardown("no active subscriptions");
        }
        if self.state.is_connected() && self.tables == tables {
            return false;
        }

        self.generation += 1;
        let sink = sink_for(self.generation);
        let next = match self.backend.subscribe(&self.name, &tables, sink) {
            Ok(()) => ConnectionState::Connected,
            Err(err) => {
                warn!(channel = %self.name, error = %err, "Failed to bind realtime channel");
                ConnectionState::Failed(err.to_string())
            }
        };
        if next.is_connected() {
            info!(channel = %self.name, generation = self.generation, ?tables, "Realtime channel bound");
            self.tables = tables;
        } else {
            self.tables.clear();
        }
        self.transition(next);
        true
    }

    /// Closes the physical channel, if any. Returns `true` if one was open.
    pub(crate) fn teardown(&mut self, reason: &str) -> bool {
        if matches!(self.state, ConnectionState::Closed) {
            return false;
        }
        if self.state.is_connected() {
            self.backend.unsubscribe(&self.name);
        }
        // Invalidate the sink held by the backend.
        self.generation += 1;
        self.tables.clear();
        debug!(channel = %self.name, reason, "Tearing down realtime channel");
        self.transition(ConnectionState::Closed);
        true
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(channel = %self.name, from = %self.state, to = %next, "Realtime channel state change");
            self.state = next;
        }
    }

    /// Whether events stamped with `generation` belong to the live binding.
    pub(crate) fn accepts(&self, generation: u64) -> bool {
        self.state.is_connected() && self.generation == generation
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.is_connected()
    }

    pub(crate) fn tables(&self) -> &[String] {
        &self.tables
    }
}

/// # Loopback Backend
///
/// In-memory [`RealtimeBackend`] used by the demo binary and tests. Events
/// pushed through [`LoopbackBackend::emit`] are delivered to whichever channel
/// currently binds the event's table.
#[derive(Default)]
pub struct LoopbackBackend {
    channels: Mutex<HashMap<String, (Vec<String>, EventSink)>>,
    fail_next: AtomicBool,
    subscribe_calls: AtomicU64,
}

impl LoopbackBackend {
    /// A backend with no open channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `subscribe` call fail with a channel error.
    pub fn fail_next_subscribe(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delivers `event` to the channel bound to its table. Returns `false` if
    /// no open channel binds that table.
    pub fn emit(&self, event: ChangeEvent) -> bool {
        // Clone the sink so the backend lock is released before delivery.
        let sink = {
            let channels = mutex_lock(&self.channels, SOURCE, "emit");
            channels
                .values()
                .find(|(tables, _)| tables.iter().any(|table| *table == event.table))
                .map(|(_, sink)| sink.clone())
        };
        match sink {
            Some(sink) => {
                sink.deliver(event);
                true
            }
            None => false,
        }
    }

    /// Number of physical channels currently open.
    pub fn open_channels(&self) -> usize {
        mutex_lock(&self.channels, SOURCE, "open_channels").len()
    }

    /// Tables bound on `channel`, if it is open.
    pub fn bound_tables(&self, channel: &str) -> Option<Vec<String>> {
        mutex_lock(&self.channels, SOURCE, "bound_tables")
            .get(channel)
            .map(|(tables, _)| tables.clone())
    }

    /// How many times `subscribe` has been called.
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl RealtimeBackend for LoopbackBackend {
    fn subscribe(&self, channel: &str, tables: &[String], sink: EventSink) -> Result<(), ResourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            mutex_lock(&self.channels, SOURCE, "subscribe").remove(channel);
            return Err(ResourceError::Channel(format!("loopback refused '{channel}'")));
        }
        mutex_lock(&self.channels, SOURCE, "subscribe")
            .insert(channel.to_string(), (tables.to_vec(), sink));
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) {
        mutex_lock(&self.channels, SOURCE, "unsubscribe").remove(channel);
    }
}
