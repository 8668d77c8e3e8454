//! # Change Event Dispatcher
//!
//! Routes table-level change events from the physical channel to the logical
//! subscribers registered for that table.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: an incoming [`ChangeEvent`] is wrapped in an `Arc`
//!     once. Every subscriber, immediate or deferred, receives a pointer to the
//!     same event.
//!
//! 2.  **Priority-Aware Delivery**: `Critical` subscribers are invoked on
//!     receipt. `Normal`/`Low` subscribers are queued and flushed together
//!     after a short coalescing delay, so an event storm turns into one batch
//!     of callbacks instead of many.
//!
//! 3.  **Visibility Gating**: while the client is hidden, events for
//!     `Normal`/`Low` subscribers are dropped, not queued.
//!
//! 4.  **Cleanup on Send**: subscribers whose callback has been dropped are
//!     skipped during routing and pruned from the registry afterwards.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::registry::{EventFn, SubscriptionRegistry};

/// Row-level change kinds reported by the realtime backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
    /// Subscription wildcard: accepts every concrete kind.
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl EventKind {
    /// Whether a subscription for `self` accepts an event of kind `incoming`.
    pub fn accepts(self, incoming: EventKind) -> bool {
        self == EventKind::Any || self == incoming
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Any => "*",
        };
        f.write_str(label)
    }
}

/// # Change Event
///
/// One row change as delivered by the physical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Table the row belongs to.
    pub table: String,
    /// What happened to the row.
    pub kind: EventKind,
    /// Row after the change (empty object for deletes).
    pub record: Value,
    /// Row before the change, when the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// An insert of `record` into `table`.
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Insert,
            record,
            old_record: None,
        }
    }

    /// An update of a row in `table`.
    pub fn update(table: impl Into<String>, record: Value, old_record: Option<Value>) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Update,
            record,
            old_record,
        }
    }

    /// A delete of `old_record` from `table`.
    pub fn delete(table: impl Into<String>, old_record: Value) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Delete,
            record: Value::Object(Default::default()),
            old_record: Some(old_record),
        }
    }
}

/// # Field Filter
///
/// Simple field-equality matcher written as `field=eq.value` (or the shorthand
/// `field=value`). The field is looked up in the new record first, then in the
/// old record, so delete events can be filtered too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    field: String,
    value: String,
}

impl FieldFilter {
    /// Parses a filter expression. Returns `None` for malformed expressions.
    pub fn parse(expr: &str) -> Option<Self> {
        let (field, rhs) = expr.split_once('=')?;
        let field = field.trim();
        let rhs = rhs.trim();
        let value = rhs.strip_prefix("eq.").unwrap_or(rhs);
        if field.is_empty() {
            return None;
        }
        Some(Self {
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    /// The field name being compared.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Whether `event` carries the expected value for the field.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let found = event
            .record
            .get(&self.field)
            .or_else(|| event.old_record.as_ref()?.get(&self.field));
        match found {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) => self.value == "null",
            Some(Value::Bool(b)) => b.to_string() == self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            _ => false,
        }
    }
}

/// A delivery postponed to the next coalesced flush.
#[derive(Clone)]
pub(crate) struct DeferredDelivery {
    pub(crate) id: String,
    pub(crate) serial: u64,
    pub(crate) event: Arc<ChangeEvent>,
}

/// What to do with one incoming event.
#[derive(Default)]
pub(crate) struct RoutePlan {
    /// Callbacks to invoke right away, outside any lock.
    pub(crate) immediate: Vec<Arc<EventFn>>,
    pub(crate) deferred: Vec<DeferredDelivery>,
    pub(crate) dropped_hidden: usize,
    /// Matching subscribers whose callback was already gone.
    pub(crate) dead: usize,
}

/// Plans delivery of `event` to every matching registration for its table.
pub(crate) fn route(registry: &SubscriptionRegistry, event: &Arc<ChangeEvent>, visible: bool) -> RoutePlan {
    let mut plan = RoutePlan::default();
    for registration in registry.for_table(&event.table) {
        if !registration.wants(event) {
            continue;
        }
        if registration.priority.is_critical() {
            match registration.callback.upgrade() {
                Some(callback) => plan.immediate.push(callback),
                None => plan.dead += 1,
            }
        } else if !visible {
            plan.dropped_hidden += 1;
        } else if registration.is_alive() {
            plan.deferred.push(DeferredDelivery {
                id: registration.id.clone(),
                serial: registration.serial,
                event: Arc::clone(event),
            });
        } else {
            plan.dead += 1;
        }
    }
    plan
}

/// Deliveries waiting for the coalescing timer.
///
/// Every scheduled flush carries the batch epoch it was armed for. Discarding
/// the batch bumps the epoch, so a timer armed before the discard finds
/// nothing to do.
#[derive(Default)]
pub(crate) struct DeferredQueue {
    pending: Vec<DeferredDelivery>,
    flush_scheduled: bool,
    epoch: u64,
}

impl DeferredQueue {
    /// Queues deliveries. Returns the epoch to flush when the caller must
    /// schedule a flush.
    pub(crate) fn push(&mut self, deliveries: Vec<DeferredDelivery>) -> Option<u64> {
        if deliveries.is_empty() {
            return None;
        }
        self.pending.extend(deliveries);
        if self.flush_scheduled {
            return None;
        }
        self.flush_scheduled = true;
        Some(self.epoch)
    }

    /// Takes the batch armed for `epoch` and re-arms scheduling. A flush from
    /// an older epoch gets nothing.
    pub(crate) fn take(&mut self, epoch: u64) -> Vec<DeferredDelivery> {
        if epoch != self.epoch {
            return Vec::new();
        }
        self.flush_scheduled = false;
        std::mem::take(&mut self.pending)
    }

    /// Drops the current batch and orphans its pending flush. Returns how many
    /// deliveries were dropped.
    pub(crate) fn discard(&mut self) -> usize {
        self.epoch += 1;
        self.flush_scheduled = false;
        std::mem::take(&mut self.pending).len()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drops queued deliveries for subscribers that are no longer registered.
    pub(crate) fn retain_registered(&mut self, registry: &SubscriptionRegistry) {
        self.pending
            .retain(|delivery| registry.contains(&delivery.id, delivery.serial));
    }
}
