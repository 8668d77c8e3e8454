//! # Subscription Registry
//!
//! Bookkeeping behind the realtime multiplexer: a table → subscriptions index
//! with a fixed admission capacity. Registrations are keyed by id and hold only
//! a [`Weak`] reference to the subscriber's callback. The strong reference
//! lives in the caller's [`crate::core::SubscriptionHandle`], so a subscriber
//! that disappears without unregistering is pruned on the next pass.
//!
//! ## Admission rules
//!
//! - Re-registering an existing id replaces it in place (idempotent).
//! - Below capacity, every registration is admitted.
//! - At capacity, a `Critical` registration evicts the lowest-priority entry
//!   (oldest first among equals); anything else is rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use crate::core::dispatcher::{ChangeEvent, EventKind, FieldFilter};
use crate::core::policy::Priority;

/// Callback signature stored (weakly) for every subscription.
pub type EventFn = dyn Fn(&ChangeEvent) + Send + Sync;

/// Result of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Admitted into a free slot.
    Added,
    /// An existing registration with the same id was replaced.
    Replaced,
    /// Admitted by forcibly unregistering `victim`.
    Evicted {
        /// Id of the registration that made room.
        victim: String,
    },
    /// Refused at capacity; the subscriber will not receive events.
    Rejected,
}

impl RegisterOutcome {
    /// Returns `true` unless the registration was rejected.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, RegisterOutcome::Rejected)
    }
}

/// One admitted subscription.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) id: String,
    pub(crate) table: String,
    pub(crate) event_kind: EventKind,
    pub(crate) filter: Option<FieldFilter>,
    pub(crate) priority: Priority,
    /// Monotonic admission order; also disambiguates replaced registrations.
    pub(crate) serial: u64,
    pub(crate) callback: Weak<EventFn>,
}

impl Registration {
    pub(crate) fn is_alive(&self) -> bool {
        self.callback.strong_count() > 0
    }

    /// Kind and filter both match `event`.
    pub(crate) fn wants(&self, event: &ChangeEvent) -> bool {
        self.event_kind.accepts(event.kind)
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(event))
    }
}

pub(crate) struct SubscriptionRegistry {
    capacity: usize,
    entries: HashMap<String, Registration>,
    by_table: BTreeMap<String, Vec<String>>,
    next_serial: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            by_table: BTreeMap::new(),
            next_serial: 0,
        }
    }

    /// Admits `registration` (its `serial` is overwritten). Returns the
    /// outcome and the serial assigned, which is `0` for rejections.
    pub(crate) fn admit(&mut self, mut registration: Registration) -> (RegisterOutcome, u64) {
        self.next_serial += 1;
        registration.serial = self.next_serial;
        let serial = registration.serial;

        if self.entries.contains_key(&registration.id) {
            self.detach(&registration.id);
            self.attach(registration);
            return (RegisterOutcome::Replaced, serial);
        }

        if self.entries.len() < self.capacity {
            self.attach(registration);
            return (RegisterOutcome::Added, serial);
        }

        if !registration.priority.is_critical() {
            return (RegisterOutcome::Rejected, 0);
        }

        let victim = self
            .entries
            .values()
            .min_by_key(|existing| (existing.priority, existing.serial))
            .map(|existing| existing.id.clone());
        match victim {
            Some(victim) => {
                self.detach(&victim);
                self.attach(registration);
                (RegisterOutcome::Evicted { victim }, serial)
            }
            // Zero capacity: nothing to evict.
            None => (RegisterOutcome::Rejected, 0),
        }
    }

    /// Removes `id` if it is still the registration with `serial`.
    pub(crate) fn remove(&mut self, id: &str, serial: u64) -> bool {
        if self.contains(id, serial) {
            self.detach(id);
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, id: &str, serial: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|registration| registration.serial == serial)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Registration> {
        self.entries.get(id)
    }

    /// Drops registrations whose subscriber has gone away.
    pub(crate) fn prune_dead(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .entries
            .values()
            .filter(|registration| !registration.is_alive())
            .map(|registration| registration.id.clone())
            .collect();
        for id in &dead {
            self.detach(id);
        }
        dead
    }

    /// Drops every registration below `floor`. Returns the removed ids.
    pub(crate) fn shed_below(&mut self, floor: Priority) -> Vec<String> {
        let shed: Vec<String> = self
            .entries
            .values()
            .filter(|registration| registration.priority < floor)
            .map(|registration| registration.id.clone())
            .collect();
        for id in &shed {
            self.detach(id);
        }
        shed
    }

    /// Registrations for `table`, in admission order.
    pub(crate) fn for_table<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a Registration> + 'a {
        self.by_table
            .get(table)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    /// Distinct tables with at least one registration, sorted.
    pub(crate) fn tables(&self) -> Vec<String> {
        self.by_table.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn attach(&mut self, registration: Registration) {
        self.by_table
            .entry(registration.table.clone())
            .or_default()
            .push(registration.id.clone());
        self.entries.insert(registration.id.clone(), registration);
    }

    fn detach(&mut self, id: &str) {
        let Some(registration) = self.entries.remove(id) else {
            return;
        };
        if let Some(ids) = self.by_table.get_mut(&registration.table) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_table.remove(&registration.table);
            }
        }
    }
}
