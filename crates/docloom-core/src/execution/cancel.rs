//! Cooperative cancellation flags shared by the execution service and the
//! step executor.
//!
//! A flag only matters while a step of that execution is in flight; once the
//! cancelled status is persisted, later callers see it in the stored state.
//! Flags are therefore pruned when the last in-flight step settles, or right
//! away when nothing was in flight at cancel time.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    cancelled: DashSet<Uuid>,
    in_flight: DashMap<Uuid, usize>,
}

/// Set of execution ids that have been cancelled.
///
/// Cancelling never aborts an in-flight provider call; holders check the
/// flag at their next decision point.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Inner>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id was already cancelled.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        self.inner.cancelled.insert(execution_id)
    }

    pub fn is_cancelled(&self, execution_id: &Uuid) -> bool {
        self.inner.cancelled.contains(execution_id)
    }

    /// Mark a step of `execution_id` as running until the guard drops.
    ///
    /// Take the guard before reading the execution's stored status, so a
    /// concurrent cancel either sees the step or is seen by the read.
    pub fn track(&self, execution_id: Uuid) -> InFlightStep {
        *self.inner.in_flight.entry(execution_id).or_insert(0) += 1;
        InFlightStep {
            registry: self.clone(),
            execution_id,
        }
    }

    /// Drop the flag when no step of the execution is in flight.
    ///
    /// Call after the cancelled status has been persisted.
    pub fn release_if_idle(&self, execution_id: &Uuid) {
        if !self.inner.in_flight.contains_key(execution_id) {
            self.inner.cancelled.remove(execution_id);
        }
    }

    /// Number of flags currently held.
    pub fn len(&self) -> usize {
        self.inner.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cancelled.is_empty()
    }
}

/// Guard returned by [`CancellationRegistry::track`].
#[derive(Debug)]
pub struct InFlightStep {
    registry: CancellationRegistry,
    execution_id: Uuid,
}

impl Drop for InFlightStep {
    fn drop(&mut self) {
        let inner = &self.registry.inner;
        if let Some(mut count) = inner.in_flight.get_mut(&self.execution_id) {
            *count = count.saturating_sub(1);
        }
        if inner
            .in_flight
            .remove_if(&self.execution_id, |_, count| *count == 0)
            .is_some()
        {
            inner.cancelled.remove(&self.execution_id);
        }
    }
}
