//! Progress bus keyed by execution id.
//!
//! Unlike a single broadcast channel, every subscriber owns an unbounded
//! queue registered under one execution id. Publishing clones the event into
//! each live queue of that id; with no subscribers the event is dropped, not
//! buffered for later joiners.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use docloom_types::event::{ProgressEvent, ProgressEventType};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Multicast progress bus. Cloning shares the subscriber registry.
#[derive(Clone, Default)]
pub struct ProgressBus {
    subscribers: Arc<DashMap<Uuid, Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queue for `execution_id`.
    ///
    /// The queue already holds a synthetic `connected` event. Dropping the
    /// returned [`Subscription`] unsubscribes it.
    pub fn subscribe(&self, execution_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let connected = ProgressEvent::new(ProgressEventType::Connected, execution_id);
        // The receiver is alive right here, so this cannot fail.
        let _ = tx.send(connected);

        self.subscribers
            .entry(execution_id)
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(execution_id = %execution_id, subscriber = id, "progress subscriber added");

        Subscription {
            execution_id,
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Deliver `event` to every current subscriber of its execution id.
    ///
    /// Returns how many queues received it. Closed queues are pruned.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let execution_id = event.execution_id;
        let delivered = match self.subscribers.get_mut(&execution_id) {
            Some(mut subs) => {
                subs.retain(|s| s.tx.send(event.clone()).is_ok());
                subs.len()
            }
            None => 0,
        };
        if delivered == 0 {
            self.subscribers.remove_if(&execution_id, |_, subs| subs.is_empty());
            tracing::trace!(
                execution_id = %execution_id,
                event_type = %event.event_type,
                "no subscribers, progress event dropped"
            );
        }
        delivered
    }

    /// Remove one subscriber; other subscribers of the same id are unaffected.
    pub fn unsubscribe(&self, execution_id: &Uuid, subscriber_id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(execution_id) {
            subs.retain(|s| s.id != subscriber_id);
        }
        self.subscribers.remove_if(execution_id, |_, subs| subs.is_empty());
        tracing::debug!(execution_id = %execution_id, subscriber = subscriber_id, "progress subscriber removed");
    }

    pub fn subscriber_count(&self, execution_id: &Uuid) -> usize {
        self.subscribers.get(execution_id).map_or(0, |subs| subs.len())
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("executions", &self.subscribers.len())
            .finish()
    }
}

/// One subscriber's queue. Unsubscribes on drop.
pub struct Subscription {
    execution_id: Uuid,
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    bus: ProgressBus,
}

impl Subscription {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next queued event; `None` once the subscription has been removed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.execution_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ProgressEventType, execution_id: Uuid) -> ProgressEvent {
        ProgressEvent::new(kind, execution_id)
    }

    #[tokio::test]
    async fn subscriber_first_receives_connected() {
        let bus = ProgressBus::new();
        let exec = Uuid::now_v7();
        let mut sub = bus.subscribe(exec);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, ProgressEventType::Connected);
        assert_eq!(first.execution_id, exec);
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let bus = ProgressBus::new();
        let exec = Uuid::now_v7();
        let mut a = bus.subscribe(exec);
        let mut b = bus.subscribe(exec);

        assert_eq!(bus.publish(event(ProgressEventType::StepStarted, exec)), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.unwrap().event_type, ProgressEventType::Connected);
            assert_eq!(sub.recv().await.unwrap().event_type, ProgressEventType::StepStarted);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_not_buffered() {
        let bus = ProgressBus::new();
        let exec = Uuid::now_v7();

        assert_eq!(bus.publish(event(ProgressEventType::StepCompleted, exec)), 0);

        let mut late = bus.subscribe(exec);
        assert_eq!(late.recv().await.unwrap().event_type, ProgressEventType::Connected);
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn events_are_scoped_to_execution_id() {
        let bus = ProgressBus::new();
        let exec_a = Uuid::now_v7();
        let exec_b = Uuid::now_v7();
        let mut sub_a = bus.subscribe(exec_a);
        sub_a.recv().await.unwrap();

        bus.publish(event(ProgressEventType::StepStarted, exec_b));
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_subscribers() {
        let bus = ProgressBus::new();
        let exec = Uuid::now_v7();
        let a = bus.subscribe(exec);
        let mut b = bus.subscribe(exec);
        assert_eq!(bus.subscriber_count(&exec), 2);

        drop(a);
        assert_eq!(bus.subscriber_count(&exec), 1);

        assert_eq!(bus.publish(event(ProgressEventType::StepFailed, exec)), 1);
        b.recv().await.unwrap();
        assert_eq!(b.recv().await.unwrap().event_type, ProgressEventType::StepFailed);

        drop(b);
        assert_eq!(bus.subscriber_count(&exec), 0);
        assert!(format!("{bus:?}").contains("executions: 0"));
    }
}
