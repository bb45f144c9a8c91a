use model::events::Event;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// A subscription handle that can be used to unsubscribe from events.
#[derive(Debug, Clone)]
pub struct Subscription {
    event_type_id: TypeId,
    subscriber_id: u64,
}

type Senders = HashMap<u64, Box<dyn Any + Send + Sync>>;

/// Typed in-process fan-out of job events to passive observers.
///
/// Publishing never waits on a subscriber: a full mailbox drops the event for
/// that subscriber only.
#[derive(Clone, Default)]
pub struct EventBus {
    // Map of Event TypeID -> (Map of SubscriberID -> Sender)
    subscribers: Arc<RwLock<HashMap<TypeId, Senders>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new mailbox of `capacity` events of type `E`.
    pub async fn subscribe<E>(&self, capacity: usize) -> (Subscription, mpsc::Receiver<Arc<E>>)
    where
        E: Event + Clone,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscription = self.subscribe_with(tx).await;
        (subscription, rx)
    }

    pub async fn subscribe_with<E>(&self, sender: mpsc::Sender<Arc<E>>) -> Subscription
    where
        E: Event + Clone,
    {
        let event_type_id = TypeId::of::<E>();
        let subscriber_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(event_type_id)
            .or_default()
            .insert(subscriber_id, Box::new(sender));

        debug!(
            event_type = std::any::type_name::<E>(),
            subscriber_id, "Subscribed to event"
        );

        Subscription {
            event_type_id,
            subscriber_id,
        }
    }

    pub async fn publish<E>(&self, event: E)
    where
        E: Event + Clone,
    {
        let event_type_id = TypeId::of::<E>();
        let subscribers = self.subscribers.read().await;

        let Some(type_subscribers) = subscribers.get(&event_type_id) else {
            return;
        };

        let event = Arc::new(event);
        debug!(
            event_type = event.event_type(),
            subscriber_count = type_subscribers.len(),
            "Publishing event"
        );

        for (subscriber_id, boxed_sender) in type_subscribers.iter() {
            match boxed_sender.downcast_ref::<mpsc::Sender<Arc<E>>>() {
                Some(sender) => {
                    if let Err(e) = sender.try_send(event.clone()) {
                        warn!(
                            event_type = event.event_type(),
                            subscriber_id,
                            error = %e,
                            "Dropped event for slow or closed subscriber"
                        );
                    }
                }
                None => warn!(
                    event_type = event.event_type(),
                    subscriber_id, "Failed to downcast sender for subscriber"
                ),
            }
        }
    }

    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut subscribers = self.subscribers.write().await;

        if let Some(type_subscribers) = subscribers.get_mut(&subscription.event_type_id) {
            type_subscribers.remove(&subscription.subscriber_id);
            if type_subscribers.is_empty() {
                subscribers.remove(&subscription.event_type_id);
            }
        }
    }

    pub async fn subscriber_count<E>(&self) -> usize
    where
        E: Event,
    {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(&TypeId::of::<E>())
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::{
        events::{JobStarted, ProgressReported},
        ledger::LedgerSnapshot,
    };

    fn started(job_id: &str) -> JobStarted {
        JobStarted {
            job_id: job_id.to_string(),
            resumed: false,
            units: 4,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_only_matching_event_types() {
        let bus = EventBus::new();
        let (_sub, mut started_rx) = bus.subscribe::<JobStarted>(8).await;
        let (_sub2, mut progress_rx) = bus.subscribe::<ProgressReported>(8).await;

        bus.publish(started("job-1")).await;

        let event = started_rx.recv().await.unwrap();
        assert_eq!(event.job_id, "job-1");
        assert!(progress_rx.try_recv().is_err());

        bus.publish(ProgressReported {
            job_id: "job-1".into(),
            progress: LedgerSnapshot::default(),
            timestamp: Utc::now(),
        })
        .await;
        assert!(progress_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_mailbox_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe::<JobStarted>(1).await;

        bus.publish(started("a")).await;
        bus.publish(started("b")).await;

        assert_eq!(rx.recv().await.unwrap().job_id, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_mailbox() {
        let bus = EventBus::new();
        let (sub, _rx) = bus.subscribe::<JobStarted>(4).await;
        assert_eq!(bus.subscriber_count::<JobStarted>().await, 1);

        bus.unsubscribe(sub).await;
        assert_eq!(bus.subscriber_count::<JobStarted>().await, 0);
    }
}
