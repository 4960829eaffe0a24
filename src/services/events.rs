//! Typed domain event bus.
//!
//! A closed set of event variants dispatched over a `tokio::sync::broadcast`
//! channel. Publishing with no subscriber is a no-op.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::enums::{EquipmentStatus, Severity};

const CHANNEL_CAPACITY: usize = 256;

/// How a unit left its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Returned,
    RedTagged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    EquipmentAllocated {
        equipment_id: String,
        job_id: String,
        session_id: Option<String>,
        node_ref: Option<String>,
    },
    EquipmentReturned {
        equipment_id: String,
        job_id: Option<String>,
        kind: ReturnKind,
        location_id: Option<String>,
        hours_used: Option<f64>,
        severity: Option<Severity>,
    },
    EquipmentStatusChange {
        equipment_id: String,
        from: EquipmentStatus,
        to: EquipmentStatus,
    },
    EquipmentTypeCreated {
        type_id: String,
        name: String,
    },
    EquipmentTypeUpdated {
        type_id: String,
        name: String,
    },
    EquipmentTypeDeleted {
        type_id: String,
    },
    BulkEquipmentStatusUpdated {
        equipment_ids: Vec<String>,
        status: EquipmentStatus,
    },
    ConflictsDetected {
        count: usize,
        conflict_ids: Vec<String>,
    },
}

/// Discriminant of `DomainEvent`, used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EquipmentAllocated,
    EquipmentReturned,
    EquipmentStatusChange,
    EquipmentTypeCreated,
    EquipmentTypeUpdated,
    EquipmentTypeDeleted,
    BulkEquipmentStatusUpdated,
    ConflictsDetected,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::EquipmentAllocated { .. } => EventKind::EquipmentAllocated,
            DomainEvent::EquipmentReturned { .. } => EventKind::EquipmentReturned,
            DomainEvent::EquipmentStatusChange { .. } => EventKind::EquipmentStatusChange,
            DomainEvent::EquipmentTypeCreated { .. } => EventKind::EquipmentTypeCreated,
            DomainEvent::EquipmentTypeUpdated { .. } => EventKind::EquipmentTypeUpdated,
            DomainEvent::EquipmentTypeDeleted { .. } => EventKind::EquipmentTypeDeleted,
            DomainEvent::BulkEquipmentStatusUpdated { .. } => EventKind::BulkEquipmentStatusUpdated,
            DomainEvent::ConflictsDetected { .. } => EventKind::ConflictsDetected,
        }
    }
}

/// Which events a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event (`'*'`)
    All,
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn kind(kind: EventKind) -> Self {
        EventFilter::Kinds(vec![kind])
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&event.kind()),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        tracing::debug!("Publishing {:?}", event.kind());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Run `handler` for every matching event on a background task until the
    /// returned handle is unsubscribed or dropped.
    pub fn on<F>(&self, filter: EventFilter, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(DomainEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(filter);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
        });
        SubscriptionHandle { task: Some(task) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Filtered receiving end of the bus
pub struct Subscription {
    receiver: broadcast::Receiver<DomainEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event; `None` once the bus is gone. Lagged events are
    /// skipped with a warning.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Event subscriber lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Matching events as a stream
    pub fn into_stream(self) -> impl tokio_stream::Stream<Item = DomainEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let filter = self.filter;
        BroadcastStream::new(self.receiver)
            .filter_map(move |item| item.ok().filter(|event| filter.matches(event)))
    }
}

/// Handle returned by `EventBus::on`
pub struct SubscriptionHandle {
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn status_change(id: &str) -> DomainEvent {
        DomainEvent::EquipmentStatusChange {
            equipment_id: id.into(),
            from: EquipmentStatus::Available,
            to: EquipmentStatus::Maintenance,
        }
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_kinds() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::kind(EventKind::EquipmentStatusChange));

        bus.publish(DomainEvent::EquipmentTypeDeleted { type_id: "t1".into() });
        bus.publish(status_change("e1"));

        assert_eq!(sub.recv().await, Some(status_change("e1")));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(status_change("e1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wildcard_stream_sees_everything() {
        let bus = EventBus::new();
        let stream = bus.subscribe(EventFilter::All).into_stream();
        tokio::pin!(stream);

        bus.publish(DomainEvent::EquipmentTypeDeleted { type_id: "t1".into() });
        bus.publish(status_change("e2"));

        assert_eq!(stream.next().await.unwrap().kind(), EventKind::EquipmentTypeDeleted);
        assert_eq!(stream.next().await.unwrap().kind(), EventKind::EquipmentStatusChange);
    }

    #[tokio::test]
    async fn unsubscribe_stops_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.on(EventFilter::All, move |event| {
            sink.lock().unwrap().push(event.kind());
        });

        bus.publish(status_change("e1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(status_change("e2"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[EventKind::EquipmentStatusChange]);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
