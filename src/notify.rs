use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, PropertyId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-property broadcast of applied events, e.g. for a host's live calendar.
pub struct NotifyHub {
    channels: DashMap<PropertyId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a property. Creates the channel if needed.
    pub fn subscribe(&self, property_id: PropertyId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, property_id: PropertyId, event: &Event) {
        if let Some(sender) = self.channels.get(&property_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel of a delisted property. Open receivers see `Closed`.
    pub fn remove(&self, property_id: &PropertyId) {
        self.channels.remove(property_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = Event::ReservationCancelled {
            id: Ulid::new(),
            property_id: pid,
        };
        hub.send(pid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_properties_are_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(watched);

        hub.send(other, &Event::PropertyDelisted { id: other });
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        hub.send(pid, &Event::PropertyDelisted { id: pid });
    }

    #[tokio::test]
    async fn remove_closes_receivers() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);
        hub.remove(&pid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
