use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-room broadcast of committed events. Subscribers that fall more than
/// `CHANNEL_CAPACITY` events behind see `RecvError::Lagged`.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening on `room_id`.
    pub fn send(&self, room_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the room's channel; open receivers see `Closed` once drained.
    pub fn remove(&self, room_id: &Ulid) {
        self.channels.remove(room_id);
    }

    pub fn subscriber_count(&self, room_id: &Ulid) -> usize {
        self.channels
            .get(room_id)
            .map_or(0, |s| s.receiver_count())
    }
}
