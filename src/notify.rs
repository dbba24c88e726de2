use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY. Channels are keyed by ULID; ledger and
/// subscription events go out on the account's channel, booking and session
/// events additionally on the resource's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&channel_id) {
            let _ = sender.send(event.clone());
        }
    }
}
