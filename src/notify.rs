use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Mutation;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed mutations per stage.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Mutation>>,
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

    /// Subscribe to a stage's changes. Creates the channel if needed.
    pub fn subscribe(&self, stage_id: Ulid) -> broadcast::Receiver<Mutation> {
        let sender = self
            .channels
            .entry(stage_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, stage_id: Ulid, mutation: &Mutation) {
        if let Some(sender) = self.channels.get(&stage_id) {
            let _ = sender.send(mutation.clone());
        }
    }
}
