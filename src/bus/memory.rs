use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

use super::{EventBus, Subscription};

type Subscribers = HashMap<String, Vec<Sender<Vec<u8>>>>;

/// In-process broker. Clones share the same channels.
///
/// Messages published to a channel with no live subscriber are dropped.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every subscription, as a broker restart would.
    pub fn disconnect_all(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl EventBus for MemoryBus {
    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| anyhow!("memory bus lock poisoned"))?;
        if let Some(senders) = subs.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&mut self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("memory bus lock poisoned"))?
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }
}
