use anyhow::{Context, Result};

use super::EventHandler;
use crate::event::InboundEvent;
use crate::storage::{EventStore, NewEvent};

/// Writes every bus event to the store. A failed write is not retried.
pub struct PersistenceConsumer<S: EventStore> {
    store: S,
    stored: u64,
}

impl<S: EventStore> PersistenceConsumer<S> {
    pub fn new(store: S) -> Self {
        Self { store, stored: 0 }
    }

    pub fn stored(&self) -> u64 {
        self.stored
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn persist(&mut self, ev: &InboundEvent) -> Result<i64> {
        let row = NewEvent::from_inbound(ev);
        let id = self
            .store
            .insert(&row)
            .with_context(|| format!("failed to store event from {}", ev.source_id))?;
        self.stored += 1;
        log::info!(
            "Stored event {} from {} ({}) at {}",
            id,
            ev.source_id,
            ev.event_type,
            ev.timestamp
        );
        Ok(id)
    }
}

impl<S: EventStore> EventHandler for PersistenceConsumer<S> {
    fn name(&self) -> &str {
        "persist"
    }

    fn handle(&mut self, payload: &[u8]) -> Result<()> {
        let ev = InboundEvent::from_payload(payload)?;
        self.persist(&ev)?;
        Ok(())
    }
}
