//! Publish/subscribe event bus.
//!
//! Delivery is best effort: no acknowledgement, persistence or replay. A
//! subscriber misses whatever is published while it is disconnected.
//! Per-publisher order on a channel is preserved by every implementation.

mod memory;
mod mqtt;

use anyhow::{anyhow, Result};
use std::sync::mpsc::{Receiver, TryRecvError};

use crate::runtime::{RetryPolicy, Shutdown};

pub use memory::MemoryBus;
pub use mqtt::{BrokerScheme, BrokerTls, ClientIdentity, MqttBus, MqttEndpoint, MqttSettings};

pub trait EventBus: Send {
    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()>;

    fn subscribe(&mut self, channel: &str) -> Result<Subscription>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Receiving end of one channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Non-blocking receive. `Ok(None)` when nothing is pending, `Err` once
    /// the underlying connection is gone.
    pub fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(anyhow!("subscription to '{}' disconnected", self.channel))
            }
        }
    }
}

pub type BusFactory = Box<dyn FnMut() -> Result<Box<dyn EventBus>> + Send>;

/// Owns one bus connection and re-establishes it through a [`RetryPolicy`].
pub struct BusLink {
    factory: BusFactory,
    bus: Option<Box<dyn EventBus>>,
    retry: RetryPolicy,
    shutdown: Shutdown,
}

impl BusLink {
    pub fn new(factory: BusFactory, retry: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            factory,
            bus: None,
            retry,
            shutdown,
        }
    }

    /// Wraps an already connected bus; reconnects go through `factory`.
    pub fn with_bus(mut self, bus: Box<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.bus.as_ref().is_some_and(|b| b.is_connected())
    }

    fn connected_bus(&mut self) -> Result<&mut Box<dyn EventBus>> {
        if !self.is_connected() {
            self.bus = None;
            let factory = &mut self.factory;
            let bus = self.retry.run(&self.shutdown, "bus connect", || factory())?;
            self.bus = Some(bus);
        }
        self.bus
            .as_mut()
            .ok_or_else(|| anyhow!("bus connection unavailable"))
    }

    /// Publishes once. A failed publish drops the connection so the next
    /// call reconnects; the payload itself is not retried.
    pub fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let bus = self.connected_bus()?;
        if let Err(e) = bus.publish(channel, payload) {
            self.bus = None;
            return Err(e);
        }
        Ok(())
    }

    pub fn subscribe(&mut self, channel: &str) -> Result<Subscription> {
        let factory = &mut self.factory;
        let existing = &mut self.bus;
        let (bus, sub) = self.retry.run(&self.shutdown, "bus subscribe", || {
            let mut bus = match existing.take() {
                Some(bus) if bus.is_connected() => bus,
                _ => factory()?,
            };
            let sub = bus.subscribe(channel)?;
            Ok((bus, sub))
        })?;
        self.bus = Some(bus);
        Ok(sub)
    }

    /// Forgets the current connection.
    pub fn invalidate(&mut self) {
        self.bus = None;
    }
}
