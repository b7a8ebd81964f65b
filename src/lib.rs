//! Vigil
//!
//! Per-source detection ingestion feeding a publish/subscribe event bus, with
//! independent consumers that persist and alert on the published events, and a
//! small HTTP service for querying and deleting stored events.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (image directories, synthetic `stub://` feeds)
//! - `detect`: detector seam plus significance and novelty filtering
//! - `worker`: one ingestion loop per source
//! - `bus`: pub/sub transport (MQTT, in-process) and reconnecting link
//! - `consumer`: persistence and alert consumers
//! - `storage`: event rows in SQLite
//! - `notify`: alert mail delivery
//! - `api`: loopback HTTP query service

pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod detect;
pub mod event;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod runtime;
pub mod snapshot;
pub mod storage;
pub mod worker;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use bus::{BusLink, EventBus, MemoryBus, MqttBus, Subscription};
pub use config::VigilConfig;
pub use consumer::{run_consumer, AlertConsumer, EventHandler, PersistenceConsumer};
pub use event::{BoundingBox, DetectionRecord, Event, InboundEvent};
pub use frame::Frame;
pub use runtime::{RetryPolicy, Shutdown};
pub use storage::{EventStore, InMemoryEventStore, SqliteEventStore, StoredEvent};
pub use worker::{ControlSignal, IngestWorker, WorkerConfig, WorkerStats};
