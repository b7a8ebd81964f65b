//! Bus consumers: a shared poll loop plus the persistence and alert handlers.

mod alert;
mod persist;

use anyhow::Result;
use std::time::Duration;

use crate::bus::{BusLink, Subscription};
use crate::runtime::Shutdown;

pub use alert::{
    alert_body, dedup_key, normalize_snapshot_path, to_windows_path, to_wsl_path, AlertConsumer,
    AlertOutcome, AlertPolicy, DedupCache, PathConvention, ALERT_SUBJECT, NO_TRACK_PLACEHOLDER,
};
pub use persist::PersistenceConsumer;

/// Processes one raw bus message.
pub trait EventHandler {
    fn name(&self) -> &str;

    /// An error drops this message only; the loop keeps running.
    fn handle(&mut self, payload: &[u8]) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub failed: u64,
    pub reconnects: u64,
}

/// Polls `channel` until shutdown, resubscribing whenever the subscription
/// reports disconnection.
///
/// Returns an error only when the link's retry policy gives up.
pub fn run_consumer(
    link: &mut BusLink,
    channel: &str,
    handler: &mut dyn EventHandler,
    poll_interval: Duration,
    shutdown: &Shutdown,
) -> Result<ConsumerStats> {
    let mut stats = ConsumerStats::default();
    let mut sub: Option<Subscription> = None;

    while !shutdown.is_triggered() {
        if sub.is_none() {
            match link.subscribe(channel) {
                Ok(fresh) => {
                    log::info!("{}: listening on '{}'", handler.name(), channel);
                    sub = Some(fresh);
                }
                Err(e) if shutdown.is_triggered() => {
                    log::debug!("{}: subscribe abandoned: {:#}", handler.name(), e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        let Some(current) = sub.as_ref() else {
            continue;
        };

        match current.try_recv() {
            Ok(Some(payload)) => {
                stats.received += 1;
                if let Err(e) = handler.handle(&payload) {
                    stats.failed += 1;
                    log::warn!("{}: message dropped: {:#}", handler.name(), e);
                }
            }
            Ok(None) => {
                shutdown.sleep(poll_interval);
            }
            Err(e) => {
                log::error!("{}: {}. Reconnecting...", handler.name(), e);
                link.invalidate();
                sub = None;
                stats.reconnects += 1;
            }
        }
    }

    log::info!(
        "{}: stopped after {} messages ({} dropped, {} reconnects)",
        handler.name(),
        stats.received,
        stats.failed,
        stats.reconnects
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusFactory, EventBus, MemoryBus};
    use crate::runtime::RetryPolicy;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
        stop_after: usize,
        shutdown: Shutdown,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&mut self, payload: &[u8]) -> Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(payload.to_vec());
            if seen.len() >= self.stop_after {
                self.shutdown.trigger();
            }
            if payload == b"bad" {
                return Err(anyhow!("bad payload"));
            }
            Ok(())
        }
    }

    fn factory(bus: MemoryBus) -> BusFactory {
        Box::new(move || Ok(Box::new(bus.clone()) as Box<dyn EventBus>))
    }

    #[test]
    fn drains_messages_and_survives_handler_errors() {
        let bus = MemoryBus::new();
        let shutdown = Shutdown::new();
        let mut link = BusLink::new(
            factory(bus.clone()),
            RetryPolicy::new(Duration::from_millis(1), None),
            shutdown.clone(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handler = Recorder {
            seen: seen.clone(),
            stop_after: 3,
            shutdown: shutdown.clone(),
        };

        let publisher = {
            let mut bus = bus.clone();
            std::thread::spawn(move || {
                while bus.subscriber_count("events") == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                for payload in [&b"one"[..], b"bad", b"three"] {
                    bus.publish("events", payload).unwrap();
                }
            })
        };

        let stats = run_consumer(
            &mut link,
            "events",
            &mut handler,
            Duration::from_millis(1),
            &shutdown,
        )
        .unwrap();
        publisher.join().unwrap();

        assert_eq!(stats.received, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(seen.lock().unwrap()[2], b"three".to_vec());
    }

    #[test]
    fn resubscribes_after_disconnect() {
        let bus = MemoryBus::new();
        let shutdown = Shutdown::new();
        let mut link = BusLink::new(
            factory(bus.clone()),
            RetryPolicy::new(Duration::from_millis(1), None),
            shutdown.clone(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handler = Recorder {
            seen: seen.clone(),
            stop_after: 1,
            shutdown: shutdown.clone(),
        };

        let publisher = {
            let mut bus = bus.clone();
            std::thread::spawn(move || {
                while bus.subscriber_count("events") == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                bus.disconnect_all();
                while bus.subscriber_count("events") == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                bus.publish("events", b"after").unwrap();
            })
        };

        let stats = run_consumer(
            &mut link,
            "events",
            &mut handler,
            Duration::from_millis(1),
            &shutdown,
        )
        .unwrap();
        publisher.join().unwrap();

        assert_eq!(stats.reconnects, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"after".to_vec()]);
    }

    #[test]
    fn returns_immediately_when_already_shut_down() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut link = BusLink::new(
            factory(MemoryBus::new()),
            RetryPolicy::default(),
            shutdown.clone(),
        );
        let mut handler = Recorder {
            seen: Arc::new(Mutex::new(Vec::new())),
            stop_after: 1,
            shutdown: shutdown.clone(),
        };
        let stats =
            run_consumer(&mut link, "events", &mut handler, Duration::from_millis(1), &shutdown)
                .unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }
}
