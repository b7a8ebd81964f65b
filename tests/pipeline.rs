use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use vigil::bus::{BusFactory, BusLink, EventBus, MemoryBus};
use vigil::consumer::{
    run_consumer, AlertConsumer, AlertOutcome, AlertPolicy, DedupCache, EventHandler,
    PathConvention, PersistenceConsumer,
};
use vigil::detect::ScriptedDetector;
use vigil::event::{BoundingBox, DetectionRecord, InboundEvent};
use vigil::ingest::{SyntheticConfig, SyntheticSource};
use vigil::notify::LogMailer;
use vigil::storage::{EventStore, InMemoryEventStore, SqliteEventStore};
use vigil::{IngestWorker, RetryPolicy, Shutdown, WorkerConfig};

const CHANNEL: &str = "surveillance_events";

fn memory_link(bus: &MemoryBus, shutdown: &Shutdown) -> BusLink {
    let bus = bus.clone();
    let factory: BusFactory = Box::new(move || Ok(Box::new(bus.clone()) as Box<dyn EventBus>));
    BusLink::new(
        factory,
        RetryPolicy::new(Duration::from_millis(5), Some(3)),
        shutdown.clone(),
    )
}

fn person(confidence: f64, track_id: i64) -> DetectionRecord {
    DetectionRecord::new("person", confidence, BoundingBox::new(20, 30, 90, 150))
        .with_track_id(track_id)
}

fn video2_worker(
    frames: Vec<Vec<DetectionRecord>>,
    bus: &MemoryBus,
    snapshot_dir: &Path,
    shutdown: &Shutdown,
) -> IngestWorker {
    let source = SyntheticSource::new(
        SyntheticConfig::from_uri(&format!(
            "stub://video2?frames={}&width=200&height=200",
            frames.len()
        ))
        .expect("stub uri"),
    );
    IngestWorker::new(
        WorkerConfig {
            source_id: "video_video2".to_string(),
            channel: CHANNEL.to_string(),
            classes: vec!["person".to_string()],
            min_confidence: 0.8,
            snapshot_dir: snapshot_dir.to_path_buf(),
            frame_delay: Duration::ZERO,
        },
        Box::new(source),
        Box::new(ScriptedDetector::new(frames)),
        memory_link(bus, shutdown),
        shutdown.clone(),
    )
}

fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    ready()
}

#[test]
fn new_track_produces_one_event_with_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut bus = MemoryBus::new();
    let sub = bus.subscribe(CHANNEL).expect("subscribe");
    let shutdown = Shutdown::new();

    let frames = vec![vec![person(0.85, 5)], vec![person(0.85, 5)]];
    let stats = video2_worker(frames, &bus, dir.path(), &shutdown)
        .run()
        .expect("worker run");
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.events, 1);

    let payload = sub.try_recv().expect("subscription").expect("one event");
    assert!(sub.try_recv().expect("subscription").is_none());

    let event = InboundEvent::from_payload(&payload).expect("decode");
    assert_eq!(event.source_id, "video_video2");
    assert_eq!(event.event_type, "object_detected");
    let details = event.detections();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].class_name, "person");
    assert_eq!(details[0].confidence, 0.85);
    assert_eq!(details[0].track_id, Some(5));

    let snapshot = PathBuf::from(event.snapshot_path.expect("snapshot path"));
    assert!(snapshot.is_absolute());
    assert!(snapshot.exists());
    let name = snapshot.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("snapshot_video_video2_"), "{}", name);
    assert!(name.ends_with(".jpg"));
}

#[test]
fn consumers_receive_the_same_event_independently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut bus = MemoryBus::new();
    let persist_sub = bus.subscribe(CHANNEL).expect("subscribe");
    let alert_sub = bus.subscribe(CHANNEL).expect("subscribe");
    let shutdown = Shutdown::new();

    let frames = vec![
        vec![person(0.85, 1)],
        vec![person(0.85, 1), person(0.92, 2)],
        vec![],
    ];
    video2_worker(frames, &bus, dir.path(), &shutdown)
        .run()
        .expect("worker run");

    let mut persist = PersistenceConsumer::new(InMemoryEventStore::new());
    while let Some(payload) = persist_sub.try_recv().expect("persist sub") {
        persist.handle(&payload).expect("persist");
    }
    let rows = persist.store_mut().list_recent(10).expect("list");
    assert_eq!(rows.len(), 2);
    // The second frame publishes only the new track, annotated alongside.
    assert_eq!(rows[0].object_details.as_array().map(Vec::len), Some(1));
    assert_eq!(rows[0].object_details[0]["track_id"], 2);
    assert_eq!(rows[0].confidence, Some(0.92));

    let mut alerts = AlertConsumer::new(
        AlertPolicy::default(),
        DedupCache::new(1000),
        LogMailer::new(),
        PathConvention::host(),
    );
    let mut outcomes = Vec::new();
    let mut replay = Vec::new();
    while let Some(payload) = alert_sub.try_recv().expect("alert sub") {
        let event = InboundEvent::from_payload(&payload).expect("decode");
        outcomes.push(alerts.process(&event));
        replay.push(event);
    }
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, AlertOutcome::Sent { .. })));
    assert_eq!(alerts.mailer().sent(), 2);

    // Redelivery of the same events is suppressed.
    for event in &replay {
        assert!(matches!(
            alerts.process(event),
            AlertOutcome::Suppressed { .. }
        ));
    }
    assert_eq!(alerts.mailer().sent(), 2);
}

#[test]
fn running_consumers_persist_and_alert_over_the_bus() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("surveillance.db");
    let db = db_path.to_string_lossy().to_string();
    let bus = MemoryBus::new();
    let shutdown = Shutdown::new();

    let persist_thread = {
        let mut link = memory_link(&bus, &shutdown);
        let shutdown = shutdown.clone();
        let store = SqliteEventStore::open(&db).expect("open store");
        std::thread::spawn(move || {
            let mut consumer = PersistenceConsumer::new(store);
            let stats = run_consumer(
                &mut link,
                CHANNEL,
                &mut consumer,
                Duration::from_millis(5),
                &shutdown,
            )
            .expect("persist loop");
            (stats, consumer.stored())
        })
    };
    let alert_thread = {
        let mut link = memory_link(&bus, &shutdown);
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut consumer = AlertConsumer::new(
                AlertPolicy::default(),
                DedupCache::new(1000),
                LogMailer::new(),
                PathConvention::host(),
            );
            run_consumer(
                &mut link,
                CHANNEL,
                &mut consumer,
                Duration::from_millis(5),
                &shutdown,
            )
            .expect("alert loop");
            consumer.mailer().sent()
        })
    };
    assert!(wait_until(Duration::from_secs(5), || bus
        .subscriber_count(CHANNEL)
        == 2));

    let snapshots = dir.path().join("snapshots");
    let frames = vec![
        vec![person(0.85, 5)],
        vec![person(0.85, 5)],
        // Significant for ingestion but not above the alert threshold.
        vec![DetectionRecord::new("person", 0.8, BoundingBox::new(0, 0, 10, 10)).with_track_id(6)],
    ];
    let stats = video2_worker(frames, &bus, &snapshots, &shutdown)
        .run()
        .expect("worker run");
    assert_eq!(stats.events, 2);

    let mut reader = SqliteEventStore::open(&db).expect("reopen store");
    assert!(wait_until(Duration::from_secs(5), || reader
        .list_recent(10)
        .map(|rows| rows.len() == 2)
        .unwrap_or(false)));
    // Give the alert consumer a moment to drain its queue.
    std::thread::sleep(Duration::from_millis(100));
    shutdown.trigger();

    let (persist_stats, stored) = persist_thread.join().expect("persist thread");
    let sent = alert_thread.join().expect("alert thread");
    assert_eq!(persist_stats.received, 2);
    assert_eq!(stored, 2);
    assert_eq!(sent, 1);
}

#[test]
fn consumer_resubscribes_after_broker_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = MemoryBus::new();
    let shutdown = Shutdown::new();

    let consumer_thread = {
        let mut link = memory_link(&bus, &shutdown);
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut consumer = PersistenceConsumer::new(InMemoryEventStore::new());
            let stats = run_consumer(
                &mut link,
                CHANNEL,
                &mut consumer,
                Duration::from_millis(5),
                &shutdown,
            )
            .expect("persist loop");
            (stats, consumer.stored())
        })
    };
    assert!(wait_until(Duration::from_secs(5), || bus
        .subscriber_count(CHANNEL)
        == 1));

    bus.disconnect_all();
    assert!(wait_until(Duration::from_secs(5), || bus
        .subscriber_count(CHANNEL)
        == 1));

    let frames = vec![vec![person(0.9, 7)]];
    video2_worker(frames, &bus, dir.path(), &shutdown)
        .run()
        .expect("worker run");
    std::thread::sleep(Duration::from_millis(100));
    shutdown.trigger();
    let (stats, stored) = consumer_thread.join().expect("consumer thread");
    assert!(stats.reconnects >= 1);
    assert_eq!(stored, 1);
}
