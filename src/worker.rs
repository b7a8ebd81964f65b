//! Per-source ingestion worker.
//!
//! A worker owns everything it touches: its frame source, detector, novelty
//! set, snapshot writer and bus link. Nothing mutable is shared between
//! workers, so several can run on separate threads of one process.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use crate::bus::BusLink;
use crate::detect::{Detector, NoveltyFilter, SignificanceFilter};
use crate::event::{now_millis, Event};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::runtime::Shutdown;
use crate::snapshot::SnapshotWriter;

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Interactive control of a running worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Quit,
}

impl ControlSignal {
    /// Console key binding: `p`, `r`, `q`.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "p" | "pause" => Some(Self::Pause),
            "r" | "resume" => Some(Self::Resume),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub source_id: String,
    pub channel: String,
    pub classes: Vec<String>,
    pub min_confidence: f64,
    pub snapshot_dir: PathBuf,
    /// Pause between frames; zero disables pacing.
    pub frame_delay: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub events: u64,
    pub publish_failures: u64,
    pub snapshot_failures: u64,
}

pub struct IngestWorker {
    source_id: String,
    channel: String,
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    significance: SignificanceFilter,
    novelty: NoveltyFilter,
    snapshots: SnapshotWriter,
    link: BusLink,
    control: Option<Receiver<ControlSignal>>,
    shutdown: Shutdown,
    frame_delay: Duration,
    paused: bool,
    stats: WorkerStats,
}

impl IngestWorker {
    pub fn new(
        cfg: WorkerConfig,
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        link: BusLink,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            significance: SignificanceFilter::new(cfg.classes, cfg.min_confidence),
            snapshots: SnapshotWriter::new(cfg.snapshot_dir),
            source_id: cfg.source_id,
            channel: cfg.channel,
            source,
            detector,
            novelty: NoveltyFilter::new(),
            link,
            control: None,
            shutdown,
            frame_delay: cfg.frame_delay,
            paused: false,
            stats: WorkerStats::default(),
        }
    }

    /// Starts from an existing novelty set instead of an empty one.
    pub fn with_novelty(mut self, novelty: NoveltyFilter) -> Self {
        self.novelty = novelty;
        self
    }

    pub fn with_control(mut self, control: Receiver<ControlSignal>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn novelty(&self) -> &NoveltyFilter {
        &self.novelty
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Detects, filters and, for novel tracks, snapshots one frame.
    ///
    /// Returns the event to publish, or `None` when nothing new was seen.
    /// A failed snapshot write leaves `snapshot_path` empty.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Option<Event>> {
        let detections = self
            .detector
            .detect(frame, true)
            .with_context(|| format!("detector failed on frame {}", frame.index()))?;
        let significant = self.significance.apply(&detections);
        let novel = self.novelty.admit(&significant);
        if novel.is_empty() {
            return Ok(None);
        }

        let timestamp = now_millis();
        let annotated = frame.annotated(&significant);
        let snapshot_path = match self.snapshots.write(&self.source_id, timestamp, &annotated) {
            Ok(path) => {
                let path = std::fs::canonicalize(&path).unwrap_or(path);
                Some(path.display().to_string())
            }
            Err(e) => {
                self.stats.snapshot_failures += 1;
                log::warn!("[{}] snapshot not saved: {:#}", self.source_id, e);
                None
            }
        };

        let ids: Vec<String> = novel
            .iter()
            .filter_map(|d| d.track_id.map(|id| id.to_string()))
            .collect();
        log::info!(
            "[{}] new objects on frame {}: track ids {}",
            self.source_id,
            frame.index(),
            ids.join(", ")
        );
        Ok(Some(Event::object_detected(
            timestamp,
            &self.source_id,
            novel,
            snapshot_path,
        )))
    }

    fn publish(&mut self, event: &Event) -> Result<()> {
        let payload = event.to_payload()?;
        self.link.publish(&self.channel, &payload)
    }

    /// Applies pending control signals, blocking while paused.
    /// Returns `false` when the worker should stop.
    fn apply_control(&mut self) -> bool {
        let Some(rx) = self.control.as_ref() else {
            return true;
        };
        loop {
            let signal = if self.paused {
                match rx.recv_timeout(PAUSE_POLL) {
                    Ok(signal) => signal,
                    Err(RecvTimeoutError::Timeout) => {
                        if self.shutdown.is_triggered() {
                            return false;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        log::warn!("[{}] control channel closed; resuming", self.source_id);
                        self.paused = false;
                        return true;
                    }
                }
            } else {
                match rx.try_recv() {
                    Ok(signal) => signal,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
                }
            };
            match signal {
                ControlSignal::Pause if !self.paused => {
                    log::info!("[{}] paused", self.source_id);
                    self.paused = true;
                }
                ControlSignal::Pause | ControlSignal::Resume => {
                    if self.paused {
                        log::info!("[{}] resumed", self.source_id);
                    }
                    self.paused = false;
                }
                ControlSignal::Quit => {
                    log::info!("[{}] quit requested", self.source_id);
                    return false;
                }
            }
        }
    }

    /// Consumes frames until end of stream, a quit signal, shutdown, or a
    /// per-frame error. Fails only if the detector cannot warm up.
    pub fn run(mut self) -> Result<WorkerStats> {
        log::info!(
            "[{}] starting: source {}, detector {}, publishing to '{}'",
            self.source_id,
            self.source.describe(),
            self.detector.name(),
            self.channel
        );
        self.detector
            .warm_up()
            .with_context(|| format!("[{}] detector warm-up failed", self.source_id))?;

        loop {
            if self.shutdown.is_triggered() || !self.apply_control() {
                break;
            }
            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("[{}] end of stream", self.source_id);
                    break;
                }
                Err(e) => {
                    log::error!("[{}] frame read failed: {:#}", self.source_id, e);
                    break;
                }
            };
            self.stats.frames += 1;

            match self.process_frame(&frame) {
                Ok(Some(event)) => match self.publish(&event) {
                    Ok(()) => self.stats.events += 1,
                    Err(e) => {
                        self.stats.publish_failures += 1;
                        log::warn!("[{}] publish failed: {:#}", self.source_id, e);
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    log::error!("[{}] {:#}", self.source_id, e);
                    break;
                }
            }

            if !self.frame_delay.is_zero() {
                self.shutdown.sleep(self.frame_delay);
            }
        }

        log::info!(
            "[{}] stopped: {} frames, {} events, {} publish failures, {} snapshot failures",
            self.source_id,
            self.stats.frames,
            self.stats.events,
            self.stats.publish_failures,
            self.stats.snapshot_failures
        );
        Ok(self.stats)
    }
}
