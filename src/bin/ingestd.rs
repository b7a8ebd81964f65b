//! ingestd - per-source detection ingestion.
//!
//! Starts one worker thread per configured source. Each worker reads frames,
//! runs the detector with tracking, snapshots frames that show new tracks and
//! publishes an `object_detected` event to the bus.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::thread::JoinHandle;

use vigil::{
    bus::BusLink,
    detect::{Detector, ScriptedDetector},
    ingest::{derive_source_id, open_source},
    ControlSignal, IngestWorker, Shutdown, VigilConfig, WorkerConfig, WorkerStats,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run detection workers and publish events")]
struct Args {
    /// Frame source: an image directory or a `stub://name` feed. Repeatable.
    #[arg(long = "video-path", value_name = "PATH")]
    video_paths: Vec<String>,

    /// Detection script (JSONL) or a directory of `<stem>.jsonl` scripts.
    #[arg(long, env = "VIGIL_DETECTIONS")]
    detections: Option<PathBuf>,

    /// Read p/r/q from stdin to pause, resume or stop every worker.
    #[arg(long)]
    interactive: bool,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

struct Running {
    source_id: String,
    control: Sender<ControlSignal>,
    handle: JoinHandle<Result<WorkerStats>>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(&args.ui);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        VigilConfig::load()?
    };
    if !args.video_paths.is_empty() {
        cfg.ingest.sources = args.video_paths.clone();
    }
    if args.detections.is_some() {
        cfg.ingest.detections = args.detections.clone();
    }

    let sources = usable_sources(&cfg.ingest.sources);
    if sources.is_empty() {
        return Err(anyhow!("no usable video source configured"));
    }

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("failed to install Ctrl-C handler")?;
    }

    let mut running = Vec::new();
    {
        let stage = ui.stage("Start workers");
        for source in &sources {
            match spawn_worker(&cfg, source, &shutdown) {
                Ok(worker) => running.push(worker),
                Err(e) => log::error!("{}: {:#}", source, e),
            }
        }
        if running.is_empty() {
            stage.fail("no worker started");
            return Err(anyhow!("every worker failed to start"));
        }
    }
    log::info!(
        "ingestd running: {} worker(s) publishing to '{}'",
        running.len(),
        cfg.bus.channel
    );

    if args.interactive {
        let controls: Vec<Sender<ControlSignal>> =
            running.iter().map(|w| w.control.clone()).collect();
        spawn_console(controls);
        log::info!("console controls: p = pause, r = resume, q = quit");
    }

    let mut total = WorkerStats::default();
    for worker in running {
        match worker.handle.join() {
            Ok(Ok(stats)) => {
                ui.report(
                    &worker.source_id,
                    &[
                        ("frames", stats.frames.to_string()),
                        ("events", stats.events.to_string()),
                        ("publish failures", stats.publish_failures.to_string()),
                        ("snapshot failures", stats.snapshot_failures.to_string()),
                    ],
                );
                total.frames += stats.frames;
                total.events += stats.events;
            }
            Ok(Err(e)) => log::error!("[{}] worker failed: {:#}", worker.source_id, e),
            Err(_) => log::error!("[{}] worker panicked", worker.source_id),
        }
    }
    log::info!(
        "ingestd finished: {} frames, {} events",
        total.frames,
        total.events
    );
    Ok(())
}

/// Drops sources that do not exist on disk. `stub://` feeds always pass.
fn usable_sources(sources: &[String]) -> Vec<String> {
    sources
        .iter()
        .filter(|source| {
            if source.contains("://") || Path::new(source.as_str()).exists() {
                true
            } else {
                log::warn!("video source not found, skipping: {}", source);
                false
            }
        })
        .cloned()
        .collect()
}

fn load_detector(cfg: &VigilConfig, source: &str) -> Result<Box<dyn Detector>> {
    let path = cfg
        .ingest
        .detections_for(source)
        .ok_or_else(|| anyhow!("no detection script configured (--detections)"))?;
    let detector = ScriptedDetector::load(&path)?;
    log::info!(
        "{}: {} scripted frames from {}",
        source,
        detector.frame_count(),
        path.display()
    );
    Ok(Box::new(detector))
}

fn spawn_worker(cfg: &VigilConfig, source: &str, shutdown: &Shutdown) -> Result<Running> {
    let source_id = derive_source_id(source);
    let frames = open_source(source)?;
    let detector = load_detector(cfg, source)?;
    let factory = cfg
        .bus
        .mqtt_factory(&format!("{}-{}", cfg.bus.client_id, source_id))?;
    let link = BusLink::new(factory, cfg.bus.retry_policy(), shutdown.clone());

    let worker_cfg = WorkerConfig {
        source_id: source_id.clone(),
        channel: cfg.bus.channel.clone(),
        classes: cfg.ingest.classes.clone(),
        min_confidence: cfg.ingest.min_confidence,
        snapshot_dir: cfg.snapshot_dir.clone(),
        frame_delay: cfg.ingest.frame_delay,
    };
    let (control, control_rx) = channel();
    let worker = IngestWorker::new(worker_cfg, frames, detector, link, shutdown.clone())
        .with_control(control_rx);

    let handle = std::thread::Builder::new()
        .name(source_id.clone())
        .spawn(move || worker.run())
        .with_context(|| format!("failed to spawn worker thread for {}", source_id))?;
    Ok(Running {
        source_id,
        control,
        handle,
    })
}

fn spawn_console(controls: Vec<Sender<ControlSignal>>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let Some(signal) = ControlSignal::from_key(&line) else {
                eprintln!("unknown command '{}' (p/r/q)", line.trim());
                continue;
            };
            // Workers that already stopped have dropped their receiver.
            for control in &controls {
                let _ = control.send(signal);
            }
            if signal == ControlSignal::Quit {
                break;
            }
        }
    });
}
