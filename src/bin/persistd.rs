//! persistd - store every event published on the bus.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use vigil::{
    bus::BusLink,
    consumer::{run_consumer, PersistenceConsumer},
    Shutdown, SqliteEventStore, VigilConfig,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Persist bus events to the event database")]
struct Args {
    /// Database path (overrides configuration).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(&args.ui);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        VigilConfig::load()?
    };
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }

    let store = {
        let _stage = ui.stage("Open event database");
        if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        SqliteEventStore::open(&cfg.db_path.to_string_lossy())?
    };
    log::info!("storing events in {}", cfg.db_path.display());

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("failed to install Ctrl-C handler")?;
    }

    let factory = cfg
        .bus
        .mqtt_factory(&format!("{}-persist", cfg.bus.client_id))?;
    let mut link = BusLink::new(factory, cfg.bus.retry_policy(), shutdown.clone());
    let mut consumer = PersistenceConsumer::new(store);

    let stats = run_consumer(
        &mut link,
        &cfg.bus.channel,
        &mut consumer,
        cfg.poll_interval,
        &shutdown,
    )?;
    ui.report(
        "persistence consumer",
        &[
            ("received", stats.received.to_string()),
            ("stored", consumer.stored().to_string()),
            ("dropped", stats.failed.to_string()),
            ("reconnects", stats.reconnects.to_string()),
        ],
    );
    Ok(())
}
