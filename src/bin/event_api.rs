//! event_api - loopback HTTP service for listing and deleting stored events
//! and fetching their snapshots.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use vigil::{ApiConfig, ApiServer, Shutdown, VigilConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the stored event history over HTTP")]
struct Args {
    /// Listen address (overrides configuration).
    #[arg(long)]
    addr: Option<String>,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(&args.ui);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        VigilConfig::load()?
    };
    let api_cfg = ApiConfig {
        addr: args.addr.unwrap_or_else(|| cfg.api_addr.clone()),
        db_path: cfg.db_path.clone(),
        snapshot_dir: cfg.snapshot_dir.clone(),
    };

    let handle = {
        let _stage = ui.stage("Start event api");
        ApiServer::new(api_cfg).spawn()?
    };
    log::info!("event api listening on http://{}", handle.addr);
    log::info!(
        "database {}, snapshots {}",
        cfg.db_path.display(),
        cfg.snapshot_dir.display()
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("failed to install Ctrl-C handler")?;
    }
    while shutdown.sleep(Duration::from_millis(250)) {
        if handle.is_finished() {
            log::error!("event api thread exited");
            break;
        }
    }

    let _stage = ui.stage("Stop event api");
    handle.stop()
}
