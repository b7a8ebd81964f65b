//! alertd - send a notification for each new person detection on the bus.

use anyhow::{Context, Result};
use clap::Parser;

use vigil::{
    bus::BusLink,
    consumer::{run_consumer, AlertConsumer, AlertPolicy, DedupCache},
    notify::{LogMailer, Mailer, SmtpMailer},
    Shutdown, VigilConfig,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Alert on person detections published to the event bus")]
struct Args {
    /// Log notifications instead of mailing them, even if SMTP is configured.
    #[arg(long)]
    dry_run: bool,

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

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("failed to install Ctrl-C handler")?;
    }

    log::info!(
        "alerting on '{}' above {:.2} (cooldown {}s configured, not enforced; dedup capacity {})",
        cfg.alert.class_name,
        cfg.alert.min_confidence,
        cfg.alert.cooldown.as_secs(),
        cfg.alert.dedup_capacity
    );

    match cfg.smtp.as_ref().filter(|_| !args.dry_run) {
        Some(smtp) => {
            let mailer = {
                let _stage = ui.stage("Prepare SMTP mailer");
                SmtpMailer::new(smtp.mailer_settings()?)?
            };
            log::info!(
                "mailing alerts through {} (STARTTLS {:?})",
                smtp.server,
                smtp.starttls
            );
            run_alerts(&cfg, mailer, &shutdown, &ui)
        }
        None => {
            log::warn!("SMTP not configured; alerts go to the log only");
            run_alerts(&cfg, LogMailer::new(), &shutdown, &ui)
        }
    }
}

fn run_alerts<M: Mailer>(
    cfg: &VigilConfig,
    mailer: M,
    shutdown: &Shutdown,
    ui: &ui::Ui,
) -> Result<()> {
    let policy = AlertPolicy {
        class_name: cfg.alert.class_name.clone(),
        min_confidence: cfg.alert.min_confidence,
    };
    let mut consumer = AlertConsumer::new(
        policy,
        DedupCache::new(cfg.alert.dedup_capacity),
        mailer,
        cfg.alert.path_convention,
    );

    let factory = cfg
        .bus
        .mqtt_factory(&format!("{}-alert", cfg.bus.client_id))?;
    let mut link = BusLink::new(factory, cfg.bus.retry_policy(), shutdown.clone());

    let stats = run_consumer(
        &mut link,
        &cfg.bus.channel,
        &mut consumer,
        cfg.poll_interval,
        shutdown,
    )?;
    ui.report(
        "alert consumer",
        &[
            ("received", stats.received.to_string()),
            ("dropped", stats.failed.to_string()),
            ("reconnects", stats.reconnects.to_string()),
            ("dedup keys", consumer.dedup().len().to_string()),
        ],
    );
    Ok(())
}
