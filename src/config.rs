use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::{BrokerTls, BusFactory, EventBus, MqttBus, MqttEndpoint, MqttSettings};
use crate::consumer::PathConvention;
use crate::ingest::derive_source_id;
use crate::notify::{SmtpSettings, StartTls};
use crate::runtime::RetryPolicy;

const DEFAULT_DB_PATH: &str = "data/surveillance.db";
const DEFAULT_SNAPSHOT_DIR: &str = "data/snapshots";
const DEFAULT_SOURCE: &str = "data/videos/video2";
const DEFAULT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_CHANNEL: &str = "surveillance_events";
const DEFAULT_CLIENT_ID: &str = "vigil";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8008";
const DEFAULT_CLASS: &str = "person";
const DEFAULT_MIN_CONFIDENCE: f64 = 0.8;
const DEFAULT_ALERT_CONFIDENCE: f64 = 0.8;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_DEDUP_CAPACITY: usize = 1000;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_FRAME_DELAY_MS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct VigilConfigFile {
    db_path: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    bus: Option<BusConfigFile>,
    ingest: Option<IngestConfigFile>,
    alert: Option<AlertConfigFile>,
    smtp: Option<SmtpConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BusConfigFile {
    broker: Option<String>,
    channel: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    reconnect_delay_secs: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    sources: Option<Vec<String>>,
    detections: Option<PathBuf>,
    classes: Option<Vec<String>>,
    min_confidence: Option<f64>,
    frame_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    class_name: Option<String>,
    min_confidence: Option<f64>,
    cooldown_secs: Option<u64>,
    dedup_capacity: Option<usize>,
    path_convention: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SmtpConfigFile {
    server: Option<String>,
    username: Option<String>,
    password: Option<String>,
    from: Option<String>,
    to: Option<Vec<String>>,
    starttls: Option<String>,
    tls_ca_path: Option<PathBuf>,
    allow_plaintext_auth: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub db_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub poll_interval: Duration,
    pub api_addr: String,
    pub bus: BusSettings,
    pub ingest: IngestSettings,
    pub alert: AlertSettings,
    /// `None` sends notifications to the log only.
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub broker: String,
    pub channel: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub reconnect_delay: Duration,
    /// `None` retries until shutdown.
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub sources: Vec<String>,
    /// Detection script: one JSONL file for every source, or a directory
    /// holding `<stem>.jsonl` per source.
    pub detections: Option<PathBuf>,
    pub classes: Vec<String>,
    pub min_confidence: f64,
    pub frame_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub class_name: String,
    pub min_confidence: f64,
    /// Loaded and reported, not enforced.
    pub cooldown: Duration,
    pub dedup_capacity: usize,
    pub path_convention: PathConvention,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub starttls: StartTls,
    pub tls_ca_path: Option<PathBuf>,
    pub allow_plaintext_auth: bool,
}

impl SmtpConfig {
    fn from_file(file: SmtpConfigFile) -> Result<Self> {
        Ok(Self {
            server: file.server.unwrap_or_default(),
            username: file.username,
            password: file.password,
            from: file.from.unwrap_or_default(),
            to: file.to.unwrap_or_default(),
            starttls: match file.starttls.as_deref() {
                Some(mode) => mode.parse()?,
                None => StartTls::default(),
            },
            tls_ca_path: file.tls_ca_path,
            allow_plaintext_auth: file.allow_plaintext_auth.unwrap_or(false),
        })
    }

    fn empty() -> Self {
        Self {
            server: String::new(),
            username: None,
            password: None,
            from: String::new(),
            to: Vec::new(),
            starttls: StartTls::default(),
            tls_ca_path: None,
            allow_plaintext_auth: false,
        }
    }

    /// Mailer settings with the CA bundle read from disk.
    pub fn mailer_settings(&self) -> Result<SmtpSettings> {
        let mut settings = SmtpSettings::new(&self.server, &self.from, self.to.clone());
        settings.username = self.username.clone();
        settings.password = self.password.clone();
        settings.starttls = self.starttls;
        settings.allow_plaintext_auth = self.allow_plaintext_auth;
        settings.tls_ca = match &self.tls_ca_path {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                anyhow!("failed to read SMTP TLS CA '{}': {}", path.display(), e)
            })?),
            None => None,
        };
        Ok(settings)
    }
}

impl VigilConfig {
    /// Defaults, then the file named by `VIGIL_CONFIG`, then `VIGIL_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigilConfigFile) -> Result<Self> {
        let bus = file.bus.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let path_convention = match alert.path_convention.as_deref() {
            Some(value) => value.parse()?,
            None => PathConvention::host(),
        };

        Ok(Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            snapshot_dir: file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            bus: BusSettings {
                broker: bus.broker.unwrap_or_else(|| DEFAULT_BROKER.to_string()),
                channel: bus.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                client_id: bus.client_id.unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: bus.username,
                password: bus.password,
                tls_ca_path: bus.tls_ca_path,
                tls_client_cert_path: bus.tls_client_cert_path,
                tls_client_key_path: bus.tls_client_key_path,
                reconnect_delay: Duration::from_secs(
                    bus.reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
                max_reconnect_attempts: bus.max_reconnect_attempts,
            },
            ingest: IngestSettings {
                sources: ingest
                    .sources
                    .unwrap_or_else(|| vec![DEFAULT_SOURCE.to_string()]),
                detections: ingest.detections,
                classes: ingest
                    .classes
                    .unwrap_or_else(|| vec![DEFAULT_CLASS.to_string()]),
                min_confidence: ingest.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
                frame_delay: Duration::from_millis(
                    ingest.frame_delay_ms.unwrap_or(DEFAULT_FRAME_DELAY_MS),
                ),
            },
            alert: AlertSettings {
                class_name: alert
                    .class_name
                    .unwrap_or_else(|| DEFAULT_CLASS.to_string()),
                min_confidence: alert.min_confidence.unwrap_or(DEFAULT_ALERT_CONFIDENCE),
                cooldown: Duration::from_secs(alert.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
                dedup_capacity: alert.dedup_capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY),
                path_convention,
            },
            smtp: file.smtp.map(SmtpConfig::from_file).transpose()?,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("VIGIL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("VIGIL_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(path);
        }
        if let Some(ms) = env_nonempty("VIGIL_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(parse_env("VIGIL_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(addr) = env_nonempty("VIGIL_API_ADDR") {
            self.api_addr = addr;
        }

        if let Some(broker) = env_nonempty("VIGIL_BROKER") {
            self.bus.broker = broker;
        }
        if let Some(channel) = env_nonempty("VIGIL_CHANNEL") {
            self.bus.channel = channel;
        }
        if let Some(user) = env_nonempty("VIGIL_MQTT_USERNAME") {
            self.bus.username = Some(user);
        }
        if let Some(password) = env_nonempty("VIGIL_MQTT_PASSWORD") {
            self.bus.password = Some(password);
        }
        if let Some(secs) = env_nonempty("VIGIL_RECONNECT_DELAY_SECS") {
            self.bus.reconnect_delay =
                Duration::from_secs(parse_env("VIGIL_RECONNECT_DELAY_SECS", &secs)?);
        }

        if let Some(sources) = env_nonempty("VIGIL_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.ingest.sources = parsed;
            }
        }
        if let Some(path) = env_nonempty("VIGIL_DETECTIONS") {
            self.ingest.detections = Some(PathBuf::from(path));
        }
        if let Some(classes) = env_nonempty("VIGIL_CLASSES") {
            self.ingest.classes = split_csv(&classes);
        }
        if let Some(conf) = env_nonempty("VIGIL_MIN_CONFIDENCE") {
            self.ingest.min_confidence = parse_env("VIGIL_MIN_CONFIDENCE", &conf)?;
        }

        if let Some(class) = env_nonempty("VIGIL_ALERT_CLASS") {
            self.alert.class_name = class;
        }
        if let Some(conf) = env_nonempty("VIGIL_ALERT_MIN_CONFIDENCE") {
            self.alert.min_confidence = parse_env("VIGIL_ALERT_MIN_CONFIDENCE", &conf)?;
        }
        if let Some(secs) = env_nonempty("VIGIL_ALERT_COOLDOWN_SECS") {
            self.alert.cooldown =
                Duration::from_secs(parse_env("VIGIL_ALERT_COOLDOWN_SECS", &secs)?);
        }
        if let Some(convention) = env_nonempty("VIGIL_PATH_CONVENTION") {
            self.alert.path_convention = convention.parse()?;
        }

        if let Some(server) = env_nonempty("VIGIL_SMTP_SERVER") {
            self.smtp.get_or_insert_with(SmtpConfig::empty).server = server;
        }
        if let Some(smtp) = self.smtp.as_mut() {
            if let Some(user) = env_nonempty("VIGIL_SMTP_USERNAME") {
                smtp.username = Some(user);
            }
            if let Some(password) = env_nonempty("VIGIL_SMTP_PASSWORD") {
                smtp.password = Some(password);
            }
            if let Some(from) = env_nonempty("VIGIL_SMTP_FROM") {
                smtp.from = from;
            }
            if let Some(to) = env_nonempty("VIGIL_SMTP_TO") {
                smtp.to = split_csv(&to);
            }
            if let Some(mode) = env_nonempty("VIGIL_SMTP_STARTTLS") {
                smtp.starttls = mode.parse()?;
            }
            if let Some(path) = env_nonempty("VIGIL_SMTP_TLS_CA_PATH") {
                smtp.tls_ca_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (name, value) in [
            ("ingest.min_confidence", self.ingest.min_confidence),
            ("alert.min_confidence", self.alert.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.bus.channel.trim().is_empty() {
            return Err(anyhow!("bus channel must not be empty"));
        }
        if self.alert.dedup_capacity == 0 {
            return Err(anyhow!("alert dedup capacity must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if matches!(self.bus.max_reconnect_attempts, Some(0)) {
            return Err(anyhow!("max reconnect attempts must be greater than zero when set"));
        }
        self.ingest.classes = self
            .ingest
            .classes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(smtp) = &self.smtp {
            if smtp.server.trim().is_empty() {
                return Err(anyhow!("smtp section needs a server address"));
            }
            if smtp.from.trim().is_empty() || smtp.to.is_empty() {
                return Err(anyhow!("smtp needs both a sender and at least one recipient"));
            }
        }
        Ok(())
    }
}

impl BusSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect_delay, self.max_reconnect_attempts)
    }

    /// Resolves the broker address and TLS material for one client.
    pub fn mqtt_settings(&self, client_id: &str) -> Result<MqttSettings> {
        let endpoint: MqttEndpoint = self.broker.parse()?;
        let tls = BrokerTls::from_files(
            self.tls_ca_path.as_deref(),
            self.tls_client_cert_path.as_deref(),
            self.tls_client_key_path.as_deref(),
        )?;
        let mut settings = MqttSettings::new(endpoint, client_id);
        settings.username = self.username.clone();
        settings.password = self.password.clone();
        settings.tls = tls;
        Ok(settings)
    }

    /// Connection factory for a [`crate::bus::BusLink`]; every call opens a
    /// fresh broker session.
    pub fn mqtt_factory(&self, client_id: &str) -> Result<BusFactory> {
        let settings = self.mqtt_settings(client_id)?;
        Ok(Box::new(move || {
            let bus = MqttBus::connect(&settings)?;
            Ok(Box::new(bus) as Box<dyn EventBus>)
        }))
    }
}

impl IngestSettings {
    /// Detection script for one source. A directory holds `<stem>.jsonl`
    /// per source, anything else is shared by every source.
    pub fn detections_for(&self, source: &str) -> Option<PathBuf> {
        let base = self.detections.as_ref()?;
        if base.is_dir() {
            let stem = derive_source_id(source);
            let stem = stem.strip_prefix("video_").unwrap_or(&stem);
            Some(base.join(format!("{}.jsonl", stem)))
        } else {
            Some(base.clone())
        }
    }
}

fn read_config_file(path: &Path) -> Result<VigilConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
