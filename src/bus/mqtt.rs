//! MQTT v5 bus backend.
//!
//! Every channel maps to one MQTT topic. Publishes use QoS 0 without retain,
//! so the broker behaves as a plain fan-out hub: nothing is persisted or
//! replayed for late subscribers.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event as MqttEvent, Incoming, MqttOptions};
use rumqttc::Transport;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EventBus, Subscription};

type Subscribers = Arc<Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>>;

/// How the broker connection is carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerScheme {
    Plain,
    Tls,
}

impl BrokerScheme {
    fn from_prefix(prefix: &str) -> Result<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(Self::Plain),
            "mqtts" | "ssl" => Ok(Self::Tls),
            other => Err(anyhow!("unsupported broker scheme '{}'", other)),
        }
    }
}

/// Broker address. `host:port` without a scheme is plain TCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub scheme: BrokerScheme,
}

impl MqttEndpoint {
    pub fn uses_tls(&self) -> bool {
        self.scheme == BrokerScheme::Tls
    }
}

impl FromStr for MqttEndpoint {
    type Err = anyhow::Error;

    /// Accepts `host:port`, `[v6]:port`, and either form behind `mqtt://`,
    /// `tcp://`, `mqtts://` or `ssl://`.
    fn from_str(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let (scheme, authority) = match addr.split_once("://") {
            Some((prefix, rest)) => (BrokerScheme::from_prefix(prefix)?, rest),
            None => (BrokerScheme::Plain, addr),
        };
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            bracketed
                .split_once("]:")
                .ok_or_else(|| anyhow!("broker address '{}' needs [host]:port", addr))?
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("broker address '{}' has no port", addr))?
        };
        if host.is_empty() {
            return Err(anyhow!("broker address '{}' has no host", addr));
        }
        let port = port
            .parse()
            .with_context(|| format!("broker address '{}' has an invalid port", addr))?;
        Ok(Self {
            host: host.to_string(),
            port,
            scheme,
        })
    }
}

/// PEM client certificate and key presented for mutual TLS.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Trust and identity material for `mqtts://` brokers.
#[derive(Clone, Debug, Default)]
pub struct BrokerTls {
    /// PEM CA bundle; `None` trusts the bundled web roots.
    pub ca: Option<Vec<u8>>,
    pub identity: Option<ClientIdentity>,
}

impl BrokerTls {
    /// Reads the configured files. Certificate and key come as a pair.
    pub fn from_files(
        ca: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self> {
        let read = |what: &str, path: &Path| {
            std::fs::read(path)
                .with_context(|| format!("failed to read broker {} '{}'", what, path.display()))
        };
        let identity = match (client_cert, client_key) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(ClientIdentity {
                cert: read("client certificate", cert)?,
                key: read("client key", key)?,
            }),
            _ => {
                return Err(anyhow!(
                    "broker client certificate and key must be configured together"
                ))
            }
        };
        Ok(Self {
            ca: ca.map(|path| read("CA", path)).transpose()?,
            identity,
        })
    }

    fn is_empty(&self) -> bool {
        self.ca.is_none() && self.identity.is_none()
    }

    fn transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        match endpoint.scheme {
            BrokerScheme::Plain if self.is_empty() => Ok(Transport::tcp()),
            BrokerScheme::Plain => Err(anyhow!(
                "broker TLS material is configured but {}:{} is not an mqtts:// address",
                endpoint.host,
                endpoint.port
            )),
            BrokerScheme::Tls if self.is_empty() => Ok(Transport::tls_with_default_config()),
            BrokerScheme::Tls => {
                let ca = self.ca.clone().ok_or_else(|| {
                    anyhow!("a broker CA is required alongside a client certificate")
                })?;
                let identity = self
                    .identity
                    .as_ref()
                    .map(|id| (id.cert.clone(), id.key.clone()));
                Ok(Transport::tls(ca, identity, None))
            }
        }
    }
}

/// Connection settings for [`MqttBus::connect`].
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: BrokerTls,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl MqttSettings {
    pub fn new(endpoint: MqttEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            client_id: client_id.into(),
            username: None,
            password: None,
            tls: BrokerTls::default(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct MqttBus {
    client: Client,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
}

impl MqttBus {
    /// Connects and waits for the broker's ConnAck.
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = &settings.endpoint;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_transport(settings.tls.transport(endpoint)?);

        let (client, mut connection) = Client::new(options, 10);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let thread_subs = subscribers.clone();
        let thread_connected = connected.clone();
        std::thread::Builder::new()
            .name(format!("mqtt-{}", settings.client_id))
            .spawn(move || {
                let mut ready_tx = Some(ready_tx);
                for notification in connection.iter() {
                    match notification {
                        Ok(MqttEvent::Incoming(Incoming::ConnAck(..))) => {
                            thread_connected.store(true, Ordering::SeqCst);
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Ok(MqttEvent::Incoming(Incoming::Publish(publish))) => {
                            let topic = match std::str::from_utf8(&publish.topic) {
                                Ok(topic) => topic.to_string(),
                                Err(e) => {
                                    log::warn!("Skipping publish with invalid topic: {}", e);
                                    continue;
                                }
                            };
                            if let Ok(mut subs) = thread_subs.lock() {
                                if let Some(senders) = subs.get_mut(&topic) {
                                    senders.retain(|tx| tx.send(publish.payload.to_vec()).is_ok());
                                }
                            }
                        }
                        Ok(MqttEvent::Incoming(Incoming::Disconnect(..))) => {
                            log::warn!("MQTT broker closed the session");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("MQTT connection error: {}", e);
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(e.to_string()));
                            }
                            break;
                        }
                    }
                }
                thread_connected.store(false, Ordering::SeqCst);
                // Dropping the senders marks every subscription disconnected.
                if let Ok(mut subs) = thread_subs.lock() {
                    subs.clear();
                }
            })
            .context("failed to spawn MQTT event loop")?;

        match ready_rx.recv_timeout(settings.connect_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(anyhow!(
                    "MQTT connect to {}:{} failed: {}",
                    endpoint.host,
                    endpoint.port,
                    e
                ))
            }
            Err(_) => {
                let _ = client.disconnect();
                return Err(anyhow!(
                    "MQTT connect to {}:{} timed out after {:?}",
                    endpoint.host,
                    endpoint.port,
                    settings.connect_timeout
                ));
            }
        }

        log::info!(
            "Connected to MQTT broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.uses_tls(),
            settings.username.is_some()
        );
        Ok(Self {
            client,
            subscribers,
            connected,
        })
    }
}

impl EventBus for MqttBus {
    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("MQTT connection lost"));
        }
        self.client
            .publish(channel, QoS::AtMostOnce, false, payload.to_vec())
            .with_context(|| format!("MQTT publish to '{}' failed", channel))?;
        Ok(())
    }

    fn subscribe(&mut self, channel: &str) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(anyhow!("MQTT connection lost"));
        }
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("MQTT subscriber table poisoned"))?
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        self.client
            .subscribe(channel, QoS::AtMostOnce)
            .with_context(|| format!("MQTT subscribe to '{}' failed", channel))?;
        log::info!("Subscribed to {}", channel);
        Ok(Subscription::new(channel, rx))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        let _ = self.client.disconnect();
    }
}
