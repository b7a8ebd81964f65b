use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;

use super::EventHandler;
use crate::event::InboundEvent;
use crate::notify::{Mailer, Notification};

pub const ALERT_SUBJECT: &str = "WARNING: Security Alert";
pub const NO_TRACK_PLACEHOLDER: &str = "no_id";

/// Which details trigger an alert: matching class and confidence strictly
/// above the threshold.
#[derive(Clone, Debug)]
pub struct AlertPolicy {
    pub class_name: String,
    pub min_confidence: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            class_name: "person".to_string(),
            min_confidence: 0.8,
        }
    }
}

impl AlertPolicy {
    /// First detail that triggers, with its confidence. Details are read
    /// leniently so a partially malformed list can still alert.
    pub fn first_match<'a>(
        &self,
        details: &'a serde_json::Value,
    ) -> Option<(&'a serde_json::Value, f64)> {
        details.as_array()?.iter().find_map(|item| {
            let class = item.get("class_name")?.as_str()?;
            let confidence = item.get("confidence")?.as_f64()?;
            (class == self.class_name && confidence > self.min_confidence)
                .then_some((item, confidence))
        })
    }
}

/// Keys of alerts already sent. Cleared completely once it grows past
/// `capacity`.
#[derive(Clone, Debug)]
pub struct DedupCache {
    keys: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            capacity,
        }
    }

    /// Returns `true` when `key` has not been seen since the last reset.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        if !self.keys.insert(key.to_string()) {
            return false;
        }
        if self.keys.len() > self.capacity {
            self.keys.clear();
            log::info!("Cleared alert cache");
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// `source|timestamp|track`, with [`NO_TRACK_PLACEHOLDER`] for untracked details.
pub fn dedup_key(source_id: &str, timestamp: &str, track_id: Option<i64>) -> String {
    match track_id {
        Some(id) => format!("{}|{}|{}", source_id, timestamp, id),
        None => format!("{}|{}|{}", source_id, timestamp, NO_TRACK_PLACEHOLDER),
    }
}

/// Filesystem layout the alert consumer runs under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathConvention {
    /// `C:\dir\file`
    Windows,
    /// `/mnt/c/dir/file`
    Wsl,
}

impl PathConvention {
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Wsl
        }
    }
}

impl std::str::FromStr for PathConvention {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "host" => Ok(Self::host()),
            "windows" | "win" => Ok(Self::Windows),
            "wsl" | "posix" | "unix" => Ok(Self::Wsl),
            other => Err(anyhow::anyhow!(
                "unknown path convention '{}': expected 'auto', 'windows' or 'wsl'",
                other
            )),
        }
    }
}

/// `/mnt/e/a/b.jpg` to `E:\a\b.jpg`. `None` unless the path is under a
/// single-letter `/mnt` drive.
pub fn to_windows_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/mnt/")?;
    let (drive, tail) = rest.split_once('/').unwrap_or((rest, ""));
    let letter = single_drive_letter(drive)?;
    let tail: Vec<&str> = tail.split('/').collect();
    Some(format!("{}:\\{}", letter.to_ascii_uppercase(), tail.join("\\")))
}

/// `E:\a\b.jpg` to `/mnt/e/a/b.jpg`. `None` unless the path starts with a
/// drive letter followed by `:\`.
pub fn to_wsl_path(path: &str) -> Option<String> {
    let mut chars = path.chars();
    let letter = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    let tail = chars.as_str().strip_prefix(":\\")?;
    if tail.is_empty() {
        return None;
    }
    Some(format!(
        "/mnt/{}/{}",
        letter.to_ascii_lowercase(),
        tail.replace('\\', "/")
    ))
}

fn single_drive_letter(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let c = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    chars.next().is_none().then_some(c)
}

/// Rewrites a snapshot path into `target`'s convention. Paths already in
/// that convention, and paths in neither, pass through unchanged.
pub fn normalize_snapshot_path(path: &str, target: PathConvention) -> String {
    let converted = match target {
        PathConvention::Windows => to_windows_path(path),
        PathConvention::Wsl => to_wsl_path(path),
    };
    converted.unwrap_or_else(|| path.to_string())
}

/// Notification body for a triggering detail.
pub fn alert_body(class_name: &str, source_id: &str, timestamp: &str, confidence: f64) -> String {
    format!(
        "Security Alert Detected!\n\n\
         Object: {}\n\
         Camera ID: {}\n\
         Time: {}\n\
         Confidence Level: {:.2}\n\n\
         Please check the camera feed immediately.",
        capitalize(class_name),
        source_id,
        timestamp,
        confidence
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertOutcome {
    NotTriggered,
    Suppressed { key: String },
    Sent { key: String },
    DeliveryFailed { key: String },
}

/// Turns person detections into deduplicated notifications.
pub struct AlertConsumer<M: Mailer> {
    policy: AlertPolicy,
    dedup: DedupCache,
    mailer: M,
    convention: PathConvention,
}

impl<M: Mailer> AlertConsumer<M> {
    pub fn new(policy: AlertPolicy, dedup: DedupCache, mailer: M, convention: PathConvention) -> Self {
        Self {
            policy,
            dedup,
            mailer,
            convention,
        }
    }

    pub fn mailer(&self) -> &M {
        &self.mailer
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn process(&mut self, ev: &InboundEvent) -> AlertOutcome {
        let Some((detail, confidence)) = self.policy.first_match(&ev.object_details) else {
            return AlertOutcome::NotTriggered;
        };
        let track_id = detail.get("track_id").and_then(|t| t.as_i64());
        let key = dedup_key(&ev.source_id, &ev.timestamp, track_id);
        if !self.dedup.check_and_insert(&key) {
            log::info!("Alert already sent for key: {}, skipping", key);
            return AlertOutcome::Suppressed { key };
        }

        let attachment = ev.snapshot_path.as_deref().map(|p| {
            let normalized = normalize_snapshot_path(p, self.convention);
            if normalized != p {
                log::info!("Converted snapshot path {} to {}", p, normalized);
            }
            PathBuf::from(normalized)
        });
        let notification = Notification {
            subject: ALERT_SUBJECT.to_string(),
            body: alert_body(&self.policy.class_name, &ev.source_id, &ev.timestamp, confidence),
            attachment,
        };
        log::warn!("ALERT {}: {} at {} ({:.2})", key, self.policy.class_name, ev.source_id, confidence);

        match self.mailer.send(&notification) {
            Ok(()) => AlertOutcome::Sent { key },
            Err(e) => {
                log::error!("alert delivery failed for {}: {:#}", key, e);
                AlertOutcome::DeliveryFailed { key }
            }
        }
    }
}

impl<M: Mailer> EventHandler for AlertConsumer<M> {
    fn name(&self) -> &str {
        "alert"
    }

    fn handle(&mut self, payload: &[u8]) -> Result<()> {
        let ev = InboundEvent::from_payload(payload)?;
        self.process(&ev);
        Ok(())
    }
}
