//! Human notification delivery.

mod smtp;

use anyhow::Result;
use std::path::PathBuf;

pub use smtp::{SmtpMailer, SmtpSettings, StartTls};

/// A message for the people watching the cameras.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    /// Image to attach, already in the local path convention.
    pub attachment: Option<PathBuf>,
}

impl Notification {
    /// File name the attachment is sent under.
    pub fn attachment_name(&self) -> Option<String> {
        self.attachment
            .as_ref()
            .map(|p| artifact_name(&p.to_string_lossy()))
    }
}

pub trait Mailer: Send {
    fn send(&mut self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Clone, Debug, Default)]
pub struct LogMailer {
    sent: usize,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl Mailer for LogMailer {
    fn send(&mut self, notification: &Notification) -> Result<()> {
        self.sent += 1;
        log::info!(
            "notification (not delivered, no SMTP configured): {} | {} | attachment: {}",
            notification.subject,
            notification.body.replace('\n', " / "),
            notification
                .attachment
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(())
    }
}

/// Last path component, splitting on both `/` and `\`.
pub fn artifact_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}
