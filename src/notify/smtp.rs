use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{Mailer, Notification};
use crate::snapshot::content_type_for;

const BASE64_LINE: usize = 76;

/// When the session is upgraded with STARTTLS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartTls {
    /// Upgrade, or give up on servers that do not offer it.
    #[default]
    Required,
    /// Upgrade when offered, otherwise continue in plain text.
    Opportunistic,
    /// Never upgrade.
    Disabled,
}

impl FromStr for StartTls {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "required" | "true" | "on" => Ok(Self::Required),
            "opportunistic" | "auto" => Ok(Self::Opportunistic),
            "disabled" | "false" | "off" | "none" => Ok(Self::Disabled),
            other => Err(anyhow!(
                "unknown STARTTLS mode '{}' (expected required, opportunistic or disabled)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    /// `host:port`
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub helo_name: String,
    pub timeout: Duration,
    pub starttls: StartTls,
    /// PEM CA bundle for the TLS session; `None` uses the bundled web roots.
    pub tls_ca: Option<Vec<u8>>,
    /// Send credentials over an unencrypted session.
    pub allow_plaintext_auth: bool,
}

impl SmtpSettings {
    pub fn new(server: impl Into<String>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            server: server.into(),
            username: None,
            password: None,
            from: from.into(),
            to,
            helo_name: "vigil.localdomain".to_string(),
            timeout: Duration::from_secs(10),
            starttls: StartTls::default(),
            tls_ca: None,
            allow_plaintext_auth: false,
        }
    }

    fn host(&self) -> &str {
        let host = match self.server.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.server,
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// SMTP submission client: one connection per message, upgraded with
/// STARTTLS according to [`SmtpSettings::starttls`].
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Result<Self> {
        if settings.to.is_empty() {
            return Err(anyhow!("SMTP mailer needs at least one recipient"));
        }
        if settings.from.trim().is_empty() {
            return Err(anyhow!("SMTP mailer needs a sender address"));
        }
        Ok(Self { settings })
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .settings
            .server
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve SMTP server {}", self.settings.server))?
            .next()
            .ok_or_else(|| anyhow!("SMTP server {} has no address", self.settings.server))?;
        let stream = TcpStream::connect_timeout(&addr, self.settings.timeout)
            .with_context(|| format!("failed to connect to SMTP server {}", addr))?;
        stream.set_read_timeout(Some(self.settings.timeout))?;
        stream.set_write_timeout(Some(self.settings.timeout))?;
        Ok(stream)
    }

    fn deliver(&self, message: &str) -> Result<()> {
        let mut session = SmtpSession::new(self.connect()?);
        session.expect(&[220])?;
        let capabilities = session.ehlo(&self.settings.helo_name)?;
        let offers_tls = capabilities
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case("STARTTLS"));

        match (self.settings.starttls, offers_tls) {
            (StartTls::Disabled, _) => self.transact(&mut session, message, false),
            (StartTls::Opportunistic, false) => {
                log::warn!(
                    "SMTP server {} does not offer STARTTLS, continuing without TLS",
                    self.settings.server
                );
                self.transact(&mut session, message, false)
            }
            (StartTls::Required, false) => {
                session.quit();
                Err(anyhow!(
                    "SMTP server {} does not offer STARTTLS",
                    self.settings.server
                ))
            }
            (_, true) => {
                let mut session = self.start_tls(session)?;
                session.ehlo(&self.settings.helo_name)?;
                self.transact(&mut session, message, true)
            }
        }
    }

    fn start_tls(
        &self,
        mut session: SmtpSession<TcpStream>,
    ) -> Result<SmtpSession<StreamOwned<ClientConnection, TcpStream>>> {
        session.command("STARTTLS", &[220])?;
        let stream = session.into_stream()?;
        let host = self.settings.host().to_string();
        let name = ServerName::try_from(host.clone())
            .map_err(|e| anyhow!("invalid SMTP server name '{}': {}", host, e))?;
        let config = client_tls_config(self.settings.tls_ca.as_deref())?;
        let conn = ClientConnection::new(Arc::new(config), name)
            .context("failed to start SMTP TLS session")?;
        let mut tls = StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .with_context(|| format!("SMTP TLS handshake with {} failed", host))?;
        }
        log::debug!("SMTP session with {} upgraded to TLS", self.settings.server);
        Ok(SmtpSession::new(tls))
    }

    fn transact<S: Read + Write>(
        &self,
        session: &mut SmtpSession<S>,
        message: &str,
        secure: bool,
    ) -> Result<()> {
        if let Some(user) = &self.settings.username {
            if !secure && !self.settings.allow_plaintext_auth {
                session.quit();
                return Err(anyhow!(
                    "refusing to send SMTP credentials to {} without TLS",
                    self.settings.server
                ));
            }
            let password = self.settings.password.as_deref().unwrap_or_default();
            let token = BASE64.encode(format!("\0{}\0{}", user, password));
            session.command(&format!("AUTH PLAIN {}", token), &[235])?;
        }
        session.command(&format!("MAIL FROM:<{}>", self.settings.from), &[250])?;
        for rcpt in &self.settings.to {
            session.command(&format!("RCPT TO:<{}>", rcpt), &[250, 251])?;
        }
        session.command("DATA", &[354])?;
        session.write_raw(dot_stuff(message).as_bytes())?;
        session.command(".", &[250])?;
        // The message is accepted at this point.
        session.quit();
        Ok(())
    }

    fn attachment_bytes(notification: &Notification) -> Option<(String, Vec<u8>)> {
        let path = notification.attachment.as_ref()?;
        let name = notification.attachment_name()?;
        match std::fs::read(path) {
            Ok(bytes) => Some((name, bytes)),
            Err(e) => {
                log::warn!(
                    "attachment {} unreadable, sending without it: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

impl Mailer for SmtpMailer {
    fn send(&mut self, notification: &Notification) -> Result<()> {
        let attachment = Self::attachment_bytes(notification);
        let message = build_message(&self.settings, notification, attachment.as_ref());
        self.deliver(&message)
    }
}

fn client_tls_config(ca_pem: Option<&[u8]>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(mut pem) => {
            for cert in rustls_pemfile::certs(&mut pem) {
                let cert = cert.context("failed to parse SMTP TLS CA certificate")?;
                roots
                    .add(cert)
                    .map_err(|e| anyhow!("failed to add SMTP TLS CA certificate: {}", e))?;
            }
            if roots.is_empty() {
                return Err(anyhow!("SMTP TLS CA bundle holds no certificates"));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let provider = rustls::crypto::ring::default_provider();
    Ok(ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("failed to configure SMTP TLS versions: {}", e))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Splits one reply line into code, continuation flag and text.
fn parse_reply_line(line: &str) -> Result<(u16, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(anyhow!("malformed SMTP reply '{}'", line));
    }
    let code = bytes[..3]
        .iter()
        .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));
    let more = bytes.get(3) == Some(&b'-');
    Ok((code, more, line.get(4..).unwrap_or("")))
}

struct SmtpSession<S> {
    wire: BufReader<S>,
}

impl<S: Read + Write> SmtpSession<S> {
    fn new(stream: S) -> Self {
        Self {
            wire: BufReader::new(stream),
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.wire.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    fn command(&mut self, line: &str, expected: &[u16]) -> Result<Vec<String>> {
        self.write_raw(format!("{}\r\n", line).as_bytes())?;
        let verb = line.split_whitespace().next().unwrap_or(line);
        self.expect(expected)
            .with_context(|| format!("SMTP {} rejected", verb))
    }

    /// Returns the advertised extensions, one keyword line each.
    fn ehlo(&mut self, name: &str) -> Result<Vec<String>> {
        let mut lines = self.command(&format!("EHLO {}", name), &[250])?;
        if !lines.is_empty() {
            // The first line is the server greeting.
            lines.remove(0);
        }
        Ok(lines)
    }

    fn quit(&mut self) {
        if let Err(e) = self.command("QUIT", &[221]) {
            log::debug!("SMTP QUIT failed: {}", e);
        }
    }

    /// Reads one (possibly multi-line) reply and checks its code.
    fn expect(&mut self, expected: &[u16]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let mut raw = Vec::new();
            if self.wire.read_until(b'\n', &mut raw)? == 0 {
                return Err(anyhow!("SMTP server closed the connection"));
            }
            let line = String::from_utf8_lossy(&raw);
            let (code, more, text) = parse_reply_line(line.trim_end())?;
            lines.push(text.to_string());
            if !more {
                if expected.contains(&code) {
                    return Ok(lines);
                }
                return Err(anyhow!("unexpected SMTP reply {} {}", code, lines.join(" ")));
            }
        }
    }

    /// Hands back the stream; the server must not have sent anything
    /// beyond the last reply.
    fn into_stream(self) -> Result<S> {
        if !self.wire.buffer().is_empty() {
            return Err(anyhow!("SMTP server sent data ahead of the TLS handshake"));
        }
        Ok(self.wire.into_inner())
    }
}

fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 8);
    for line in message.split("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

fn build_message(
    settings: &SmtpSettings,
    notification: &Notification,
    attachment: Option<&(String, Vec<u8>)>,
) -> String {
    let body = notification.body.replace("\r\n", "\n").replace('\n', "\r\n");
    let mut msg = String::new();
    msg.push_str(&format!("From: {}\r\n", settings.from));
    msg.push_str(&format!("To: {}\r\n", settings.to.join(", ")));
    msg.push_str(&format!("Subject: {}\r\n", notification.subject));
    msg.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    msg.push_str("MIME-Version: 1.0\r\n");

    let Some((name, bytes)) = attachment else {
        msg.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        msg.push_str(&body);
        return msg;
    };

    let boundary = format!(
        "vigil-{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    msg.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    ));
    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    msg.push_str(&body);
    msg.push_str("\r\n");
    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str(&format!(
        "Content-Type: {}; name=\"{}\"\r\n",
        content_type_for(name),
        name
    ));
    msg.push_str("Content-Transfer-Encoding: base64\r\n");
    msg.push_str(&format!(
        "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
        name
    ));
    let encoded = BASE64.encode(bytes);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        msg.push_str(&String::from_utf8_lossy(chunk));
        msg.push_str("\r\n");
    }
    msg.push_str(&format!("--{}--", boundary));
    msg
}
