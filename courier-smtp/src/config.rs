use std::time::Duration;

use serde::Deserialize;

/// How the transport secures the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsMode {
    /// Never send STARTTLS.
    None,
    /// STARTTLS is mandatory; a relay that does not offer it, or a failed
    /// handshake, fails the attempt.
    #[default]
    StartTls,
    /// Use STARTTLS when offered. If it fails, reconnect and continue in
    /// plaintext (RFC 3207 section 4.1).
    Opportunistic,
}

/// SMTP AUTH credentials.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Timeouts applied to each stage of an SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SmtpTimeouts {
    /// Establishing the TCP connection
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Any single command: greeting, EHLO, STARTTLS, AUTH, MAIL, RCPT, DATA
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Transmitting the message content and waiting for the final reply
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// QUIT after the message has been accepted
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            command_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

/// The relay every message is submitted to.
///
/// ```ron
/// smtp: (
///     host: "smtp.example.com",
///     port: 587,
///     tls: StartTls,
///     credentials: Some((username: "mailer", password: "secret")),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name announced in EHLO/HELO and used as the Message-ID domain
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub tls: TlsMode,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Skip certificate verification. For test relays only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

const fn default_port() -> u16 {
    587
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

impl SmtpConfig {
    /// A config for `host` with every other field at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            helo_name: default_helo_name(),
            tls: TlsMode::default(),
            credentials: None,
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
        }
    }

    /// `host:port`, as handed to the TCP connect.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
