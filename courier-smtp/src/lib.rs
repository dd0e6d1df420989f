//! SMTP submission for courier
//!
//! [`SmtpMailTransport`] submits one plain-text message per call to a single
//! configured relay and reports failures through the closed [`MailError`]
//! set that the dispatch layer makes its retry decisions on.

pub mod client;
pub mod config;
pub mod message;
pub mod transport;

pub use config::{Credentials, SmtpConfig, SmtpTimeouts, TlsMode};
pub use transport::{MailError, MailTransport, OutboundMail, SmtpMailTransport};
