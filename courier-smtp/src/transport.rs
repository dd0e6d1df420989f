//! The mail transport the dispatcher talks to.
//!
//! Every failure is mapped onto [`MailError`], a closed set of five kinds.
//! Only [`MailError::Authentication`] is permanent: retrying with the same
//! credentials cannot succeed. Everything else may clear up on its own and
//! is worth another attempt.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::internal;
use thiserror::Error;

use crate::{
    client::{AuthMechanism, Capabilities, ClientError, Response, SmtpClient},
    config::{SmtpConfig, TlsMode},
    message::Message,
};

/// Why a probe or send failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    /// The relay could not be reached, dropped the connection, timed out or
    /// refused service in its greeting.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The relay rejected our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The conversation broke down: malformed replies, EHLO or STARTTLS
    /// refused, TLS handshake failure, or a temporary AUTH failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The relay refused the sender, the recipient or the message.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// Anything else.
    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl MailError {
    /// Returns `true` if retrying cannot help.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Returns `true` if a later attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !self.is_permanent()
    }

    /// Short name of the kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Authentication(_) => "authentication",
            Self::Protocol(_) => "protocol",
            Self::Rejected(_) => "rejected",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

/// Convert a client failure that happened outside any reply classification.
impl From<ClientError> for MailError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(e) => Self::Connection(format!("I/O error: {e}")),
            ClientError::ConnectionClosed => {
                Self::Connection("Connection closed unexpectedly".to_string())
            }
            ClientError::TlsError(msg) => Self::Protocol(format!("TLS failure: {msg}")),
            ClientError::ParseError(msg) => Self::Protocol(format!("Malformed reply: {msg}")),
            ClientError::Utf8Error(e) => Self::Protocol(format!("Reply is not UTF-8: {e}")),
            ClientError::UnexpectedResponse { code, message } => {
                Self::Unexpected(format!("Unexpected reply: {code} {message}"))
            }
        }
    }
}

/// A message ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Something that can submit mail.
#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Check that the relay is reachable and accepts our credentials,
    /// without sending anything.
    ///
    /// # Errors
    /// The classified reason the relay is not usable
    async fn probe(&self) -> Result<(), MailError>;

    /// Submit one message.
    ///
    /// # Errors
    /// The classified reason the message was not accepted
    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError>;
}

/// [`MailTransport`] over SMTP to a single configured relay.
///
/// Each call opens a fresh session: connect, greeting, EHLO (falling back to
/// HELO), STARTTLS per [`TlsMode`], AUTH when credentials are configured.
#[derive(Debug, Clone)]
pub struct SmtpMailTransport {
    config: SmtpConfig,
}

impl SmtpMailTransport {
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    async fn timed<T, F>(limit: Duration, stage: &str, fut: F) -> Result<T, MailError>
    where
        F: Future<Output = crate::client::Result<T>> + Send,
    {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| MailError::Connection(format!("{stage} timed out after {limit:?}")))?
            .map_err(MailError::from)
    }

    /// Connect, read the greeting and introduce ourselves.
    async fn greet(&self) -> Result<(SmtpClient, Capabilities), MailError> {
        let address = self.config.address();
        let timeouts = &self.config.timeouts;

        let mut client = tokio::time::timeout(
            timeouts.connect(),
            SmtpClient::connect(&address, self.config.host.clone()),
        )
        .await
        .map_err(|_| {
            MailError::Connection(format!(
                "Connecting to {address} timed out after {:?}",
                timeouts.connect()
            ))
        })?
        .map_err(|e| MailError::Connection(format!("Failed to connect to {address}: {e}")))?
        .accept_invalid_certs(self.config.accept_invalid_certs);

        let greeting = Self::timed(timeouts.command(), "Greeting", client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(MailError::Connection(format!(
                "{address} refused service: {} {}",
                greeting.code,
                greeting.message()
            )));
        }

        let capabilities = self.introduce(&mut client).await?;
        Ok((client, capabilities))
    }

    /// EHLO, or HELO for servers that do not speak ESMTP.
    async fn introduce(&self, client: &mut SmtpClient) -> Result<Capabilities, MailError> {
        let helo_name = &self.config.helo_name;
        let limit = self.config.timeouts.command();

        let ehlo = Self::timed(limit, "EHLO", client.ehlo(helo_name)).await?;
        if ehlo.is_success() {
            return Ok(Capabilities::from_ehlo(&ehlo));
        }

        let helo = Self::timed(limit, "HELO", client.helo(helo_name)).await?;
        if helo.is_success() {
            return Ok(Capabilities::default());
        }

        Err(MailError::Protocol(format!(
            "Server rejected EHLO ({}) and HELO ({} {})",
            ehlo.code,
            helo.code,
            helo.message()
        )))
    }

    async fn upgrade(
        &self,
        client: &mut SmtpClient,
        capabilities: &Capabilities,
    ) -> Result<Capabilities, MailError> {
        if !capabilities.supports("STARTTLS") {
            return Err(MailError::Protocol(
                "Server does not offer STARTTLS".to_string(),
            ));
        }

        let limit = self.config.timeouts.command();
        let response = Self::timed(limit, "STARTTLS", client.starttls()).await?;
        if !response.is_success() {
            return Err(MailError::Protocol(format!(
                "Server rejected STARTTLS: {} {}",
                response.code,
                response.message()
            )));
        }

        // RFC 3207: forget everything learned before the handshake
        self.introduce(client).await
    }

    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        capabilities: &Capabilities,
    ) -> Result<(), MailError> {
        let Some(credentials) = &self.config.credentials else {
            return Ok(());
        };

        let mechanism = AuthMechanism::select(capabilities);
        let response = Self::timed(
            self.config.timeouts.command(),
            "AUTH",
            client.authenticate(mechanism, &credentials.username, &credentials.password),
        )
        .await?;

        classify_auth(mechanism, &response)
    }

    /// Everything up to the point where MAIL FROM may be sent.
    async fn open(&self) -> Result<SmtpClient, MailError> {
        let mut attempt_tls = self.config.tls != TlsMode::None;

        loop {
            let (mut client, capabilities) = self.greet().await?;

            let wants_tls = match self.config.tls {
                TlsMode::None => false,
                TlsMode::StartTls => true,
                TlsMode::Opportunistic => attempt_tls && capabilities.supports("STARTTLS"),
            };

            let capabilities = if wants_tls {
                match self.upgrade(&mut client, &capabilities).await {
                    Ok(capabilities) => capabilities,
                    Err(err) if self.config.tls == TlsMode::Opportunistic => {
                        internal!(
                            level = INFO,
                            "STARTTLS with {} failed ({err}), reconnecting without TLS",
                            self.config.host
                        );
                        attempt_tls = false;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            } else {
                capabilities
            };

            self.authenticate(&mut client, &capabilities).await?;
            return Ok(client);
        }
    }

    async fn quit(&self, client: &mut SmtpClient) {
        let limit = self.config.timeouts.quit();
        match tokio::time::timeout(limit, client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                internal!(level = DEBUG, "QUIT to {} failed: {e}", self.config.host);
            }
            Err(_) => {
                internal!(
                    level = DEBUG,
                    "QUIT to {} timed out after {limit:?}",
                    self.config.host
                );
            }
        }
    }

    fn message_id(&self) -> String {
        format!("{}@{}", ulid::Ulid::new(), self.config.helo_name)
    }
}

fn classify_auth(mechanism: AuthMechanism, response: &Response) -> Result<(), MailError> {
    let detail = || format!("AUTH {mechanism}: {} {}", response.code, response.message());

    if response.is_success() {
        Ok(())
    } else if response.is_permanent_error() {
        Err(MailError::Authentication(detail()))
    } else if response.is_temporary_error() {
        Err(MailError::Protocol(detail()))
    } else {
        Err(MailError::Unexpected(detail()))
    }
}

fn rejected(stage: &str, response: &Response) -> MailError {
    MailError::Rejected(format!(
        "Server rejected {stage}: {} {}",
        response.code,
        response.message()
    ))
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn probe(&self) -> Result<(), MailError> {
        let mut client = self.open().await?;
        self.quit(&mut client).await;

        internal!(level = DEBUG, "Probe of {} succeeded", self.config.address());
        Ok(())
    }

    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError> {
        let timeouts = &self.config.timeouts;
        let mut client = self.open().await?;

        let response = Self::timed(timeouts.command(), "MAIL FROM", client.mail_from(&mail.from)).await?;
        if !response.is_success() {
            // 530 Authentication required
            if response.code == 530 {
                return Err(MailError::Authentication(format!(
                    "MAIL FROM: {} {}",
                    response.code,
                    response.message()
                )));
            }
            return Err(rejected("MAIL FROM", &response));
        }

        let response = Self::timed(timeouts.command(), "RCPT TO", client.rcpt_to(&mail.to)).await?;
        if !response.is_success() {
            return Err(rejected(&format!("RCPT TO <{}>", mail.to), &response));
        }

        let response = Self::timed(timeouts.command(), "DATA", client.data()).await?;
        if response.code != 354 {
            return Err(rejected("DATA", &response));
        }

        let message_id = self.message_id();
        let content = Message {
            from: &mail.from,
            to: &mail.to,
            subject: &mail.subject,
            body: &mail.body,
            date: Utc::now(),
            message_id: &message_id,
        }
        .render();

        let response = Self::timed(timeouts.data(), "Message data", client.send_data(&content)).await?;
        if !response.is_success() {
            return Err(rejected("message data", &response));
        }

        // The relay owns the message now; a failed QUIT changes nothing.
        self.quit(&mut client).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authentication_is_permanent() {
        assert!(MailError::Authentication(String::new()).is_permanent());

        for transient in [
            MailError::Connection(String::new()),
            MailError::Protocol(String::new()),
            MailError::Rejected(String::new()),
            MailError::Unexpected(String::new()),
        ] {
            assert!(transient.is_transient(), "{transient:?}");
        }
    }

    #[test]
    fn test_client_error_classification() {
        assert!(matches!(
            MailError::from(ClientError::ConnectionClosed),
            MailError::Connection(_)
        ));
        assert!(matches!(
            MailError::from(ClientError::Io(std::io::Error::other("reset"))),
            MailError::Connection(_)
        ));
        assert!(matches!(
            MailError::from(ClientError::TlsError("handshake".to_string())),
            MailError::Protocol(_)
        ));
        assert!(matches!(
            MailError::from(ClientError::ParseError("junk".to_string())),
            MailError::Protocol(_)
        ));
        assert!(matches!(
            MailError::from(ClientError::UnexpectedResponse {
                code: 399,
                message: String::new()
            }),
            MailError::Unexpected(_)
        ));
    }

    #[test]
    fn test_auth_reply_classification() {
        let ok = Response::new(235, vec!["Authenticated".to_string()]);
        assert_eq!(classify_auth(AuthMechanism::Plain, &ok), Ok(()));

        let bad = Response::new(535, vec!["Bad credentials".to_string()]);
        assert!(matches!(
            classify_auth(AuthMechanism::Plain, &bad),
            Err(MailError::Authentication(_))
        ));

        let later = Response::new(454, vec!["Try again later".to_string()]);
        assert!(matches!(
            classify_auth(AuthMechanism::Login, &later),
            Err(MailError::Protocol(_))
        ));
    }
}
