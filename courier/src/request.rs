//! Validation of send requests before they reach the publisher.

use chrono::{DateTime, Utc};
use courier_broker::MessageId;
use courier_dispatch::{DispatchError, Publisher};
use mailparse::MailAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("Invalid recipient address '{0}'")]
    InvalidAddress(String),

    #[error("Exactly one recipient is required, got '{0}'")]
    NotSingleRecipient(String),

    #[error("Invalid send time '{0}': expected RFC 3339, e.g. 2026-03-01T10:00:00Z")]
    InvalidTime(String),
}

/// A request that has passed boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SendRequest {
    /// Validate raw request fields.
    ///
    /// # Errors
    /// - Any field is blank
    /// - `to` is not exactly one syntactically valid address
    /// - `at` is given but is not an RFC 3339 timestamp
    pub fn parse(to: &str, subject: &str, body: &str, at: Option<&str>) -> Result<Self, RequestError> {
        for (name, value) in [("Recipient", to), ("Subject", subject), ("Body", body)] {
            if value.trim().is_empty() {
                return Err(RequestError::Blank(name));
            }
        }

        let recipient = single_address(to.trim())?;

        let scheduled_at = at
            .map(|at| {
                DateTime::parse_from_rfc3339(at.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| RequestError::InvalidTime(at.to_string()))
            })
            .transpose()?;

        Ok(Self {
            recipient,
            subject: subject.to_string(),
            body: body.to_string(),
            scheduled_at,
        })
    }

    /// Hand the request to the publisher, now or at its scheduled time.
    ///
    /// # Errors
    /// If the broker rejects the enqueue
    pub async fn submit(self, publisher: &Publisher) -> Result<MessageId, DispatchError> {
        match self.scheduled_at {
            Some(at) => {
                publisher
                    .publish_later(self.recipient, self.subject, self.body, at)
                    .await
            }
            None => {
                publisher
                    .publish_now(self.recipient, self.subject, self.body)
                    .await
            }
        }
    }
}

fn single_address(raw: &str) -> Result<String, RequestError> {
    let parsed =
        mailparse::addrparse(raw).map_err(|_| RequestError::InvalidAddress(raw.to_string()))?;

    match parsed.iter().collect::<Vec<_>>().as_slice() {
        [MailAddr::Single(info)] if is_plausible(&info.addr) => Ok(info.addr.clone()),
        [MailAddr::Single(_)] => Err(RequestError::InvalidAddress(raw.to_string())),
        _ => Err(RequestError::NotSingleRecipient(raw.to_string())),
    }
}

/// `local@domain` with both parts non-empty.
fn is_plausible(addr: &str) -> bool {
    addr.split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !domain.contains('@'))
}
