use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One email waiting to be sent, together with its remaining retry budget.
///
/// The retry counter travels with the message, so consumers keep no state of
/// their own between attempts. An intent has no identity beyond its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryIntent {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Do not attempt delivery before this instant. `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
}

impl DeliveryIntent {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        retries_remaining: u32,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            scheduled_at: None,
            retries_remaining,
        }
    }

    #[must_use]
    pub const fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// The copy that is re-published after a transient failure: identical
    /// except for one less retry.
    #[must_use]
    pub fn decremented(&self) -> Self {
        Self {
            retries_remaining: self.retries_remaining.saturating_sub(1),
            ..self.clone()
        }
    }

    /// An exhausted intent is never attempted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.retries_remaining == 0
    }

    /// How long until the scheduled time, if it is still in the future.
    #[must_use]
    pub fn due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.scheduled_at
            .and_then(|at| (at - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero())
    }

    /// # Errors
    /// If the intent cannot be serialised
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// # Errors
    /// If `payload` is not a JSON-encoded intent
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
