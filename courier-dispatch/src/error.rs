use courier_broker::{BrokerError, EnqueueError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The broker refused a publish or a requeue.
    #[error("Failed to enqueue delivery intent: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Invalid delivery intent payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Deferred scheduler has stopped")]
    SchedulerClosed,
}

impl DispatchError {
    /// Returns `true` if the failure may clear up on its own
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Enqueue(e) => e.is_transient(),
            Self::Broker(_) => true,
            Self::Payload(_) | Self::SchedulerClosed => false,
        }
    }
}
