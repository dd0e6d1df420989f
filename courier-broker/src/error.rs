//! Error types for the courier-broker crate.
//!
//! Publishing and consuming fail in different ways and are reported to
//! different callers, so they get separate types:
//! - [`EnqueueError`] surfaces to whoever published the message
//! - [`BrokerError`] surfaces to the consumer side (receive, ack, nack)

use std::io;

use thiserror::Error;

use crate::types::{Destination, MessageId};

/// The broker refused or failed to accept a message.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// No queue is bound to the destination.
    #[error("No queue bound to {0}")]
    Unroutable(Destination),

    /// The broker is full.
    #[error("Broker capacity exceeded: {used}/{capacity} messages")]
    CapacityExceeded { used: usize, capacity: usize },

    /// The broker cannot be reached or has been shut down.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Writing the message failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The message envelope could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failures on the consuming side of the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Reading or moving a message failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored message could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The queue has never been bound.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Ack or nack for a message that is not currently held by a consumer.
    #[error("Message is not in flight: {0}")]
    NotInFlight(MessageId),

    /// Another live consumer holds the broker.
    #[error("Broker at {0} is already in use by another consumer")]
    Locked(String),

    /// Broker configuration or storage layout is invalid.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Envelope encoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Configuration and layout validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Path contains `..` components.
    #[error("Broker path cannot contain '..' components: {0}")]
    ParentDirectory(String),

    /// Path is relative.
    #[error("Broker path must be absolute: {0}")]
    NotAbsolute(String),

    /// Path is inside a protected system directory.
    #[error("Broker path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// Path exists but is not a directory.
    #[error("Broker path is not a directory: {0}")]
    NotDirectory(String),

    /// Queue name cannot be used as a storage key.
    #[error("Invalid queue name '{0}'")]
    InvalidQueueName(String),

    /// A memory broker lives and dies with one process, so nothing published
    /// to it from elsewhere would ever reach the daemon.
    #[error("A memory broker cannot be shared across processes; configure a File broker to publish")]
    ProcessLocal,
}

impl EnqueueError {
    /// Returns `true` if the broker may accept the same message later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::Unavailable(_) | Self::Io(_)
        )
    }
}

impl From<ValidationError> for EnqueueError {
    fn from(error: ValidationError) -> Self {
        Self::Unavailable(error.to_string())
    }
}
