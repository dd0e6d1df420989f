use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileBroker, MemoryBroker},
    error::{BrokerError, ValidationError},
    r#trait::BrokerTransport,
};

/// Configuration for the broker
///
/// Both variants wrap a struct, so the configuration file enables RON's
/// `unwrap_variant_newtypes` extension.
///
/// File-backed broker in RON config:
/// ```ron
/// #![enable(unwrap_variant_newtypes)]
/// Courier (
///     broker: File(
///         path: "/var/spool/courier",
///         poll_interval_ms: 250,
///     ),
/// )
/// ```
///
/// Memory-backed broker with a capacity limit:
/// ```ron
/// #![enable(unwrap_variant_newtypes)]
/// Courier (
///     broker: Memory(
///         capacity: 1000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum BrokerConfig {
    /// Durable spool directory
    File(FileBroker),
    /// In-process queues, lost on restart
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed broker
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to hold (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::File(FileBroker::default())
    }
}

impl BrokerConfig {
    /// Filesystem path for file-backed brokers
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(broker) => Some(broker.path()),
            Self::Memory(_) => None,
        }
    }

    /// Convert the configuration into a broker for a process that only
    /// publishes. Existing messages are left alone.
    ///
    /// # Errors
    /// [`ValidationError::ProcessLocal`] for a memory broker, whose messages
    /// could never leave this process
    pub fn into_broker(self) -> Result<Arc<dyn BrokerTransport>, BrokerError> {
        match self {
            Self::File(broker) => Ok(Arc::new(broker)),
            Self::Memory(_) => Err(ValidationError::ProcessLocal.into()),
        }
    }

    /// Convert the configuration into a broker, running crash recovery first.
    ///
    /// This is what the consuming daemon uses. A file broker is locked to
    /// this process for as long as it lives.
    ///
    /// # Errors
    /// If the file broker cannot be initialised or another consumer holds it
    pub fn into_recovered_broker(self) -> Result<Arc<dyn BrokerTransport>, BrokerError> {
        match self {
            Self::File(broker) => {
                broker.init()?;
                Ok(Arc::new(broker))
            }
            Self::Memory(config) => Ok(Arc::new(config.build())),
        }
    }
}

impl MemoryConfig {
    fn build(&self) -> MemoryBroker {
        self.capacity
            .map_or_else(MemoryBroker::new, MemoryBroker::with_capacity)
    }
}
