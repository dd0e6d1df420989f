use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Identifier for a brokered message
///
/// A ULID assigned at enqueue time. It names the message on disk for the file
/// broker and keys the in-flight table for the memory broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    /// Parse a message ID from a queue file name.
    ///
    /// Accepts both ready files (`00000001700000000000-01ARZ3NDEKTSV4RRFFQ69G5FAV.msg`)
    /// and claimed files (`01ARZ3NDEKTSV4RRFFQ69G5FAV.inflight`). Anything with a
    /// path separator or a traversal pattern is rejected outright.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = if let Some(stem) = filename.strip_suffix(".msg") {
            let (available_at, id) = stem.split_once('-')?;
            if available_at.len() != 20 || !available_at.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            id
        } else {
            filename.strip_suffix(".inflight")?
        };

        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self { id })
    }

    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Where a publisher sends a message: an exchange plus a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Binding of a destination to the queue that consumers read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default = "defaults::exchange")]
    pub exchange: String,
    #[serde(default = "defaults::routing_key")]
    pub routing_key: String,
    #[serde(default = "defaults::queue")]
    pub queue: String,
}

mod defaults {
    pub fn exchange() -> String {
        "mail".to_string()
    }

    pub fn routing_key() -> String {
        "mail.send".to_string()
    }

    pub fn queue() -> String {
        "mail.outbound".to_string()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: defaults::exchange(),
            routing_key: defaults::routing_key(),
            queue: defaults::queue(),
        }
    }
}

impl Topology {
    #[must_use]
    pub fn destination(&self) -> Destination {
        Destination::new(&self.exchange, &self.routing_key)
    }
}

/// Per-message options supplied on enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// The broker must keep the message across restarts.
    pub persistent: bool,
    /// The message is not handed to a consumer before this much time has passed.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Persistent, available immediately.
    #[must_use]
    pub const fn persistent() -> Self {
        Self {
            persistent: true,
            delay: None,
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Token a consumer presents to acknowledge or reject a message it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    queue: String,
    id: MessageId,
}

impl AckHandle {
    pub fn new(queue: impl Into<String>, id: MessageId) -> Self {
        Self {
            queue: queue.into(),
            id,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// Set when the message has been handed out before and came back unacknowledged.
    pub redelivered: bool,
    pub handle: AckHandle,
}

/// What a broker stores for each message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub enqueued_at_ms: u64,
    pub available_at_ms: u64,
    pub redelivered: bool,
}

impl Envelope {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, crate::CodecError> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, crate::CodecError> {
        let (envelope, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(envelope)
    }

    pub(crate) fn into_delivery(self, queue: &str) -> Delivery {
        Delivery {
            id: self.id,
            payload: self.payload,
            redelivered: self.redelivered,
            handle: AckHandle::new(queue, self.id),
        }
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set before it.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
