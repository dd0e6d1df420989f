//! Broker transport for courier
//!
//! This crate provides the queueing layer that sits between publishing a
//! delivery intent and attempting it over SMTP:
//! - A [`BrokerTransport`] trait (enqueue with an optional delay, receive, ack/nack)
//! - An in-memory broker for tests and ephemeral deployments
//! - A file-backed broker that survives process restarts
//! - A test broker that records every enqueue for assertions

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{EnqueueRecord, FileBroker, FileBrokerBuilder, MemoryBroker, TestBroker};
pub use config::{BrokerConfig, MemoryConfig};
pub use error::{BrokerError, CodecError, EnqueueError, ValidationError};
pub use r#trait::{BrokerTransport, deliveries};
pub use types::{AckHandle, Delivery, Destination, EnqueueOptions, MessageId, Topology};
