use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::{
    error::{BrokerError, EnqueueError},
    types::{AckHandle, Delivery, Destination, EnqueueOptions, MessageId, Topology},
};

/// A queueing service that holds messages until a consumer takes them.
///
/// Implementations guarantee:
/// - A message enqueued with a delay is never handed out before that delay has elapsed
/// - At most one consumer holds a given message at a time
/// - A message that is received but never acknowledged is handed out again
///   once the broker recovers it (at-least-once)
#[async_trait]
pub trait BrokerTransport: Send + Sync + std::fmt::Debug {
    /// Declare the queue and route the topology's destination to it.
    ///
    /// Binding is idempotent.
    ///
    /// # Errors
    /// If the queue cannot be created
    async fn bind(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Hand a message to the broker.
    ///
    /// # Errors
    /// - [`EnqueueError::Unroutable`] if nothing is bound to `destination`
    /// - Any storage or capacity failure
    async fn enqueue(
        &self,
        destination: &Destination,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<MessageId, EnqueueError>;

    /// Wait for the next available message on `queue` and claim it.
    ///
    /// # Errors
    /// If the queue is unknown or the claimed message cannot be read
    async fn receive(&self, queue: &str) -> Result<Delivery, BrokerError>;

    /// Remove a claimed message for good.
    ///
    /// # Errors
    /// If the message is not currently claimed
    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError>;

    /// Return a claimed message to its queue, marked as redelivered.
    ///
    /// # Errors
    /// If the message is not currently claimed
    async fn nack(&self, handle: &AckHandle) -> Result<(), BrokerError>;
}

/// Turn a broker queue into an endless stream of deliveries.
pub fn deliveries(
    broker: Arc<dyn BrokerTransport>,
    queue: impl Into<String>,
) -> impl Stream<Item = Result<Delivery, BrokerError>> + Send {
    futures_util::stream::unfold((broker, queue.into()), |(broker, queue)| async move {
        let next = broker.receive(&queue).await;
        Some((next, (broker, queue)))
    })
}
