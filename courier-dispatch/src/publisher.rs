use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_broker::{BrokerTransport, Destination, EnqueueOptions, MessageId};
use courier_common::internal;

use crate::{
    clock::Clock,
    config::{DispatchConfig, ScheduleMode},
    error::DispatchError,
    intent::DeliveryIntent,
};

/// Turns send requests into delivery intents on the broker.
///
/// Every enqueue is persistent. Broker failures go straight back to the
/// caller; nothing is retried here.
#[derive(Debug, Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerTransport>,
    config: Arc<DispatchConfig>,
    clock: Arc<dyn Clock>,
    destination: Destination,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn BrokerTransport>,
        config: Arc<DispatchConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let destination = config.topology.destination();
        Self {
            broker,
            config,
            clock,
            destination,
        }
    }

    /// Enqueue a message for immediate delivery.
    ///
    /// # Errors
    /// [`DispatchError::Enqueue`] if the broker rejects the write
    pub async fn publish_now(
        &self,
        recipient: impl Into<String> + Send,
        subject: impl Into<String> + Send,
        body: impl Into<String> + Send,
    ) -> Result<MessageId, DispatchError> {
        let intent = DeliveryIntent::new(recipient, subject, body, self.config.default_retries);
        self.enqueue(&intent, EnqueueOptions::persistent()).await
    }

    /// Enqueue a message that must not be delivered before `scheduled_at`.
    ///
    /// With [`ScheduleMode::Broker`] the broker holds the message until it is
    /// due; a time already in the past makes this the same as
    /// [`Publisher::publish_now`]. With [`ScheduleMode::Consumer`] the message
    /// is available at once and the consumer waits. Either way the intent
    /// carries `scheduled_at`, so the consumer never sends early.
    ///
    /// # Errors
    /// [`DispatchError::Enqueue`] if the broker rejects the write
    pub async fn publish_later(
        &self,
        recipient: impl Into<String> + Send,
        subject: impl Into<String> + Send,
        body: impl Into<String> + Send,
        scheduled_at: DateTime<Utc>,
    ) -> Result<MessageId, DispatchError> {
        let intent = DeliveryIntent::new(recipient, subject, body, self.config.default_retries)
            .scheduled_for(scheduled_at);

        let options = match self.config.schedule_mode {
            ScheduleMode::Broker => intent
                .due_in(self.clock.now())
                .map_or_else(EnqueueOptions::persistent, |delay| {
                    EnqueueOptions::persistent().with_delay(delay)
                }),
            ScheduleMode::Consumer => EnqueueOptions::persistent(),
        };

        self.enqueue(&intent, options).await
    }

    /// Publish `intent` again with one less retry, held back by the broker
    /// for the configured retry delay.
    ///
    /// Returns the copy that was published.
    ///
    /// # Errors
    /// [`DispatchError::Enqueue`] if the broker rejects the write
    pub async fn requeue(&self, intent: &DeliveryIntent) -> Result<DeliveryIntent, DispatchError> {
        let next = intent.decremented();
        let options = EnqueueOptions::persistent().with_delay(self.config.retry_delay());
        self.enqueue(&next, options).await?;
        Ok(next)
    }

    async fn enqueue(
        &self,
        intent: &DeliveryIntent,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        let payload = intent.encode()?;
        let id = self
            .broker
            .enqueue(&self.destination, payload, options)
            .await?;

        internal!(
            level = DEBUG,
            "Enqueued {id} for {} to {} (retries remaining: {}, delay: {:?})",
            intent.recipient,
            self.destination,
            intent.retries_remaining,
            options.delay
        );

        Ok(id)
    }
}
