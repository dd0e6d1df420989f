//! The retry state machine for a single delivery intent.
//!
//! ```text
//! RECEIVED ─┬─ retries_remaining == 0 ──────────────► DISCARDED_EXHAUSTED (ack)
//!           ├─ scheduled_at in the future ──────────► DEFERRED_LOCAL (held, re-enters on fire)
//!           └─ otherwise ─► ATTEMPTING ─┬─ ok ──────► DELIVERED (ack)
//!                                       ├─ auth ────► DISCARDED_PERMANENT (ack)
//!                                       └─ other ───► REQUEUED_REMOTE (ack after requeue)
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_broker::{AckHandle, BrokerTransport, Delivery};
use courier_common::{incoming, internal};
use courier_smtp::{MailError, MailTransport, OutboundMail};

use crate::{
    clock::Clock, config::DispatchConfig, error::DispatchError, intent::DeliveryIntent,
    publisher::Publisher, scheduler::Scheduler,
};

/// What to do with an intent right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The retry budget is spent.
    Discard,
    /// Not due yet; look again after this long.
    Defer(Duration),
    Attempt,
}

/// Where a single receipt of an intent ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// Received with no retries left. Nothing was attempted.
    DiscardedExhausted,
    /// The relay rejected our credentials. Not retried.
    DiscardedPermanent(MailError),
    /// Published again with one less retry.
    Requeued {
        retries_remaining: u32,
        error: MailError,
    },
    /// Held on a local timer, still unacknowledged.
    Deferred(Duration),
    /// The payload was not a delivery intent and was dropped.
    Rejected,
}

/// An intent together with the broker handle that settles it.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub intent: DeliveryIntent,
    pub handle: AckHandle,
    pub redelivered: bool,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    broker: Arc<dyn BrokerTransport>,
    mail: Arc<dyn MailTransport>,
    publisher: Publisher,
    scheduler: Scheduler<PendingDelivery>,
    config: Arc<DispatchConfig>,
    clock: Arc<dyn Clock>,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn BrokerTransport>,
        mail: Arc<dyn MailTransport>,
        publisher: Publisher,
        scheduler: Scheduler<PendingDelivery>,
        config: Arc<DispatchConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            mail,
            publisher,
            scheduler,
            config,
            clock,
        }
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<PendingDelivery> {
        &self.scheduler
    }

    /// Decide what to do with `intent` at `now`.
    ///
    /// Exhaustion wins over timing: an intent with no retries left is
    /// discarded even if it is not due yet.
    #[must_use]
    pub fn decide(intent: &DeliveryIntent, now: DateTime<Utc>) -> Decision {
        if intent.is_exhausted() {
            Decision::Discard
        } else if let Some(remaining) = intent.due_in(now) {
            Decision::Defer(remaining)
        } else {
            Decision::Attempt
        }
    }

    /// Decode a message straight off the broker and process it.
    ///
    /// A payload that is not a delivery intent can never succeed, so it is
    /// acknowledged and dropped.
    ///
    /// # Errors
    /// See [`Consumer::process`]
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome, DispatchError> {
        incoming!(
            level = DEBUG,
            "Received {} from {} (redelivered: {})",
            delivery.id,
            delivery.handle.queue(),
            delivery.redelivered
        );

        match DeliveryIntent::decode(&delivery.payload) {
            Ok(intent) => {
                self.process(PendingDelivery {
                    intent,
                    handle: delivery.handle,
                    redelivered: delivery.redelivered,
                })
                .await
            }
            Err(e) => {
                internal!(
                    level = ERROR,
                    "Dropping message {}: payload is not a delivery intent: {e}",
                    delivery.id
                );
                self.broker.ack(&delivery.handle).await?;
                Ok(Outcome::Rejected)
            }
        }
    }

    /// Run the state machine for one intent.
    ///
    /// # Errors
    /// - [`DispatchError::Enqueue`] if a retry could not be published; the
    ///   original message is left unacknowledged so the broker can recover it
    /// - [`DispatchError::Broker`] if the message could not be acknowledged
    /// - [`DispatchError::SchedulerClosed`] if a deferral could not be scheduled
    pub async fn process(&self, pending: PendingDelivery) -> Result<Outcome, DispatchError> {
        match Self::decide(&pending.intent, self.clock.now()) {
            Decision::Discard => {
                internal!(
                    level = WARN,
                    "Discarding message {} for {}: no retries remaining",
                    pending.handle.id(),
                    pending.intent.recipient
                );
                self.broker.ack(&pending.handle).await?;
                Ok(Outcome::DiscardedExhausted)
            }
            Decision::Defer(remaining) => {
                internal!(
                    level = DEBUG,
                    "Message {} for {} is not due for {remaining:?}, deferring",
                    pending.handle.id(),
                    pending.intent.recipient
                );
                self.scheduler.schedule(remaining, pending)?;
                Ok(Outcome::Deferred(remaining))
            }
            Decision::Attempt => self.attempt(pending).await,
        }
    }

    async fn attempt(&self, pending: PendingDelivery) -> Result<Outcome, DispatchError> {
        let PendingDelivery { intent, handle, .. } = pending;

        let mail = OutboundMail {
            from: self.config.sender.clone(),
            to: intent.recipient.clone(),
            subject: intent.subject.clone(),
            body: intent.body.clone(),
        };

        let result = match self.mail.probe().await {
            Ok(()) => self.mail.send(&mail).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                internal!(
                    level = INFO,
                    "Delivered message {} to {}",
                    handle.id(),
                    intent.recipient
                );
                self.broker.ack(&handle).await?;
                Ok(Outcome::Delivered)
            }
            Err(error) if error.is_permanent() => {
                internal!(
                    level = ERROR,
                    "Discarding message {} for {}: {error}",
                    handle.id(),
                    intent.recipient
                );
                self.broker.ack(&handle).await?;
                Ok(Outcome::DiscardedPermanent(error))
            }
            Err(error) => match self.publisher.requeue(&intent).await {
                Ok(next) => {
                    internal!(
                        level = WARN,
                        "Delivery of {} to {} failed ({} failure: {error}), retrying in {:?} with {} retries remaining",
                        handle.id(),
                        intent.recipient,
                        error.kind(),
                        self.config.retry_delay(),
                        next.retries_remaining
                    );
                    self.broker.ack(&handle).await?;
                    Ok(Outcome::Requeued {
                        retries_remaining: next.retries_remaining,
                        error,
                    })
                }
                Err(requeue_error) => {
                    internal!(
                        level = ERROR,
                        "Failed to requeue message {} for {} after {error}: {requeue_error}. \
                         Leaving it unacknowledged; it is lost unless the broker redelivers it",
                        handle.id(),
                        intent.recipient
                    );
                    Err(requeue_error)
                }
            },
        }
    }
}
