//! Runs consumers against the broker queue.

use std::{sync::Arc, time::Duration};

use courier_broker::{BrokerTransport, Delivery, deliveries};
use courier_common::{Signal, internal};
use courier_smtp::MailTransport;
use futures_util::StreamExt;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc},
    task::{JoinHandle, JoinSet},
};

use crate::{
    clock::Clock,
    config::DispatchConfig,
    consumer::{Consumer, Outcome, PendingDelivery},
    error::DispatchError,
    publisher::Publisher,
    scheduler::Scheduler,
};

/// Pause before receiving again after the broker returned an error.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Pulls intents off the configured queue and processes each one on its own
/// task, with at most `max_concurrent_deliveries` SMTP attempts at a time.
///
/// Deferred intents wait in the [`Scheduler`], outside the worker limit, and
/// take a slot only once they are due.
#[derive(Debug)]
pub struct DispatchProcessor {
    broker: Arc<dyn BrokerTransport>,
    consumer: Arc<Consumer>,
    publisher: Publisher,
    config: Arc<DispatchConfig>,
    deferred: mpsc::UnboundedReceiver<PendingDelivery>,
}

impl DispatchProcessor {
    /// Must be called from within a tokio runtime: the deferred scheduler is
    /// spawned here.
    pub fn new(
        broker: Arc<dyn BrokerTransport>,
        mail: Arc<dyn MailTransport>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let publisher = Publisher::new(Arc::clone(&broker), Arc::clone(&config), Arc::clone(&clock));
        let (scheduler, deferred) = Scheduler::spawn();
        let consumer = Consumer::new(
            Arc::clone(&broker),
            mail,
            publisher.clone(),
            scheduler,
            Arc::clone(&config),
            clock,
        );

        Self {
            broker,
            consumer: Arc::new(consumer),
            publisher,
            config,
            deferred,
        }
    }

    /// A publisher for the same broker and topology.
    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Intents waiting on a local timer.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.consumer.scheduler().pending()
    }

    /// Process deliveries until a shutdown signal arrives.
    ///
    /// ## Graceful Shutdown
    ///
    /// On [`Signal::Shutdown`]:
    /// 1. Stop receiving from the broker
    /// 2. Wait up to `shutdown_timeout_secs` for in-flight attempts
    /// 3. Abort whatever is still running
    ///
    /// Deferred and aborted messages are never acknowledged, so the broker
    /// hands them out again after recovery.
    ///
    /// # Errors
    /// If the topology cannot be bound
    pub async fn serve(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        let topology = self.config.topology.clone();
        self.broker.bind(&topology).await?;

        internal!(
            level = INFO,
            "Dispatch processor consuming {} with {} workers",
            topology.queue,
            self.config.max_concurrent_deliveries
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let (ready_tx, mut ready) = mpsc::channel(1);
        let intake = spawn_intake(
            Arc::clone(&self.broker),
            topology.queue.clone(),
            Arc::clone(&permits),
            ready_tx,
        );
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch processor received shutdown signal");
                        }
                        Err(e) => {
                            internal!(level = ERROR, "Dispatch processor shutdown channel error: {e}");
                        }
                    }
                    break;
                }
                Some((delivery, permit)) = ready.recv() => {
                    let consumer = Arc::clone(&self.consumer);
                    tasks.spawn(async move {
                        let _permit = permit;
                        report(consumer.handle(delivery).await);
                    });
                }
                Some(pending) = self.deferred.recv() => {
                    let consumer = Arc::clone(&self.consumer);
                    let permits = Arc::clone(&permits);
                    tasks.spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        report(consumer.process(pending).await);
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        internal!(level = ERROR, "Delivery task failed: {e}");
                    }
                }
            }
        }

        intake.abort();
        // Resolves once the task is gone, so no claim is still in progress.
        let _ = intake.await;
        self.drain(tasks).await;

        Ok(())
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let timeout = self.config.shutdown_timeout();
        let in_flight = tasks.len();
        if in_flight > 0 {
            internal!(
                level = INFO,
                "Waiting up to {timeout:?} for {in_flight} in-flight deliveries"
            );
        }

        let finished = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            internal!(
                level = WARN,
                "Shutdown timeout exceeded, abandoning {} deliveries; the broker will redeliver them",
                tasks.len()
            );
            tasks.shutdown().await;
        }

        let deferred = self.deferred_count();
        if deferred > 0 {
            internal!(
                level = INFO,
                "{deferred} deferred messages left unacknowledged for broker recovery"
            );
        }

        internal!("Dispatch processor shutdown complete");
    }
}

/// Pull the next delivery off `queue` whenever a worker slot is free.
///
/// Runs on its own task so that a claim in progress is never dropped halfway
/// by the processor's select loop.
fn spawn_intake(
    broker: Arc<dyn BrokerTransport>,
    queue: String,
    permits: Arc<Semaphore>,
    ready: mpsc::Sender<(Delivery, OwnedSemaphorePermit)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let incoming = deliveries(broker, queue.clone());
        tokio::pin!(incoming);

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                return;
            };

            match incoming.next().await {
                Some(Ok(delivery)) => {
                    if ready.send((delivery, permit)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    drop(permit);
                    internal!(level = ERROR, "Failed to receive from {queue}: {e}");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
                None => return,
            }
        }
    })
}

fn report(result: Result<Outcome, DispatchError>) {
    match result {
        Ok(outcome) => internal!(level = DEBUG, "Delivery outcome: {outcome:?}"),
        Err(e) if e.is_transient() => internal!(
            level = ERROR,
            "Delivery processing failed: {e}. The message stays with the broker until recovery"
        ),
        Err(e) => internal!(level = ERROR, "Delivery processing failed: {e}"),
    }
}
