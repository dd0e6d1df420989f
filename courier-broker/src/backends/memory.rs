use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_common::internal;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::{
    error::{BrokerError, EnqueueError},
    r#trait::BrokerTransport,
    types::{AckHandle, Delivery, Destination, EnqueueOptions, Envelope, MessageId, Topology, now_ms},
};

/// In-memory broker
///
/// Queues are ordered maps keyed by the instant a message becomes available,
/// so delayed messages simply sit at the back until their time comes. Claimed
/// messages move to an in-flight table until they are acked or nacked.
///
/// Availability is measured on the tokio clock, which lets tests drive delays
/// with a paused runtime.
///
/// # Capacity Management
/// An optional capacity bounds queued plus in-flight messages. Enqueue fails
/// with [`EnqueueError::CapacityExceeded`] once it is reached.
///
/// # Durability
/// None. Everything is lost with the process.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    capacity: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    bindings: HashMap<Destination, String>,
    queues: HashMap<String, BTreeMap<(Instant, u64), Envelope>>,
    inflight: HashMap<MessageId, (String, Envelope)>,
    seq: u64,
}

enum Claim {
    Ready(Delivery),
    Wait(Option<Instant>),
}

/// Stand-in deadline for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn available_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

impl State {
    fn len(&self) -> usize {
        self.queues.values().map(BTreeMap::len).sum::<usize>() + self.inflight.len()
    }

    fn push(&mut self, queue: &str, available_at: Instant, envelope: Envelope) {
        self.seq += 1;
        let seq = self.seq;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .insert((available_at, seq), envelope);
    }

    fn claim(&mut self, queue: &str, now: Instant) -> Result<Claim, BrokerError> {
        let messages = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        match messages.first_key_value() {
            Some((&(available_at, _), _)) if available_at <= now => {}
            Some((&(available_at, _), _)) => return Ok(Claim::Wait(Some(available_at))),
            None => return Ok(Claim::Wait(None)),
        }

        let Some((_, envelope)) = messages.pop_first() else {
            return Ok(Claim::Wait(None));
        };

        let delivery = envelope.clone().into_delivery(queue);
        self.inflight
            .insert(envelope.id, (queue.to_string(), envelope));

        Ok(Claim::Ready(delivery))
    }

    fn release(&mut self, handle: &AckHandle) -> Result<Envelope, BrokerError> {
        match self.inflight.get(&handle.id()) {
            Some((queue, _)) if queue == handle.queue() => {}
            _ => return Err(BrokerError::NotInFlight(handle.id())),
        }

        self.inflight
            .remove(&handle.id())
            .map(|(_, envelope)| envelope)
            .ok_or_else(|| BrokerError::NotInFlight(handle.id()))
    }
}

impl MemoryBroker {
    /// Create a new, empty broker with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a new broker that holds at most `capacity` messages
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    /// Number of messages held, queued or in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of claimed, unacknowledged messages
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Snapshot of the messages waiting on `queue`, earliest first
    #[must_use]
    pub fn queued(&self, queue: &str) -> Vec<Envelope> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Return every in-flight message to its queue, as a broker does when
    /// consumers disappear without acknowledging.
    ///
    /// Returns the number of messages recovered.
    pub fn recover(&self) -> usize {
        let recovered = {
            let mut state = self.inner.state.lock();
            let inflight: Vec<_> = state.inflight.drain().collect();
            let now = Instant::now();
            let count = inflight.len();

            for (_, (queue, mut envelope)) in inflight {
                envelope.redelivered = true;
                state.push(&queue, now, envelope);
            }

            count
        };

        if recovered > 0 {
            internal!(
                level = INFO,
                "Recovered {recovered} unacknowledged messages"
            );
            self.inner.notify.notify_waiters();
        }

        recovered
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn bind(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state
            .bindings
            .insert(topology.destination(), topology.queue.clone());
        state.queues.entry(topology.queue.clone()).or_default();

        Ok(())
    }

    async fn enqueue(
        &self,
        destination: &Destination,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<MessageId, EnqueueError> {
        let id = MessageId::generate();

        {
            let mut state = self.inner.state.lock();

            let queue = state
                .bindings
                .get(destination)
                .cloned()
                .ok_or_else(|| EnqueueError::Unroutable(destination.clone()))?;

            if let Some(capacity) = self.inner.capacity {
                let used = state.len();
                if used >= capacity {
                    return Err(EnqueueError::CapacityExceeded { used, capacity });
                }
            }

            let delay = options.delay.unwrap_or_default();
            let enqueued_at_ms = now_ms();
            let envelope = Envelope {
                id,
                destination: destination.clone(),
                payload,
                persistent: options.persistent,
                enqueued_at_ms,
                available_at_ms: enqueued_at_ms
                    .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                redelivered: false,
            };

            state.push(&queue, available_after(Instant::now(), delay), envelope);
        }

        self.inner.notify.notify_waiters();

        Ok(id)
    }

    async fn receive(&self, queue: &str) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim = self.inner.state.lock().claim(queue, Instant::now())?;

            match claim {
                Claim::Ready(delivery) => return Ok(delivery),
                Claim::Wait(Some(deadline)) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Claim::Wait(None) => notified.await,
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        self.inner.state.lock().release(handle)?;
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock();
            let mut envelope = state.release(handle)?;
            envelope.redelivered = true;
            state.push(handle.queue(), Instant::now(), envelope);
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    async fn bound() -> (MemoryBroker, Topology) {
        let broker = MemoryBroker::new();
        let topology = Topology::default();
        broker.bind(&topology).await.unwrap();
        (broker, topology)
    }

    #[tokio::test]
    async fn test_unbound_destination_is_unroutable() {
        let broker = MemoryBroker::new();
        let result = broker
            .enqueue(
                &Destination::new("mail", "nowhere"),
                b"x".to_vec(),
                EnqueueOptions::persistent(),
            )
            .await;

        assert!(matches!(result, Err(EnqueueError::Unroutable(_))));
    }

    #[tokio::test]
    async fn test_receive_unknown_queue() {
        let broker = MemoryBroker::new();
        let result = broker.receive("missing").await;
        assert!(matches!(result, Err(BrokerError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let (broker, topology) = bound().await;
        broker
            .enqueue(
                &topology.destination(),
                b"hello".to_vec(),
                EnqueueOptions::persistent(),
            )
            .await
            .unwrap();

        let delivery = broker.receive(&topology.queue).await.unwrap();
        assert_eq!(delivery.payload, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.inflight_count(), 1);

        broker.ack(&delivery.handle).await.unwrap();
        assert!(broker.is_empty());

        let again = broker.ack(&delivery.handle).await;
        assert!(matches!(again, Err(BrokerError::NotInFlight(_))));
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let (broker, topology) = bound().await;
        broker
            .enqueue(
                &topology.destination(),
                b"hello".to_vec(),
                EnqueueOptions::persistent(),
            )
            .await
            .unwrap();

        let first = broker.receive(&topology.queue).await.unwrap();
        broker.nack(&first.handle).await.unwrap();

        let second = broker.receive(&topology.queue).await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_is_held() {
        let (broker, topology) = bound().await;
        broker
            .enqueue(
                &topology.destination(),
                b"later".to_vec(),
                EnqueueOptions::persistent().with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        let start = Instant::now();
        let early = tokio::time::timeout(Duration::from_secs(29), broker.receive(&topology.queue)).await;
        assert!(early.is_err());

        let delivery = broker.receive(&topology.queue).await.unwrap();
        assert_eq!(delivery.payload, b"later");
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_waiting_receiver_is_woken() {
        let (broker, topology) = bound().await;

        let receiver = {
            let broker = broker.clone();
            let queue = topology.queue.clone();
            tokio::spawn(async move { broker.receive(&queue).await })
        };

        tokio::task::yield_now().await;
        broker
            .enqueue(
                &topology.destination(),
                b"wake".to_vec(),
                EnqueueOptions::persistent(),
            )
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"wake");
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let broker = MemoryBroker::with_capacity(1);
        let topology = Topology::default();
        broker.bind(&topology).await.unwrap();

        broker
            .enqueue(&topology.destination(), b"1".to_vec(), EnqueueOptions::persistent())
            .await
            .unwrap();
        let result = broker
            .enqueue(&topology.destination(), b"2".to_vec(), EnqueueOptions::persistent())
            .await;

        assert!(matches!(
            result,
            Err(EnqueueError::CapacityExceeded {
                used: 1,
                capacity: 1
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_is_held_without_overflow() {
        let (broker, topology) = bound().await;
        broker
            .enqueue(
                &topology.destination(),
                b"never".to_vec(),
                EnqueueOptions::persistent().with_delay(Duration::MAX),
            )
            .await
            .unwrap();

        let early =
            tokio::time::timeout(Duration::from_secs(86_400), broker.receive(&topology.queue)).await;
        assert!(early.is_err());
        assert_eq!(broker.queued(&topology.queue).len(), 1);
        assert_eq!(broker.queued(&topology.queue)[0].available_at_ms, u64::MAX);
    }

    #[test]
    fn test_capacity_is_reported() {
        assert_eq!(MemoryBroker::with_capacity(7).capacity(), Some(7));
        assert_eq!(MemoryBroker::new().capacity(), None);
    }

    #[tokio::test]
    async fn test_recover_returns_inflight() {
        let (broker, topology) = bound().await;
        broker
            .enqueue(&topology.destination(), b"1".to_vec(), EnqueueOptions::persistent())
            .await
            .unwrap();

        let delivery = broker.receive(&topology.queue).await.unwrap();
        assert_eq!(broker.recover(), 1);
        assert_eq!(broker.inflight_count(), 0);

        let queued = broker.queued(&topology.queue);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, delivery.id);
        assert!(queued[0].redelivered);
    }
}
