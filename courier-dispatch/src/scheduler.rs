//! One-shot timers for messages that are not due yet.
//!
//! A single task owns a min-heap of deadlines. Scheduling is a channel send,
//! so callers never wait, and a far-future item costs one heap entry instead
//! of a sleeping worker.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    },
    time::Duration,
};

use courier_common::internal;
use tokio::{sync::mpsc, time::Instant};

use crate::error::DispatchError;

/// Deadline used when `now + delay` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Timer<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so the earliest deadline sits at the top of the max-heap. Equal
/// deadlines fire in scheduling order.
impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle to the scheduler task.
///
/// Cloning is cheap. The task stops once every handle is dropped or the
/// receiving end of the fired items goes away; items still waiting are
/// dropped with it.
#[derive(Debug)]
pub struct Scheduler<T> {
    requests: mpsc::UnboundedSender<(Instant, T)>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: Send + 'static> Scheduler<T> {
    /// Start the scheduler task. Items come out of the returned receiver
    /// once their delay has passed.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (requests, incoming) = mpsc::unbounded_channel();
        let (fired, output) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run(incoming, fired, Arc::clone(&pending)));

        (Self { requests, pending }, output)
    }

    /// Emit `item` after `delay`.
    ///
    /// # Errors
    /// [`DispatchError::SchedulerClosed`] if the task has stopped
    pub fn schedule(&self, delay: Duration, item: T) -> Result<(), DispatchError> {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);

        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
        self.requests
            .send((deadline, item))
            .map_err(|_| {
                self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
                DispatchError::SchedulerClosed
            })
    }

    /// Items scheduled but not yet emitted.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::SeqCst)
    }
}

async fn run<T>(
    mut incoming: mpsc::UnboundedReceiver<(Instant, T)>,
    fired: mpsc::UnboundedSender<T>,
    pending: Arc<AtomicUsize>,
) {
    let mut timers = BinaryHeap::new();
    let mut seq = 0_u64;

    loop {
        let next_deadline = timers.peek().map(|timer: &Timer<T>| timer.deadline);

        tokio::select! {
            request = incoming.recv() => {
                let Some((deadline, item)) = request else {
                    break;
                };
                timers.push(Timer { deadline, seq, item });
                seq += 1;
            }
            () = sleep_until(next_deadline), if next_deadline.is_some() => {
                let now = Instant::now();
                while timers.peek().is_some_and(|timer| timer.deadline <= now) {
                    let Some(timer) = timers.pop() else {
                        break;
                    };
                    pending.fetch_sub(1, AtomicOrdering::SeqCst);
                    if fired.send(timer.item).is_err() {
                        internal!(level = DEBUG, "Scheduler output closed, stopping");
                        return;
                    }
                }
            }
        }
    }

    if !timers.is_empty() {
        internal!(
            level = DEBUG,
            "Scheduler stopped with {} timers outstanding",
            timers.len()
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}
