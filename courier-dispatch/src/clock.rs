use chrono::{DateTime, Utc};

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time that advances with the tokio clock.
///
/// Starts at `origin` and moves forward exactly as far as
/// [`tokio::time::Instant`] does, so a paused runtime controls both timers and
/// the time they are compared against.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    origin: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl InstantClock {
    #[must_use]
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::TimeDelta::from_std(self.start.elapsed())
            .ok()
            .and_then(|elapsed| self.origin.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
