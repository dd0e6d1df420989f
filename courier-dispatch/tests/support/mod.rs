//! Doubles for driving the dispatch pipeline without a network.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use courier_smtp::{MailError, MailTransport, OutboundMail};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{Layer, layer::Context};

/// A call the pipeline made, and when (on the tokio clock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailCall {
    Probe(Instant),
    Send(Instant, OutboundMail),
}

/// A [`MailTransport`] that answers from a script.
///
/// Each call pops the next scripted result for its kind; once a script is
/// empty every call succeeds.
#[derive(Debug, Default)]
pub struct ScriptedMail {
    probes: Mutex<VecDeque<Result<(), MailError>>>,
    sends: Mutex<VecDeque<Result<(), MailError>>>,
    calls: Mutex<Vec<MailCall>>,
}

impl ScriptedMail {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_probes(&self, errors: impl IntoIterator<Item = MailError>) {
        self.probes.lock().extend(errors.into_iter().map(Err));
    }

    pub fn fail_sends(&self, errors: impl IntoIterator<Item = MailError>) {
        self.sends.lock().extend(errors.into_iter().map(Err));
    }

    pub fn calls(&self) -> Vec<MailCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn probe_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, MailCall::Probe(_)))
            .count()
    }

    pub fn sent(&self) -> Vec<(Instant, OutboundMail)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                MailCall::Send(at, mail) => Some((*at, mail.clone())),
                MailCall::Probe(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl MailTransport for ScriptedMail {
    async fn probe(&self) -> Result<(), MailError> {
        self.calls.lock().push(MailCall::Probe(Instant::now()));
        self.probes.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn send(&self, mail: &OutboundMail) -> Result<(), MailError> {
        self.calls
            .lock()
            .push(MailCall::Send(Instant::now(), mail.clone()));
        self.sends.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Counts events per level for assertions on log severity.
#[derive(Debug, Clone, Default)]
pub struct LevelCounter {
    counts: Arc<Mutex<HashMap<Level, usize>>>,
}

impl LevelCounter {
    pub fn count(&self, level: Level) -> usize {
        self.counts.lock().get(&level).copied().unwrap_or(0)
    }
}

impl<S: Subscriber> Layer<S> for LevelCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        *self
            .counts
            .lock()
            .entry(*event.metadata().level())
            .or_default() += 1;
    }
}
