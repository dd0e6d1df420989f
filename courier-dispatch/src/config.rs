use std::time::Duration;

use courier_broker::Topology;
use serde::Deserialize;

/// How `publish_later` makes sure a message is not sent early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ScheduleMode {
    /// Enqueue with a broker delay of `scheduled_at - now`. Nothing waits
    /// in process memory, so a crash cannot lose the scheduled send.
    #[default]
    Broker,
    /// Enqueue immediately and let the consumer hold the message on a local
    /// timer until it is due.
    Consumer,
}

mod defaults {
    pub const fn default_retries() -> u32 {
        3
    }

    pub const fn retry_delay_secs() -> u64 {
        30
    }

    pub const fn max_concurrent_deliveries() -> usize {
        8
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

/// Everything the publisher and consumer need to know, fixed at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Envelope and `From:` address of every message
    pub sender: String,

    /// Retry budget given to every new intent
    ///
    /// Default: 3
    #[serde(default = "defaults::default_retries")]
    pub default_retries: u32,

    /// How long the broker holds a message after a transient failure
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default)]
    pub schedule_mode: ScheduleMode,

    /// Upper bound on SMTP attempts running at once
    ///
    /// Default: 8
    #[serde(default = "defaults::max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// How long shutdown waits for in-flight attempts
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub topology: Topology,
}

impl DispatchConfig {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            default_retries: defaults::default_retries(),
            retry_delay_secs: defaults::retry_delay_secs(),
            schedule_mode: ScheduleMode::default(),
            max_concurrent_deliveries: defaults::max_concurrent_deliveries(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            topology: Topology::default(),
        }
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
