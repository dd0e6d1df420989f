//! The dispatch pipeline: publishing delivery intents to the broker and
//! consuming them with bounded, broker-delayed retries.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod intent;
pub mod processor;
pub mod publisher;
pub mod scheduler;

pub use clock::{Clock, InstantClock, SystemClock};
pub use config::{DispatchConfig, ScheduleMode};
pub use consumer::{Consumer, Decision, Outcome, PendingDelivery};
pub use error::DispatchError;
pub use intent::DeliveryIntent;
pub use processor::DispatchProcessor;
pub use publisher::Publisher;
pub use scheduler::Scheduler;
