//! Broker implementations
//!
//! - `memory`: in-process queues, nothing survives a restart
//! - `test`: memory broker plus recording and failure injection
//! - `file`: spool directory that survives restarts

pub mod file;
pub mod memory;

pub use file::{FileBroker, FileBrokerBuilder};
pub use memory::MemoryBroker;
pub use test::{EnqueueRecord, TestBroker};
