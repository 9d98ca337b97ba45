#![deny(unreachable_pub)]

//! Runtime machinery for `checkmill`: the broker seam, the subprocess
//! executor, the worker loop and the adaptive pool supervisor.

/// Public API for running a worker pool.
pub mod api;

pub mod broker;
pub mod executor;
pub mod gearman;

mod counter;
mod supervisor;
mod worker;

#[cfg(test)]
mod testutil;

pub use api::{PoolConfig, PoolController, PoolHandle, PoolSnapshot, start_pool};
pub use broker::{Broker, BrokerError, Connection, Delivery, MemoryBroker};
pub use gearman::GearmanBroker;
