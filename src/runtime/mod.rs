//! Threaded readiness runtime.
//!
//! Roles, leaves first:
//! - `ExchangeQueue`: bounded MPMC ring with per-slot sequence markers
//! - `Poller`: accepts and watches connections on its own multiplexer
//! - `Worker`: drains one poller's queue, one protocol tick per item
//! - `Orchestrator`: partitions the load, starts every thread, drives shutdown
//! - `Client`: load generator driving fixed-size request bursts
//!
//! Everything runs on OS threads; the only cross-thread synchronization on
//! the data path is the acquire/release handshake on each queue slot.

mod connection;
mod loadgen;
mod message;
mod orchestrator;
mod poller;
mod queue;
mod stats;
mod transport;
mod worker;

pub use connection::{Connection, ConnectionRegistry, Handle};
pub use loadgen::{Client, LoadProfile};
pub use message::Message;
pub use orchestrator::{partition, Orchestrator};
pub use poller::{Dispatch, Poller, PollerState, StateWatch};
pub use queue::ExchangeQueue;
pub use stats::{ClientStats, Histogram, PollerStats, Report, WorkerStats};
pub use transport::{describe, from_kind, TcpLoopback, Transport, UnixAbstract};
pub use worker::{tick, Tick, Worker};

use crate::config::Config;
use crate::error::Result;

/// Run one session with the transport named by `config`.
pub fn run(config: Config) -> Result<Report> {
    let transport = from_kind(config.transport);
    Orchestrator::new(config, transport).run()
}
