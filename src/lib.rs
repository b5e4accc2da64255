//! pingpong-lb: readiness-multiplexed socket servers, two ways.
//!
//! - `direct`: every poller thread serves the connections it accepts
//! - `queued`: pollers forward ready connections through bounded MPMC
//!   exchange queues to an independently sized worker pool
//!
//! Both are driven by the same load generator over loopback TCP or
//! local-domain sockets, and report raw counters: queue overflow spins,
//! events-per-wait histograms, closed connections and replies.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;

pub use error::{Error, Result};
