//! Worker threads draining an exchange queue.
//!
//! A worker never owns a connection. It borrows one for a single protocol
//! tick: read one request, write one reply, and hand control back to the
//! poller, which keeps the socket registered and re-signals it when the next
//! request arrives.

use crate::error::{Error, Result};
use crate::protocol::{self, TOKEN_LEN};
use crate::runtime::message::Message;
use crate::runtime::queue::ExchangeQueue;
use crate::runtime::stats::WorkerStats;
use socket2::Socket;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Outcome of one protocol tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Request read and reply written.
    Replied,
    /// Read returned zero bytes: the peer closed before the poller saw it.
    PeerClosed,
}

/// Consumer bound to one poller's queue.
pub struct Worker {
    queue: Arc<ExchangeQueue<Message>>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(id: usize, queue: Arc<ExchangeQueue<Message>>) -> Self {
        Self {
            queue,
            stats: WorkerStats {
                id,
                ..Default::default()
            },
        }
    }

    /// Consume until a shutdown message arrives.
    pub fn run(mut self) -> Result<WorkerStats> {
        let id = self.stats.id;
        info!(worker = id, "Worker started");

        loop {
            match self.queue.pop() {
                Message::Shutdown => break,
                Message::DeferredClose(handle) => {
                    debug!(worker = id, fd = handle.as_raw_fd(), "Deferred close");
                    drop(handle);
                    self.stats.closes += 1;
                }
                Message::Ready(handle) => match tick(&handle)? {
                    Tick::Replied => self.stats.replies += 1,
                    Tick::PeerClosed => self.stats.peer_closed += 1,
                },
            }
        }

        info!(
            worker = id,
            replies = self.stats.replies,
            peer_closed = self.stats.peer_closed,
            closes = self.stats.closes,
            "Worker stopped"
        );
        Ok(self.stats)
    }
}

/// Serve exactly one request on a readable connection.
///
/// A zero-length read is reported, not failed: the client may close between
/// its last reply and the poller noticing the hangup.
pub fn tick(socket: &Socket) -> Result<Tick> {
    let mut stream = socket;
    let mut buf = [0u8; TOKEN_LEN];

    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("read request", e)),
        }
    };

    if n == 0 {
        warn!(fd = socket.as_raw_fd(), "Read returned zero bytes before hangup");
        return Ok(Tick::PeerClosed);
    }

    protocol::check_request(&buf[..n])?;

    let written = stream
        .write(protocol::RESPONSE)
        .map_err(|e| Error::io("write reply", e))?;
    if written != TOKEN_LEN {
        return Err(Error::io(
            "write reply",
            io::Error::new(io::ErrorKind::WriteZero, format!("short write of {written} bytes")),
        ));
    }

    trace!(fd = socket.as_raw_fd(), "Replied");
    Ok(Tick::Replied)
}
