//! Items carried by an exchange queue from a poller to its workers.

use crate::runtime::connection::Handle;

/// Work item forwarded by a poller.
///
/// Control signals travel on the same queue as data, so they are ordered
/// with it: a worker sees `Shutdown` only after everything queued before it.
#[derive(Debug)]
pub enum Message {
    /// Connection has a request waiting; perform one protocol tick.
    Ready(Handle),
    /// Poller saw a hangup and gave up its reference; drop ours.
    DeferredClose(Handle),
    /// Stop consuming.
    Shutdown,
}

impl Message {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready(_) => "ready",
            Message::DeferredClose(_) => "deferred-close",
            Message::Shutdown => "shutdown",
        }
    }
}
