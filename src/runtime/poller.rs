//! Readiness poller: one listening endpoint, one multiplexer, one thread.
//!
//! The poller accepts connections, watches them for requests and hangups,
//! and hands ready connections to whoever performs the protocol tick:
//! workers behind an exchange queue, or the poller itself in direct mode.
//!
//! mio registers every source edge-triggered, the listener included. The
//! listener still behaves as if level-triggered because each notification
//! accepts until the kernel reports `WouldBlock`, leaving no pending
//! connection behind for a later edge.
//!
//! Connections are registered edge-triggered for read readiness and remote
//! hangup. A hangup deregisters the connection and gives up the poller's
//! handle; in queued mode the handle travels to a worker as a deferred close
//! so the final `close` happens off the polling thread.

use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::message::Message;
use crate::runtime::queue::ExchangeQueue;
use crate::runtime::stats::PollerStats;
use crate::runtime::transport::{describe, Transport};
use crate::runtime::worker::{self, Tick};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{SockAddr, Socket};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Poller lifecycle. A poller only exists once [`Poller::init`] succeeds,
/// so it starts out `Listening`. Leftover connections are released while
/// still `Running`, immediately before the poller reports `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    /// Endpoint bound and registered; not yet polling.
    Listening = 0,
    Running = 1,
    /// Expected closures reached and leftovers released.
    Stopped = 2,
}

impl PollerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PollerState::Listening,
            1 => PollerState::Running,
            _ => PollerState::Stopped,
        }
    }
}

/// Read-only view of a poller's state from another thread.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    pub fn get(&self) -> PollerState {
        PollerState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Who performs the protocol tick for ready connections.
pub enum Dispatch {
    /// Forward through an exchange queue to workers.
    Queue(Arc<ExchangeQueue<Message>>),
    /// Serve on the polling thread.
    Inline,
}

impl Dispatch {
    /// Queue shared with this poller's workers, if any.
    pub fn queue(&self) -> Option<&Arc<ExchangeQueue<Message>>> {
        match self {
            Dispatch::Queue(queue) => Some(queue),
            Dispatch::Inline => None,
        }
    }
}

/// Readiness loop over one listening endpoint.
pub struct Poller {
    poll: Poll,
    events: Events,
    listener: Socket,
    local_addr: SockAddr,
    connections: ConnectionRegistry,
    dispatch: Dispatch,
    timeout: Duration,
    state: Arc<AtomicU8>,
    stats: PollerStats,
}

impl Poller {
    /// Obtain a listening endpoint and register it for readability.
    pub fn init(
        id: usize,
        transport: &dyn Transport,
        dispatch: Dispatch,
        max_events: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let (listener, local_addr) = transport
            .create_listening_endpoint()
            .map_err(|e| Error::setup("create listening endpoint", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::setup("set listener non-blocking", e))?;

        let poll = Poll::new().map_err(|e| Error::setup("create poll", e))?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(|e| Error::setup("register listener", e))?;

        info!(
            poller = id,
            transport = transport.name(),
            addr = %describe(&local_addr),
            "Poller listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(max_events),
            listener,
            local_addr,
            connections: ConnectionRegistry::new(),
            dispatch,
            timeout,
            state: Arc::new(AtomicU8::new(PollerState::Listening as u8)),
            stats: PollerStats::new(id, max_events),
        })
    }

    /// Address clients connect to.
    pub fn local_addr(&self) -> &SockAddr {
        &self.local_addr
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Handle for observing the state while `run` holds the poller.
    pub fn watch(&self) -> StateWatch {
        StateWatch(Arc::clone(&self.state))
    }

    fn set_state(&self, state: PollerState) {
        debug!(poller = self.stats.id, ?state, "Poller state");
        self.state.store(state as u8, Ordering::Release);
    }

    /// Poll until `expected_closures` connections have hung up.
    pub fn run(&mut self, expected_closures: usize) -> Result<PollerStats> {
        let id = self.stats.id;
        self.connections.reserve(expected_closures);
        self.set_state(PollerState::Running);
        info!(
            poller = id,
            expected_closures,
            capacity = self.connections.capacity(),
            "Poller running"
        );

        while self.stats.closed < expected_closures {
            match self.poll.poll(&mut self.events, Some(self.timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("poll wait", e)),
            }
            self.stats.histogram.record(self.events.iter().count());

            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_connections(
                        &self.listener,
                        self.poll.registry(),
                        &mut self.connections,
                        &mut self.stats,
                    )?,
                    Token(key) if event.is_read_closed() => {
                        close_connection(
                            key,
                            self.poll.registry(),
                            &mut self.connections,
                            &self.dispatch,
                            &mut self.stats,
                        )?;
                    }
                    Token(key) => forward(key, &self.connections, &self.dispatch, &mut self.stats)?,
                }
            }
        }

        if !self.connections.is_empty() {
            warn!(
                poller = id,
                remaining = self.connections.len(),
                "Releasing connections still open at shutdown"
            );
        }
        for conn in self.connections.drain() {
            debug!(poller = id, fd = conn.fd(), "Released connection");
        }
        self.set_state(PollerState::Stopped);

        info!(
            poller = id,
            accepted = self.stats.accepted,
            closed = self.stats.closed,
            overflows = self.stats.overflows,
            "Poller stopped"
        );
        Ok(self.stats.clone())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Path-bound endpoints outlive their socket; abstract ones do not.
        if let Some(path) = self.local_addr.as_pathname() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(poller = self.stats.id, error = %e, "Endpoint path not removed");
            }
        }
    }
}

/// Accept until the listener would block.
fn accept_connections(
    listener: &Socket,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    stats: &mut PollerStats,
) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((socket, peer)) => {
                debug!(poller = stats.id, peer = %describe(&peer), "Accepted connection");

                let conn = Connection::new(socket, peer);
                let fd = conn.fd();
                let key = connections.insert(conn);
                registry
                    .register(&mut SourceFd(&fd), Token(key), Interest::READABLE)
                    .map_err(|e| Error::io("register connection", e))?;
                stats.accepted = connections.accepted();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("accept", e)),
        }
    }
}

/// Hand a readable connection to whoever serves it.
fn forward(
    key: usize,
    connections: &ConnectionRegistry,
    dispatch: &Dispatch,
    stats: &mut PollerStats,
) -> Result<()> {
    let Some(conn) = connections.get(key) else {
        return Ok(());
    };

    match dispatch {
        Dispatch::Queue(queue) => {
            stats.overflows += queue.push(Message::Ready(conn.handle()));
        }
        Dispatch::Inline => {
            if worker::tick(conn.socket())? == Tick::Replied {
                stats.ticks += 1;
            }
        }
    }
    Ok(())
}

/// Deregister a hung-up connection and release the poller's handle.
fn close_connection(
    key: usize,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    dispatch: &Dispatch,
    stats: &mut PollerStats,
) -> Result<()> {
    let Some(conn) = connections.remove(key) else {
        return Ok(());
    };

    registry
        .deregister(&mut SourceFd(&conn.fd()))
        .map_err(|e| Error::io("deregister connection", e))?;
    stats.closed += 1;
    debug!(
        poller = stats.id,
        key,
        fd = conn.fd(),
        peer = %describe(conn.peer()),
        "Connection hung up"
    );

    match dispatch {
        Dispatch::Queue(queue) => {
            queue.push(Message::DeferredClose(conn.into_handle()));
        }
        Dispatch::Inline => drop(conn),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::{TcpLoopback, UnixAbstract};
    use std::io::{Read, Write};
    use std::thread;

    fn ping(transport: &dyn Transport, addr: &SockAddr, rounds: usize) {
        let mut client = transport.create_connecting_socket(addr).unwrap();
        for _ in 0..rounds {
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"pong");
        }
    }

    #[test]
    fn test_init_listens() {
        let poller = Poller::init(
            0,
            &TcpLoopback,
            Dispatch::Inline,
            16,
            Duration::from_millis(1),
        )
        .unwrap();

        assert_eq!(poller.state(), PollerState::Listening);
        assert_ne!(poller.local_addr().as_socket().unwrap().port(), 0);
        assert!(poller.dispatch.queue().is_none());
    }

    #[test]
    fn test_inline_ticks_and_hangups() {
        let mut poller = Poller::init(
            3,
            &TcpLoopback,
            Dispatch::Inline,
            16,
            Duration::from_millis(1),
        )
        .unwrap();
        let addr = poller.local_addr().clone();

        let server = thread::spawn(move || {
            let stats = poller.run(2).unwrap();
            (stats, poller.state())
        });

        ping(&TcpLoopback, &addr, 3);
        ping(&TcpLoopback, &addr, 2);

        let (stats, state) = server.join().unwrap();
        assert_eq!(state, PollerState::Stopped);
        assert_eq!(stats.id, 3);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.ticks, 5);
        assert!(stats.histogram.total_waits() > 0);
    }

    #[test]
    fn test_queued_hangup_sends_deferred_close() {
        let queue = Arc::new(ExchangeQueue::new(16));
        let mut poller = Poller::init(
            0,
            &UnixAbstract,
            Dispatch::Queue(Arc::clone(&queue)),
            16,
            Duration::from_millis(1),
        )
        .unwrap();
        let addr = poller.local_addr().clone();

        let server = thread::spawn(move || poller.run(1).unwrap());

        let mut client = UnixAbstract.create_connecting_socket(&addr).unwrap();
        client.write_all(b"ping").unwrap();

        // Serve the request the way a worker would.
        match queue.pop() {
            Message::Ready(handle) => assert_eq!(worker::tick(&handle).unwrap(), Tick::Replied),
            other => panic!("unexpected: {}", other.kind()),
        }
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        drop(client);

        let stats = server.join().unwrap();
        assert_eq!(stats.closed, 1);
        assert!(matches!(queue.pop(), Message::DeferredClose(_)));
    }

    #[test]
    fn test_watch_follows_lifecycle() {
        let mut poller = Poller::init(
            1,
            &TcpLoopback,
            Dispatch::Inline,
            16,
            Duration::from_millis(1),
        )
        .unwrap();
        let addr = poller.local_addr().clone();
        let watch = poller.watch();
        assert_eq!(watch.get(), PollerState::Listening);

        let server = thread::spawn(move || poller.run(1).unwrap());

        // A served request proves the loop is live; the connection stays open.
        let mut client = TcpLoopback.create_connecting_socket(&addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(watch.get(), PollerState::Running);

        drop(client);
        server.join().unwrap();
        assert_eq!(watch.get(), PollerState::Stopped);
    }

    /// Local-domain endpoint bound to a filesystem path.
    struct PathUnix(std::path::PathBuf);

    impl Transport for PathUnix {
        fn name(&self) -> &'static str {
            "unix-path"
        }

        fn create_listening_endpoint(&self) -> io::Result<(Socket, SockAddr)> {
            let socket = Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
            socket.bind(&SockAddr::unix(&self.0)?)?;
            socket.listen(8)?;
            let bound = socket.local_addr()?;
            Ok((socket, bound))
        }

        fn create_connecting_socket(&self, addr: &SockAddr) -> io::Result<Socket> {
            let socket = Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
            socket.connect(addr)?;
            Ok(socket)
        }
    }

    #[test]
    fn test_drop_removes_endpoint_path() {
        let path = std::env::temp_dir().join(format!("pingpong-lb-poller-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let poller = Poller::init(
            0,
            &PathUnix(path.clone()),
            Dispatch::Inline,
            16,
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(path.exists());

        drop(poller);
        assert!(!path.exists());
    }
}
