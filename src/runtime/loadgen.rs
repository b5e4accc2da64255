//! Client-side load generator.
//!
//! Each client thread opens its connections round-robin across the published
//! endpoints and keeps exactly one request in flight per connection: a reply
//! puts the connection back on the send queue until it has collected its
//! quota. A connection that met its quota is deregistered, and readiness on a
//! connection with nothing in flight is ignored, so a peer closing a finished
//! connection never stalls or fails the run. Closing every socket at the end
//! is what lets the pollers reach their expected closure counts.

use crate::error::{Error, Result};
use crate::protocol::{self, TOKEN_LEN};
use crate::runtime::stats::ClientStats;
use crate::runtime::transport::Transport;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{SockAddr, Socket};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, info};

struct ClientConnection {
    socket: Socket,
    replies: usize,
    in_flight: bool,
}

/// Load generator settings shared by every client thread.
#[derive(Debug, Clone, Copy)]
pub struct LoadProfile {
    /// Connections per client.
    pub connections: usize,
    /// Requests per connection.
    pub messages: usize,
    pub max_events: usize,
    pub timeout: Duration,
}

/// One client thread's connections and multiplexer.
pub struct Client {
    id: usize,
    poll: Poll,
    events: Events,
    connections: Vec<ClientConnection>,
    profile: LoadProfile,
}

impl Client {
    /// Connect `profile.connections` sockets, connection `i` going to
    /// `endpoints[i % endpoints.len()]`.
    pub fn connect(
        id: usize,
        transport: &dyn Transport,
        endpoints: &[SockAddr],
        profile: LoadProfile,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::setup(
                "connect client",
                io::Error::new(io::ErrorKind::InvalidInput, "no endpoints published"),
            ));
        }

        let poll = Poll::new().map_err(|e| Error::setup("create poll", e))?;
        let mut connections = Vec::with_capacity(profile.connections);

        for i in 0..profile.connections {
            let socket = transport
                .create_connecting_socket(&endpoints[i % endpoints.len()])
                .map_err(|e| Error::setup("connect", e))?;
            poll.registry()
                .register(&mut SourceFd(&socket.as_raw_fd()), Token(i), Interest::READABLE)
                .map_err(|e| Error::setup("register client connection", e))?;
            connections.push(ClientConnection {
                socket,
                replies: 0,
                in_flight: false,
            });
        }

        debug!(client = id, connections = connections.len(), "Client connected");

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(profile.max_events),
            connections,
            profile,
        })
    }

    /// Drive every connection to its quota, then close them all.
    pub fn run(mut self) -> Result<ClientStats> {
        let target = (self.connections.len() * self.profile.messages) as u64;
        let mut pending: VecDeque<usize> = (0..self.connections.len()).collect();
        let mut total = 0u64;

        if self.profile.messages == 0 {
            pending.clear();
        }

        while total < target {
            while let Some(i) = pending.pop_front() {
                let conn = &mut self.connections[i];
                let written = (&conn.socket)
                    .write(protocol::REQUEST)
                    .map_err(|e| Error::io("write request", e))?;
                if written != TOKEN_LEN {
                    return Err(Error::io(
                        "write request",
                        io::Error::new(io::ErrorKind::WriteZero, "short write"),
                    ));
                }
                conn.in_flight = true;
            }

            match self.poll.poll(&mut self.events, Some(self.profile.timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("poll wait", e)),
            }

            for event in self.events.iter() {
                let Token(i) = event.token();
                let conn = &mut self.connections[i];
                if !conn.in_flight {
                    // Finished or between sends: a hangup here is expected.
                    continue;
                }

                let mut buf = [0u8; TOKEN_LEN];
                let n = (&conn.socket)
                    .read(&mut buf)
                    .map_err(|e| Error::io("read reply", e))?;
                if n == 0 {
                    return Err(Error::PeerClosed);
                }
                protocol::check_response(&buf[..n])?;

                conn.in_flight = false;
                conn.replies += 1;
                total += 1;
                if conn.replies < self.profile.messages {
                    pending.push_back(i);
                } else {
                    self.poll
                        .registry()
                        .deregister(&mut SourceFd(&conn.socket.as_raw_fd()))
                        .map_err(|e| Error::io("deregister client connection", e))?;
                    debug!(client = self.id, connection = i, "Connection reached quota");
                }
            }
        }

        info!(client = self.id, replies = total, "Client finished");

        let stats = ClientStats {
            id: self.id,
            connections: self.connections.len(),
            replies: total,
        };
        // Dropping the sockets closes them; pollers count these hangups.
        drop(self.connections);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::TcpLoopback;
    use std::thread;

    fn profile(connections: usize, messages: usize) -> LoadProfile {
        LoadProfile {
            connections,
            messages,
            max_events: 16,
            timeout: Duration::from_millis(1),
        }
    }

    fn answer(mut socket: &Socket, reply: &[u8; 4]) {
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        socket.write_all(reply).unwrap();
    }

    /// Wait for the client to close its end.
    fn await_eof(mut socket: &Socket) {
        let mut buf = [0u8; 4];
        while socket.read(&mut buf).unwrap() != 0 {}
    }

    /// Blocking echo of `reply` for `rounds` requests on each accepted socket,
    /// holding every socket open until the client hangs up.
    fn serve(listener: Socket, connections: usize, rounds: usize, reply: &'static [u8; 4]) {
        let accepted: Vec<Socket> = (0..connections).map(|_| listener.accept().unwrap().0).collect();
        for _ in 0..rounds {
            for socket in &accepted {
                answer(socket, reply);
            }
        }
        for socket in &accepted {
            await_eof(socket);
        }
    }

    #[test]
    fn test_client_round_robin_and_quota() {
        let (listener, addr) = TcpLoopback.create_listening_endpoint().unwrap();
        let server = thread::spawn(move || serve(listener, 3, 4, b"pong"));

        let client = Client::connect(7, &TcpLoopback, &[addr], profile(3, 4)).unwrap();
        let stats = client.run().unwrap();
        server.join().unwrap();

        assert_eq!(stats.id, 7);
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.replies, 12);
    }

    #[test]
    fn test_client_rejects_bad_reply() {
        let (listener, addr) = TcpLoopback.create_listening_endpoint().unwrap();
        let server = thread::spawn(move || serve(listener, 1, 1, b"ping"));

        let client = Client::connect(0, &TcpLoopback, &[addr], profile(1, 2)).unwrap();
        assert!(matches!(client.run(), Err(Error::Protocol(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_server_closing_finished_connection() {
        let (listener, addr) = TcpLoopback.create_listening_endpoint().unwrap();
        let server = thread::spawn(move || {
            let first = listener.accept().unwrap().0;
            let second = listener.accept().unwrap().0;

            answer(&first, b"pong");
            // Let the reply and the FIN reach the client as separate events.
            thread::sleep(Duration::from_millis(20));
            drop(first);
            thread::sleep(Duration::from_millis(20));

            answer(&second, b"pong");
            await_eof(&second);
        });

        let client = Client::connect(1, &TcpLoopback, &[addr], profile(2, 1)).unwrap();
        let stats = client.run().unwrap();
        server.join().unwrap();

        assert_eq!(stats.replies, 2);
    }

    #[test]
    fn test_client_needs_endpoints() {
        assert!(Client::connect(0, &TcpLoopback, &[], profile(1, 1)).is_err());
    }
}
