//! Server-side connections owned by a poller.
//!
//! The poller keeps every accepted socket in a slab keyed by its readiness
//! token. Workers only ever borrow a connection for one protocol tick, through
//! a cloned [`Handle`]; the socket closes when the last handle is dropped.

use slab::Slab;
use socket2::{SockAddr, Socket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// Shared reference to an accepted socket.
pub type Handle = Arc<Socket>;

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    handle: Handle,
    peer: SockAddr,
}

impl Connection {
    pub fn new(socket: Socket, peer: SockAddr) -> Self {
        Self {
            handle: Arc::new(socket),
            peer,
        }
    }

    /// Descriptor used for readiness registration.
    pub fn fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }

    pub fn socket(&self) -> &Socket {
        &self.handle
    }

    /// Clone of the handle to pass to a worker.
    pub fn handle(&self) -> Handle {
        Arc::clone(&self.handle)
    }

    /// Give up the poller's reference.
    pub fn into_handle(self) -> Handle {
        self.handle
    }

    /// Address the client connected from.
    pub fn peer(&self) -> &SockAddr {
        &self.peer
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    accepted: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            accepted: 0,
        }
    }

    /// Make room for `expected` more connections.
    pub fn reserve(&mut self, expected: usize) {
        self.connections.reserve(expected);
    }

    pub fn capacity(&self) -> usize {
        self.connections.capacity()
    }

    /// Insert a new connection and return its key.
    pub fn insert(&mut self, conn: Connection) -> usize {
        self.accepted += 1;
        self.connections.insert(conn)
    }

    pub fn get(&self, key: usize) -> Option<&Connection> {
        self.connections.get(key)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, key: usize) -> Option<Connection> {
        self.connections.try_remove(key)
    }

    /// Remove every remaining connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections inserted over the registry's lifetime.
    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Type};

    fn pair() -> (Socket, Socket) {
        Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap()
    }

    fn unnamed() -> SockAddr {
        SockAddr::unix("/tmp/pingpong-lb-test.sock").unwrap()
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new();

        let (a, _a_peer) = pair();
        let (b, _b_peer) = pair();
        let a_fd = a.as_raw_fd();

        let id1 = registry.insert(Connection::new(a, unnamed()));
        let id2 = registry.insert(Connection::new(b, unnamed()));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id1).unwrap().fd(), a_fd);

        let removed = registry.remove(id1).unwrap();
        assert_eq!(removed.fd(), a_fd);
        assert!(registry.get(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.accepted(), 2);

        assert_eq!(registry.drain().count(), 1);
        assert!(registry.get(id2).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserve_for_expected_connections() {
        let mut registry = ConnectionRegistry::new();
        assert_eq!(registry.capacity(), 0);

        registry.reserve(100);
        assert!(registry.capacity() >= 100);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_outlives_registry_entry() {
        let mut registry = ConnectionRegistry::new();
        let (a, _peer) = pair();
        let key = registry.insert(Connection::new(a, unnamed()));

        let lent = registry.get(key).unwrap().handle();
        let owned = registry.remove(key).unwrap().into_handle();

        // Descriptor stays open until the worker drops its copy too.
        assert_eq!(Arc::strong_count(&owned), 2);
        drop(lent);
        assert_eq!(Arc::strong_count(&owned), 1);
    }
}
