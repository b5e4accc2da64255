//! Endpoint construction for pollers and load generators.
//!
//! Pollers and clients never build sockets themselves; they go through a
//! [`Transport`], so the same runtime drives loopback TCP and local-domain
//! stream sockets.

use crate::config::TransportKind;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Accept backlog for listening endpoints.
const LISTEN_BACKLOG: i32 = 128;

/// Creates the two ends of every connection.
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Bind and listen on a fresh local endpoint, returning the socket and
    /// the address clients should connect to.
    fn create_listening_endpoint(&self) -> io::Result<(Socket, SockAddr)>;

    /// Open a blocking socket connected to `addr`.
    fn create_connecting_socket(&self, addr: &SockAddr) -> io::Result<Socket>;
}

/// Select the transport named by the configuration.
pub fn from_kind(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => Arc::new(TcpLoopback),
        TransportKind::Unix => Arc::new(UnixAbstract),
    }
}

/// Human-readable endpoint for logs.
pub fn describe(addr: &SockAddr) -> String {
    match addr.as_socket() {
        Some(addr) => addr.to_string(),
        None => format!("unix(len={})", addr.len()),
    }
}

/// IPv4 loopback on an ephemeral port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpLoopback;

impl Transport for TcpLoopback {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn create_listening_endpoint(&self) -> io::Result<(Socket, SockAddr)> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        // Port 0 above; read back the one the kernel picked.
        let bound = socket.local_addr()?;
        Ok((socket, bound))
    }

    fn create_connecting_socket(&self, addr: &SockAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.connect(addr)?;
        Ok(socket)
    }
}

/// Local-domain stream sockets with a kernel-chosen name.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixAbstract;

impl Transport for UnixAbstract {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn create_listening_endpoint(&self) -> io::Result<(Socket, SockAddr)> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&unix_bind_addr()?)?;
        socket.listen(LISTEN_BACKLOG)?;

        let bound = socket.local_addr()?;
        Ok((socket, bound))
    }

    fn create_connecting_socket(&self, addr: &SockAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.connect(addr)?;
        Ok(socket)
    }
}

/// An address holding only the family, which makes Linux autobind the socket
/// to a unique abstract name.
#[cfg(target_os = "linux")]
fn unix_bind_addr() -> io::Result<SockAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
    let len = std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t;
    // Safety: storage is a zeroed AF_UNIX address and len covers only the
    // family field, which is the documented autobind request.
    Ok(unsafe { SockAddr::new(storage, len) })
}

/// No autobind outside Linux: use a unique path in the temp directory. The
/// poller that owns the endpoint removes the path when it is dropped.
#[cfg(not(target_os = "linux"))]
fn unix_bind_addr() -> io::Result<SockAddr> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let name = format!(
        "pingpong-lb-{}-{}.sock",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    let path = std::env::temp_dir().join(name);
    let _ = std::fs::remove_file(&path);
    SockAddr::unix(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn round_trip(transport: &dyn Transport) {
        let (listener, addr) = transport.create_listening_endpoint().unwrap();
        let mut client = transport.create_connecting_socket(&addr).unwrap();
        let (mut server, _peer) = listener.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_tcp_loopback_ephemeral_port() {
        let (_listener, addr) = TcpLoopback.create_listening_endpoint().unwrap();
        let addr = addr.as_socket().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        round_trip(&TcpLoopback);
    }

    #[test]
    fn test_unix_endpoints_coexist() {
        // Two autobound listeners must not collide on a name.
        let (_a, addr_a) = UnixAbstract.create_listening_endpoint().unwrap();
        let (_b, _addr_b) = UnixAbstract.create_listening_endpoint().unwrap();
        assert!(addr_a.as_socket().is_none());
        round_trip(&UnixAbstract);
    }

    #[test]
    fn test_from_kind() {
        assert_eq!(from_kind(TransportKind::Tcp).name(), "tcp");
        assert_eq!(from_kind(TransportKind::Unix).name(), "unix");
    }
}
