//! Connection state and the connection table.
//!
//! Each connection owns its socket, its inbound `LineBuffer`, any reply
//! bytes the socket could not take yet, and the liveness bookkeeping the
//! keepalive supervisor works from.

use crate::error::ServerError;
use crate::runtime::buffer::LineBuffer;
use bytes::{Buf, Bytes, BytesMut};
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// Upper bound on reply bytes queued for a socket that is not writable.
pub const MAX_OUTBOUND_BYTES: usize = 64 * 1024;

/// Accepted client socket, TCP or Unix domain.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

/// Result of one read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes arrived; these lines are now complete (possibly none).
    Lines(Vec<Bytes>),
    /// Nothing to read right now.
    WouldBlock,
    /// Peer closed its end.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    identity: String,
    inbound: LineBuffer,
    outbound: BytesMut,
    /// WRITABLE interest is armed while `outbound` is non-empty.
    writable: bool,
    last_seen: Instant,
    awaiting_pong: bool,
}

impl Connection {
    fn new(stream: Stream, identity: String, max_line_bytes: usize, now: Instant) -> Self {
        Self {
            stream,
            identity,
            inbound: LineBuffer::new(max_line_bytes),
            outbound: BytesMut::new(),
            writable: false,
            last_seen: now,
            awaiting_pong: false,
        }
    }

    /// `<address>:<port>` of the peer, or `unix:<handle>`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// Record that a keepalive probe is outstanding.
    pub fn probe_sent(&mut self) {
        self.awaiting_pong = true;
    }

    /// Record a `pong` from the client.
    pub fn pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    /// Bytes queued for writing.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Read once from the socket and frame what arrived.
    ///
    /// Reads at most as many bytes as the line buffer can take, so
    /// framing never overruns. Any received byte counts as liveness.
    pub fn read_lines(&mut self, scratch: &mut [u8], now: Instant) -> io::Result<ReadOutcome> {
        let spare = self.inbound.spare().min(scratch.len());
        let n = loop {
            match self.stream.read(&mut scratch[..spare]) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        let lines = self
            .receive(&scratch[..n], now)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(ReadOutcome::Lines(lines))
    }

    /// Feed bytes into the line buffer and collect the completed lines.
    pub fn receive(&mut self, data: &[u8], now: Instant) -> Result<Vec<Bytes>, ServerError> {
        let lines = self.inbound.feed(data)?.collect();
        self.last_seen = now;
        self.awaiting_pong = false;
        Ok(lines)
    }

    /// Write `data`, queueing whatever the socket does not accept.
    ///
    /// Returns `true` when bytes are left queued.
    fn send(&mut self, data: &[u8]) -> io::Result<bool> {
        if self.outbound.is_empty() {
            let written = write_nonblocking(&mut self.stream, data)?;
            if written == data.len() {
                return Ok(false);
            }
            self.queue(&data[written..])?;
        } else {
            self.queue(data)?;
        }
        Ok(true)
    }

    fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        if self.outbound.len() + data.len() > MAX_OUTBOUND_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "outbound queue full",
            ));
        }
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    /// Push queued bytes to the socket. Returns `true` once drained.
    fn flush_outbound(&mut self) -> io::Result<bool> {
        let written = write_nonblocking(&mut self.stream, &self.outbound)?;
        self.outbound.advance(written);
        Ok(self.outbound.is_empty())
    }
}

/// Write as much of `data` as the socket takes without blocking.
fn write_nonblocking(stream: &mut Stream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Table of live connections, keyed by handle.
///
/// A handle is registered with the poll registry exactly as long as its
/// connection is in the table.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    registry: Registry,
    max_connections: usize,
    max_line_bytes: usize,
}

impl ConnectionTable {
    /// Create a table registering its sockets with `registry`.
    pub fn new(registry: Registry, max_connections: usize, max_line_bytes: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            registry,
            max_connections,
            max_line_bytes,
        }
    }

    /// Take ownership of an accepted socket.
    ///
    /// On `CapacityExceeded` the stream is dropped (closed) and the table
    /// is left untouched.
    pub fn register(
        &mut self,
        mut stream: Stream,
        peer: Option<SocketAddr>,
        now: Instant,
    ) -> Result<usize, ServerError> {
        if self.connections.len() >= self.max_connections {
            return Err(ServerError::CapacityExceeded(self.max_connections));
        }

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        self.registry
            .register(&mut stream, Token(conn_id), Interest::READABLE)?;

        let identity = match peer {
            Some(addr) => format!("{}:{}", addr.ip(), addr.port()),
            None => format!("unix:{conn_id}"),
        };
        entry.insert(Connection::new(stream, identity, self.max_line_bytes, now));
        Ok(conn_id)
    }

    pub fn get(&self, conn_id: usize) -> Option<&Connection> {
        self.connections.get(conn_id)
    }

    pub fn get_mut(&mut self, conn_id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(conn_id)
    }

    pub fn contains(&self, conn_id: usize) -> bool {
        self.connections.contains(conn_id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    /// Deregister, close and free a connection.
    ///
    /// Returns `false` if the handle was not live. Calling it twice is
    /// harmless.
    pub fn unregister(&mut self, conn_id: usize) -> bool {
        match self.connections.try_remove(conn_id) {
            Some(mut conn) => {
                let _ = self.registry.deregister(&mut conn.stream);
                debug!(conn_id, peer = %conn.identity, "Connection closed");
                true
            }
            None => false,
        }
    }

    /// Push any queued output once more, then unregister.
    ///
    /// The final flush does not block: whatever the socket still refuses
    /// is dropped with the connection.
    pub fn close(&mut self, conn_id: usize) -> bool {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            if !conn.outbound.is_empty() {
                match conn.flush_outbound() {
                    Ok(true) => {}
                    Ok(false) => debug!(
                        conn_id,
                        unsent = conn.pending_output(),
                        "Closing with unsent output"
                    ),
                    Err(e) => debug!(conn_id, error = %e, "Final flush failed"),
                }
            }
        }
        self.unregister(conn_id)
    }

    /// Write to one connection, arming WRITABLE interest if bytes remain.
    pub fn send(&mut self, conn_id: usize, data: &[u8]) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        if conn.send(data)? && !conn.writable {
            self.registry.reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE | Interest::WRITABLE,
            )?;
            conn.writable = true;
        }
        Ok(())
    }

    /// Write to one connection; a failed write tears it down.
    ///
    /// Returns whether the connection is still live.
    pub fn deliver(&mut self, conn_id: usize, data: &[u8]) -> bool {
        match self.send(conn_id, data) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id, error = %e, "Write failed");
                self.unregister(conn_id);
                false
            }
        }
    }

    /// Deliver `data` to every live connection in handle order.
    ///
    /// Recipients whose write fails are disconnected; the fan-out goes on.
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        let mut delivered = 0;
        for conn_id in self.handles() {
            if self.deliver(conn_id, data) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drain queued output after a writable event.
    pub fn flush(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if conn.outbound.is_empty() {
            return Ok(());
        }

        if conn.flush_outbound()? && conn.writable {
            self.registry
                .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
            conn.writable = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::time::Duration;

    /// A server-side `Stream` plus the blocking client end.
    fn stream_pair() -> (Stream, StdUnixStream) {
        let (server, client) = StdUnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (Stream::Unix(UnixStream::from_std(server)), client)
    }

    fn table(poll: &Poll, max_connections: usize) -> ConnectionTable {
        ConnectionTable::new(poll.registry().try_clone().unwrap(), max_connections, 4096)
    }

    fn read_exact(client: &mut StdUnixStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_register_and_lookup() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, _client) = stream_pair();

        let id = table
            .register(stream, Some("10.1.2.3:4567".parse().unwrap()), Instant::now())
            .unwrap();

        assert_eq!(table.len(), 1);
        assert!(table.contains(id));
        let conn = table.get(id).unwrap();
        assert_eq!(conn.identity(), "10.1.2.3:4567");
        assert!(!conn.awaiting_pong());
    }

    #[test]
    fn test_unix_identity_uses_handle() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, _client) = stream_pair();

        let id = table.register(stream, None, Instant::now()).unwrap();
        assert_eq!(table.get(id).unwrap().identity(), format!("unix:{id}"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 2);
        let (s1, _c1) = stream_pair();
        let (s2, _c2) = stream_pair();
        let (s3, mut c3) = stream_pair();

        table.register(s1, None, Instant::now()).unwrap();
        table.register(s2, None, Instant::now()).unwrap();
        let err = table.register(s3, None, Instant::now()).unwrap_err();

        assert!(matches!(err, ServerError::CapacityExceeded(2)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.capacity(), 2);

        // Rejected stream was closed
        let mut buf = [0u8; 1];
        assert_eq!(c3.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, mut client) = stream_pair();

        let id = table.register(stream, None, Instant::now()).unwrap();
        assert!(table.unregister(id));
        assert!(!table.unregister(id));
        assert!(table.is_empty());

        // Handle is closed
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_handle_reused_after_teardown() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (s1, _c1) = stream_pair();
        let (s2, _c2) = stream_pair();

        let id1 = table.register(s1, None, Instant::now()).unwrap();
        table.unregister(id1);
        let id2 = table.register(s2, None, Instant::now()).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_send_and_broadcast() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (s1, mut c1) = stream_pair();
        let (s2, mut c2) = stream_pair();

        let id1 = table.register(s1, None, Instant::now()).unwrap();
        table.register(s2, None, Instant::now()).unwrap();

        assert!(table.deliver(id1, b"pong\n"));
        assert_eq!(read_exact(&mut c1, 5), b"pong\n");

        assert_eq!(table.broadcast(b"broadcast x hi\n"), 2);
        assert_eq!(read_exact(&mut c1, 15), b"broadcast x hi\n");
        assert_eq!(read_exact(&mut c2, 15), b"broadcast x hi\n");
    }

    #[test]
    fn test_broadcast_drops_failed_recipient() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (s1, mut c1) = stream_pair();
        let (s2, c2) = stream_pair();
        let (s3, mut c3) = stream_pair();

        table.register(s1, None, Instant::now()).unwrap();
        let id2 = table.register(s2, None, Instant::now()).unwrap();
        table.register(s3, None, Instant::now()).unwrap();
        drop(c2);

        assert_eq!(table.broadcast(b"hi\n"), 2);
        assert!(!table.contains(id2));
        assert_eq!(table.len(), 2);
        assert_eq!(read_exact(&mut c1, 3), b"hi\n");
        assert_eq!(read_exact(&mut c3, 3), b"hi\n");
    }

    #[test]
    fn test_receive_updates_liveness() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, _client) = stream_pair();
        let start = Instant::now();

        let id = table.register(stream, None, start).unwrap();
        let conn = table.get_mut(id).unwrap();
        conn.probe_sent();
        assert!(conn.awaiting_pong());

        // A partial line still counts as activity
        let later = start + Duration::from_secs(3);
        assert!(conn.receive(b"pin", later).unwrap().is_empty());
        assert!(!conn.awaiting_pong());
        assert_eq!(conn.last_seen(), later);

        let lines = conn.receive(b"g\r\n", later).unwrap();
        assert_eq!(lines, vec![Bytes::from("ping")]);
    }

    #[test]
    fn test_read_lines() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, mut client) = stream_pair();
        let id = table.register(stream, None, Instant::now()).unwrap();
        let mut scratch = vec![0u8; 4096];

        let conn = table.get_mut(id).unwrap();
        assert!(matches!(
            conn.read_lines(&mut scratch, Instant::now()).unwrap(),
            ReadOutcome::WouldBlock
        ));

        client.write_all(b"ping\npong\n").unwrap();
        match conn.read_lines(&mut scratch, Instant::now()).unwrap() {
            ReadOutcome::Lines(lines) => {
                assert_eq!(lines, vec![Bytes::from("ping"), Bytes::from("pong")])
            }
            other => panic!("unexpected: {:?}", other),
        }

        drop(client);
        assert!(matches!(
            conn.read_lines(&mut scratch, Instant::now()).unwrap(),
            ReadOutcome::Closed
        ));
    }

    #[test]
    fn test_outbound_queue_and_flush() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, mut client) = stream_pair();
        let id = table.register(stream, None, Instant::now()).unwrap();

        // Fill the socket buffer until writes start queueing
        let chunk = vec![b'x'; 1024];
        let mut sent = 0;
        while table.get(id).unwrap().pending_output() == 0 {
            table.send(id, &chunk).unwrap();
            sent += chunk.len();
        }

        // Drain the client side, then flush the queue
        let mut received = 0;
        let mut buf = vec![0u8; 64 * 1024];
        while received < sent {
            table.flush(id).unwrap();
            received += client.read(&mut buf).unwrap();
        }
        assert_eq!(received, sent);
        assert_eq!(table.get(id).unwrap().pending_output(), 0);
    }

    #[test]
    fn test_close_flushes_queued_output() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, mut client) = stream_pair();
        let id = table.register(stream, None, Instant::now()).unwrap();

        let chunk = vec![b'x'; 1024];
        let mut sent = 0;
        while table.get(id).unwrap().pending_output() == 0 {
            table.send(id, &chunk).unwrap();
            sent += chunk.len();
        }
        let queued = table.get(id).unwrap().pending_output();

        // Make room in the socket, then close with output still queued
        let in_socket = read_exact(&mut client, sent - queued);
        assert_eq!(in_socket.len(), sent - queued);
        assert!(table.close(id));
        assert!(!table.contains(id));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), queued);
    }

    #[test]
    fn test_close_without_queued_output() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, mut client) = stream_pair();
        let id = table.register(stream, None, Instant::now()).unwrap();

        assert!(table.deliver(id, b"bye\n"));
        assert!(table.close(id));
        assert!(!table.close(id));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bye\n");
    }

    #[test]
    fn test_outbound_queue_overflow_is_write_error() {
        let poll = Poll::new().unwrap();
        let mut table = table(&poll, 4);
        let (stream, _client) = stream_pair();
        let id = table.register(stream, None, Instant::now()).unwrap();

        let chunk = vec![b'x'; 4096];
        let mut live = true;
        for _ in 0..1024 {
            live = table.deliver(id, &chunk);
            if !live {
                break;
            }
        }
        assert!(!live);
        assert!(!table.contains(id));
    }
}
