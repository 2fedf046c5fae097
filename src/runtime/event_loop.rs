//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A single thread owns the listener and the connection table. Each
//! iteration waits at most one tick, services every ready handle (the
//! listener first, then connections in ascending handle order) and then
//! runs one keepalive pass.
//!
//! A connection gets at most `READS_PER_EVENT` reads per iteration. One
//! that still had data is carried into the next iteration, which then
//! polls without waiting, since edge-triggered readiness will not report
//! it again.

use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::{self, Action, Response};
use crate::runtime::connection::{ConnectionTable, ReadOutcome};
use crate::runtime::keepalive::{self, KeepalivePolicy};
use crate::runtime::listener::{create_listener, Listener};
use bytes::Bytes;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

/// Reads serviced per connection per iteration.
const READS_PER_EVENT: usize = 4;

/// Stops a running `Server` from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the event loop to return at its next wakeup.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Ready work for one connection in one iteration.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    conn_id: usize,
    readable: bool,
    writable: bool,
}

/// Server context: listener, connection table and loop settings.
pub struct Server {
    poll: Poll,
    listener: Listener,
    table: ConnectionTable,
    shutdown: ShutdownHandle,
    keepalive: KeepalivePolicy,
    tick: Duration,
    scratch: Vec<u8>,
    /// Connections left readable at the end of the last iteration.
    unread: Vec<usize>,
}

impl Server {
    /// Create the listener described by `config` and set up the loop.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener = create_listener(&config.listen, &config.host, config.backlog)?;
        Self::with_listener(listener, config)
    }

    /// Set up the loop around an already listening socket.
    pub fn with_listener(mut listener: Listener, config: &Config) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let table = ConnectionTable::new(
            poll.registry().try_clone()?,
            config.max_connections,
            config.max_line_bytes,
        );

        Ok(Self {
            poll,
            listener,
            table,
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            keepalive: KeepalivePolicy {
                ping_after: config.ping_after,
                timeout: config.timeout,
            },
            tick: config.tick,
            scratch: vec![0u8; config.max_line_bytes],
            unread: Vec::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.listener.path()
    }

    /// Number of connected clients.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Run until shutdown is requested.
    ///
    /// Only a failing readiness wait ends the loop with an error; every
    /// per-connection failure is handled by dropping that connection.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut ready: Vec<Readiness> = Vec::with_capacity(EVENTS_CAPACITY);

        info!(
            max_connections = self.table.capacity(),
            ping_after = ?self.keepalive.ping_after,
            timeout = ?self.keepalive.timeout,
            "Event loop started"
        );

        loop {
            let timeout = if self.unread.is_empty() {
                self.tick
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(ServerError::Poll(e));
            }

            if self.shutdown.requested.load(Ordering::Acquire) {
                info!(connections = self.connections(), "Shutdown requested");
                return Ok(());
            }

            let mut accept_ready = false;
            ready.clear();
            ready.extend(self.unread.drain(..).map(|conn_id| Readiness {
                conn_id,
                readable: true,
                writable: false,
            }));
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_ready = true,
                    WAKER_TOKEN => {}
                    Token(conn_id) => ready.push(Readiness {
                        conn_id,
                        readable: event.is_readable()
                            || event.is_read_closed()
                            || event.is_error(),
                        writable: event.is_writable(),
                    }),
                }
            }
            merge_readiness(&mut ready);

            if accept_ready {
                self.accept_connections();
            }

            for r in &ready {
                if r.writable {
                    self.handle_writable(r.conn_id);
                }
                if r.readable && self.handle_readable(r.conn_id) {
                    self.unread.push(r.conn_id);
                }
            }

            let stats = keepalive::sweep(&mut self.table, Instant::now(), &self.keepalive);
            if stats.probed > 0 || stats.evicted > 0 {
                debug!(
                    probed = stats.probed,
                    evicted = stats.evicted,
                    "Keepalive pass"
                );
            }
        }
    }

    /// Close the listener, remove its socket path and drop every client.
    pub fn shutdown(self) {
        let Server {
            table, listener, ..
        } = self;
        let clients = table.len();
        drop(table);
        listener.close();
        info!(clients, "Server stopped");
    }

    fn accept_connections(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "accept() failed");
                    break;
                }
            };

            match self.table.register(stream, peer, Instant::now()) {
                Ok(conn_id) => {
                    debug!(
                        conn_id,
                        peer = %self.table.get(conn_id).map_or("", |c| c.identity()),
                        "Accepted connection"
                    );
                    self.table.deliver(conn_id, Response::ping());
                }
                Err(ServerError::CapacityExceeded(limit)) => {
                    warn!(limit, "Connection limit reached, rejecting client");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register connection");
                }
            }
        }
    }

    fn handle_writable(&mut self, conn_id: usize) {
        if let Err(e) = self.table.flush(conn_id) {
            debug!(conn_id, error = %e, "Write failed");
            self.table.unregister(conn_id);
        }
    }

    /// Read from the socket, dispatching each complete line as it is framed.
    ///
    /// Returns `true` when the read budget ran out before the socket was
    /// drained.
    fn handle_readable(&mut self, conn_id: usize) -> bool {
        for _ in 0..READS_PER_EVENT {
            let Some(conn) = self.table.get_mut(conn_id) else {
                return false;
            };

            match conn.read_lines(&mut self.scratch, Instant::now()) {
                Ok(ReadOutcome::WouldBlock) => return false,
                Ok(ReadOutcome::Closed) => {
                    trace!(conn_id, "Peer closed connection");
                    self.table.unregister(conn_id);
                    return false;
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "Read failed");
                    self.table.unregister(conn_id);
                    return false;
                }
                Ok(ReadOutcome::Lines(lines)) => {
                    for line in lines {
                        if !self.dispatch(conn_id, &line) {
                            return false;
                        }
                    }
                }
            }
        }
        self.table.contains(conn_id)
    }

    /// Interpret one line and carry out its actions in order.
    ///
    /// Returns whether the sender is still connected.
    fn dispatch(&mut self, conn_id: usize, line: &Bytes) -> bool {
        let actions = match self.table.get(conn_id) {
            Some(conn) => {
                trace!(conn_id, line = %String::from_utf8_lossy(line), "Processing command");
                protocol::interpret(conn.identity(), line)
            }
            None => return false,
        };

        for action in actions {
            match action {
                Action::Reply(reply) => {
                    if !self.table.deliver(conn_id, &reply) {
                        return false;
                    }
                }
                Action::Broadcast(message) => {
                    let delivered = self.table.broadcast(&message);
                    trace!(conn_id, delivered, "Broadcast sent");
                    if !self.table.contains(conn_id) {
                        return false;
                    }
                }
                Action::Close => {
                    self.table.close(conn_id);
                    return false;
                }
                Action::MarkAlive => {
                    if let Some(conn) = self.table.get_mut(conn_id) {
                        conn.pong_received();
                    }
                }
            }
        }
        true
    }
}

/// Sort by handle and fold duplicate events for the same handle together.
fn merge_readiness(ready: &mut Vec<Readiness>) {
    ready.sort_unstable_by_key(|r| r.conn_id);
    ready.dedup_by(|later, earlier| {
        if later.conn_id == earlier.conn_id {
            earlier.readable |= later.readable;
            earlier.writable |= later.writable;
            true
        } else {
            false
        }
    });
}
