//! Listening socket setup.
//!
//! Sockets are built with socket2 so bind and listen failures can be told
//! apart, then handed to mio in non-blocking mode.

use crate::config::ListenTarget;
use crate::error::ServerError;
use crate::runtime::connection::Stream;
use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The server's listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// Bind and listen on `target`.
///
/// TCP targets are bound on `host`; Unix targets ignore it.
pub fn create_listener(
    target: &ListenTarget,
    host: &str,
    backlog: i32,
) -> Result<Listener, ServerError> {
    match target {
        ListenTarget::Tcp(port) => {
            let ip: IpAddr = host.parse().map_err(|e| ServerError::Bind {
                target: format!("{host}:{port}"),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?;
            let addr = SocketAddr::new(ip, *port);
            let socket = bind_socket(
                Domain::for_address(addr),
                Some(Protocol::TCP),
                &addr.into(),
                &addr.to_string(),
                backlog,
            )?;
            Ok(Listener::Tcp(TcpListener::from_std(socket.into())))
        }
        ListenTarget::Unix(path) => {
            let display = path.display().to_string();
            let addr = SockAddr::unix(path).map_err(|source| ServerError::Bind {
                target: display.clone(),
                source,
            })?;
            let socket = bind_socket(Domain::UNIX, None, &addr, &display, backlog)?;
            Ok(Listener::Unix {
                listener: UnixListener::from_std(socket.into()),
                path: path.clone(),
            })
        }
    }
}

fn bind_socket(
    domain: Domain,
    protocol: Option<Protocol>,
    addr: &SockAddr,
    target: &str,
    backlog: i32,
) -> Result<Socket, ServerError> {
    let bind_err = |source: io::Error| ServerError::Bind {
        target: target.to_string(),
        source,
    };

    let socket = Socket::new(domain, Type::STREAM, protocol).map_err(bind_err)?;
    if domain != Domain::UNIX {
        socket.set_reuse_address(true).map_err(bind_err)?;
    }
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(backlog).map_err(|source| ServerError::Listen {
        target: target.to_string(),
        source,
    })?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket)
}

impl Listener {
    /// Accept one pending connection.
    ///
    /// The peer address is `None` for Unix domain clients.
    pub fn accept(&self) -> io::Result<(Stream, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Stream::Tcp(stream), Some(addr)))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                Ok((Stream::Unix(stream), None))
            }
        }
    }

    /// Bound TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Filesystem path, if this is a Unix listener.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Listener::Tcp(_) => None,
            Listener::Unix { path, .. } => Some(path),
        }
    }

    /// Close the socket and remove a Unix socket path from the filesystem.
    pub fn close(self) {
        if let Listener::Unix { listener, path } = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket path");
            }
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.register(registry, token, interests),
            Listener::Unix { listener, .. } => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.reregister(registry, token, interests),
            Listener::Unix { listener, .. } => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.deregister(registry),
            Listener::Unix { listener, .. } => listener.deregister(registry),
        }
    }
}
