//! Broadcast line protocol parser and response generator.
//!
//! Commands (one per line, case-sensitive):
//! - `ping` - answered with `pong`
//! - `pong` - acknowledges a server probe, no answer
//! - `quit` - answered with `bye`, then the connection is closed
//! - `broadcast <msg>` - relayed to every connected client
//!
//! Anything else is answered with the `unknown` help line.

use bytes::{BufMut, Bytes, BytesMut};

/// A framed line split into command name and optional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: &'a [u8],
    /// `Some(b"")` when the name is followed by spaces only.
    pub argument: Option<&'a [u8]>,
}

/// Parsed protocol request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Ping,
    Pong,
    Quit,
    Broadcast(&'a [u8]),
    Unknown,
}

/// Effect of one line on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write to the sender.
    Reply(Bytes),
    /// Write to every live connection, sender included.
    Broadcast(Bytes),
    /// Tear down the sender's connection.
    Close,
    /// Clear the sender's outstanding keepalive probe.
    MarkAlive,
}

/// Server responses.
pub struct Response;

impl Response {
    pub fn ping() -> &'static [u8] {
        b"ping\n"
    }

    pub fn pong() -> &'static [u8] {
        b"pong\n"
    }

    pub fn bye() -> &'static [u8] {
        b"bye\n"
    }

    pub fn timed_out() -> &'static [u8] {
        b"bye Timed out, please respond to ping's.\n"
    }

    pub fn unknown() -> &'static [u8] {
        b"unknown Available commands: broadcast <msg>, ping, pong, quit.\n"
    }

    /// `broadcast <sender> <message>\n`
    pub fn broadcast(sender: &str, message: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + sender.len() + message.len());
        buf.put_slice(b"broadcast ");
        buf.put_slice(sender.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(message);
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

/// Split a line into name and argument.
///
/// Leading spaces are skipped, the name runs up to the first space, and
/// the whole run of spaces after it separates it from the argument.
pub fn parse(line: &[u8]) -> Command<'_> {
    let start = line.iter().position(|&b| b != b' ').unwrap_or(line.len());
    let line = &line[start..];

    match line.iter().position(|&b| b == b' ') {
        None => Command {
            name: line,
            argument: None,
        },
        Some(end) => {
            let rest = &line[end..];
            let skip = rest.iter().position(|&b| b != b' ').unwrap_or(rest.len());
            Command {
                name: &line[..end],
                argument: Some(&rest[skip..]),
            }
        }
    }
}

impl<'a> Command<'a> {
    pub fn request(&self) -> Request<'a> {
        match (self.name, self.argument) {
            (b"ping", _) => Request::Ping,
            (b"pong", _) => Request::Pong,
            (b"quit", _) => Request::Quit,
            (b"broadcast", Some(message)) => Request::Broadcast(message),
            _ => Request::Unknown,
        }
    }
}

/// Interpret one line received from `sender`.
pub fn interpret(sender: &str, line: &[u8]) -> Vec<Action> {
    match parse(line).request() {
        Request::Ping => vec![Action::Reply(Bytes::from_static(Response::pong()))],
        Request::Pong => vec![Action::MarkAlive],
        Request::Quit => vec![
            Action::Reply(Bytes::from_static(Response::bye())),
            Action::Close,
        ],
        Request::Broadcast(message) => vec![Action::Broadcast(Response::broadcast(sender, message))],
        Request::Unknown => vec![Action::Reply(Bytes::from_static(Response::unknown()))],
    }
}
