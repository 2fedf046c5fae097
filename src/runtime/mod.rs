//! Connection multiplexing core.
//!
//! - `buffer`: per-connection line framing
//! - `connection`: connection state and the connection table
//! - `keepalive`: idle probing and eviction
//! - `listener`: TCP and Unix domain listening sockets
//! - `event_loop`: the mio readiness loop tying them together

mod buffer;
mod connection;
mod event_loop;
mod keepalive;
mod listener;

pub use event_loop::{Server, ShutdownHandle};
