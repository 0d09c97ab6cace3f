//! Net/IO layer: listeners, connections and network-level filter chains.
//!
//! Core model: a [`Listener`](listener::Listener) accepts sockets and wraps
//! each in a [`Connection`](connection::Connection) with a read task and a
//! write task. Filters subscribe to the byte stream; event listeners
//! subscribe to lifecycle edges.

pub mod connection;
pub mod filter;
pub mod listener;

pub use connection::{ConnState, Connection, ConnectionEvent, ConnectionEventListener};
pub use filter::{FilterStatus, ReadFilter, WriteFilter};
pub use listener::{FilterChainFactory, Listener, ListenerEventListener};
