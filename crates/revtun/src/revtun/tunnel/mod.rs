//! Reverse tunnel: one authenticated control connection per client carries any number of
//! logical TCP connections, keyed by connection id.
//!
//! The server owns the public ports and picks a client session for each accepted socket; the
//! client dials the local service named by `TunnelOpen` and relays bytes both ways.

pub mod client;
pub mod links;
pub mod manager;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod server;
pub mod transport;
