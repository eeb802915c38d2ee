//! Listener: accept loop, per-connection keepalive, and graceful shutdown
//! (§4.6, §5).

pub mod listener;

pub use listener::Listener;
