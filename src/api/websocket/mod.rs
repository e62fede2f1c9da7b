//! WebSocket handlers
//!
//! Each socket gets a bounded outbound queue. The broker writes into the
//! queue through `WsTransport`; a per-socket task drains it onto the wire.

pub mod jobs;
pub mod transport;

pub use transport::WsTransport;

/// Maximum number of messages to buffer per WebSocket connection
pub const WS_BUFFER_SIZE: usize = 256;
