//! HTTP and WebSocket glue
//!
//! Exposes the broker to browsers: a WebSocket endpoint per client plus
//! liveness routes.

pub mod handlers;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{ApiServer, AppState};
