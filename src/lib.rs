//! Jobrelay - Real-time Job Update Broker
//!
//! Relays job progress events from background workers to browser clients
//! over WebSockets.
//!
//! ## Features
//!
//! - Topic subscriptions per WebSocket session with per-topic ordering
//! - Redis pub/sub event bus with automatic resubscription
//! - Heartbeat tracking and stale job detection
//! - Graceful start/stop lifecycle that always closes client sessions

pub mod api;
pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod models;
pub mod registry;
pub mod services;

pub use broker::{Broker, BrokerConfig, LifecycleState};
pub use config::Config;
pub use error::{BrokerError, Result};
