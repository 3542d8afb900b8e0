//! Transport layer
//!
//! The core consumes [`ConnectionEvent`](crate::dispatcher::ConnectionEvent)s
//! and is transport-agnostic; this module provides the WebSocket server that
//! produces them.

pub mod websocket_server;

pub use websocket_server::{ WebSocketServerOptions, WebSocketSyncServer };
