//! Transport layer
//!
//! WebSocket signaling: one task per browser connection.

pub mod signaling_server;

pub use signaling_server::handle_signaling_connection;
