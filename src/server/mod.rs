//! WebSocket server module
//!
//! Per-connection protocol state machine and the tokio server that feeds it.

mod connection;
#[cfg(test)]
pub(crate) mod testing;
mod websocket;

pub use connection::*;
pub use websocket::*;
