//! WebSocket protocol module
//!
//! Handshake negotiation and wire framing for the Hixie-76 and Hybi-10
//! protocol variants. Pure functions over byte buffers; no I/O.

pub mod frame;
mod handshake;
pub mod legacy;

pub use handshake::*;
