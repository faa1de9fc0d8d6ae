//! Configuration module
//!
//! Loads the server configuration from a TOML file.

mod server;

pub use server::*;
