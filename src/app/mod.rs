//! Application module
//!
//! Applications receive connection lifecycle events and messages. The
//! registry binds each application to the URL path clients connect on.

mod application;
mod broadcast;
mod registry;
mod time;

pub use application::*;
pub use broadcast::*;
pub use registry::*;
pub use time::*;
