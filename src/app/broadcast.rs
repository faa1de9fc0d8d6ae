//! Echo application
//!
//! Rebroadcasts every message it receives to all connected clients,
//! including the sender.

use tracing::debug;

use super::{Application, ClientSet};
use crate::server::ConnectionRef;

#[derive(Default)]
pub struct Broadcaster {
    clients: ClientSet,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Application for Broadcaster {
    fn on_connect(&self, connection: &ConnectionRef) {
        self.clients.add(connection);
    }

    fn on_disconnect(&self, connection: &ConnectionRef) {
        if !self.clients.remove(connection.id()) {
            debug!("Disconnect for unknown client {}", connection.id());
        }
    }

    fn on_tick(&self) {}

    fn on_data(&self, data: &[u8], _connection: &ConnectionRef) {
        self.clients.broadcast(data);
    }
}
