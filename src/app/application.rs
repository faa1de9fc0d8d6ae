//! Application capability set and client bookkeeping

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::server::ConnectionRef;

/// Callbacks a connection delivers to the application it is bound to
///
/// Callbacks may run concurrently for different connections, so
/// implementations guard their own state.
pub trait Application: Send + Sync {
    /// Handshake completed; called once per connection
    fn on_connect(&self, connection: &ConnectionRef);

    /// Connection closed; called once, and only after `on_connect`
    fn on_disconnect(&self, connection: &ConnectionRef);

    /// Periodic tick driven by the server loop
    fn on_tick(&self);

    /// A complete message arrived on `connection`
    fn on_data(&self, data: &[u8], connection: &ConnectionRef);
}

/// Set of connected clients, keyed by connection id
#[derive(Default)]
pub struct ClientSet {
    clients: Mutex<Vec<ConnectionRef>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: &ConnectionRef) {
        let mut clients = self.clients.lock();
        if !clients.iter().any(|c| c.id() == connection.id()) {
            clients.push(ConnectionRef::clone(connection));
        }
    }

    /// Remove a client; returns false if it was not in the set
    pub fn remove(&self, id: Uuid) -> bool {
        let mut clients = self.clients.lock();
        match clients.iter().position(|c| c.id() == id) {
            Some(index) => {
                clients.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Send a message to every client
    ///
    /// Sends run on a snapshot taken outside the lock, since a failed write
    /// re-enters the application through `on_disconnect`.
    pub fn broadcast(&self, message: &[u8]) {
        let clients: Vec<ConnectionRef> = self.clients.lock().clone();
        for client in clients {
            if let Err(e) = client.send(message) {
                debug!("Broadcast to {} failed: {}", client.id(), e);
            }
        }
    }
}
