//! Time application
//!
//! Pushes the current Unix time (seconds, decimal text) to every client once
//! more than the configured interval has passed since the previous push.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

use super::{Application, ClientSet};
use crate::server::ConnectionRef;

/// Default seconds between pushes
pub const DEFAULT_TIME_INTERVAL_SECS: u64 = 3;

pub struct TimeBroadcaster {
    clients: ClientSet,
    interval_secs: u64,
    last_push: Mutex<u64>,
}

impl TimeBroadcaster {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            clients: ClientSet::new(),
            interval_secs,
            last_push: Mutex::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Push `now` if the interval has elapsed; returns whether it pushed
    pub fn tick_at(&self, now: u64) -> bool {
        {
            let mut last_push = self.last_push.lock();
            if now <= last_push.saturating_add(self.interval_secs) {
                return false;
            }
            *last_push = now;
        }

        debug!("Pushing time {} to {} clients", now, self.clients.len());
        self.clients.broadcast(now.to_string().as_bytes());
        true
    }
}

impl Default for TimeBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_INTERVAL_SECS)
    }
}

impl Application for TimeBroadcaster {
    fn on_connect(&self, connection: &ConnectionRef) {
        self.clients.add(connection);
    }

    fn on_disconnect(&self, connection: &ConnectionRef) {
        self.clients.remove(connection.id());
    }

    fn on_tick(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.tick_at(now);
    }

    fn on_data(&self, _data: &[u8], _connection: &ConnectionRef) {}
}
