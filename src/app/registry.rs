//! Application registry
//!
//! Maps URL paths to the application instance serving them. Built once at
//! startup and shared read-only by every connection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{Application, Broadcaster, TimeBroadcaster};
use crate::config::{ApplicationKind, ServerConfig};

#[derive(Default)]
pub struct Registry {
    applications: HashMap<String, Arc<dyn Application>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by the configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut registry = Self::new();
        for entry in &config.applications {
            let application: Arc<dyn Application> = match entry.kind {
                ApplicationKind::Echo => Arc::new(Broadcaster::new()),
                ApplicationKind::Time => Arc::new(TimeBroadcaster::new(config.time_interval_secs)),
            };
            info!("Registered {:?} application at /{}", entry.kind, entry.path);
            registry.register(entry.path.clone(), application);
        }
        registry
    }

    /// Bind an application to a path (without leading slash), replacing any
    /// previous binding
    pub fn register(&mut self, path: impl Into<String>, application: Arc<dyn Application>) {
        self.applications.insert(path.into(), application);
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn Application>> {
        self.applications.get(path).cloned()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.applications.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    /// Deliver one tick to every application
    pub fn tick_all(&self) {
        for application in self.applications.values() {
            application.on_tick();
        }
    }
}
