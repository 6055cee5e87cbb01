//! Shared state for the HTTP and signaling handlers

use crate::config::Config;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by every request handler
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// Participants and pairings of the relay
    pub registry: Arc<SessionRegistry>,

    /// Server start time
    pub start_time: Instant,
}

impl SharedState {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(config.signaling.relay_policy, config.signaling.max_participants);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            start_time: Instant::now(),
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Connected signaling participants
    pub fn connection_count(&self) -> usize {
        self.registry.participant_count()
    }
}
