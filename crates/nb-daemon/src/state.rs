//! Daemon-wide state shared by every connection

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use nb_core::config::DaemonConfig;

/// Read-only state handed to each connection task
pub struct DaemonState {
    /// Configuration
    pub config: DaemonConfig,
    /// Free connection slots, `None` when unlimited
    connection_slots: Option<Arc<Semaphore>>,
}

/// Held by a connection task for as long as the connection lives
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

impl DaemonState {
    /// Create state from a validated configuration
    pub fn new(config: DaemonConfig) -> Self {
        let connection_slots = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max as usize)));

        Self {
            config,
            connection_slots,
        }
    }

    /// Take a connection slot, or `None` if the daemon is full
    pub fn try_admit(&self) -> Option<Admission> {
        match &self.connection_slots {
            None => Some(Admission { _permit: None }),
            Some(slots) => Arc::clone(slots)
                .try_acquire_owned()
                .ok()
                .map(|permit| Admission {
                    _permit: Some(permit),
                }),
        }
    }
}
