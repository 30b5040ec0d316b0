//! Dome backend abstraction and registry.
//!
//! The controller drives concrete dome hardware through [`DomeInterface`].
//! Backends register a constructor under a known id; the config's
//! `dome.module` key selects one at load time.

use crate::command::DomeStatus;
use crate::config::DomeConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from dome backend operations.
#[derive(Debug, Error)]
pub enum DomeError {
    /// The command did not complete within its deadline.
    #[error("dome command timed out after {0:.0?}")]
    Timeout(Duration),
    /// The backend reported a hardware fault.
    #[error("dome backend fault: {0}")]
    Backend(String),
    /// The backend could not be reached; retryable within a tick.
    #[error("failed to communicate with dome backend: {0}")]
    Communication(String),
}

impl DomeError {
    /// Communication failures are retried within a tick; everything else
    /// elevates the controller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

/// Capability set the dome controller needs from a backend.
#[async_trait]
pub trait DomeInterface: Send + Sync {
    /// Locks the dome to operations control and arms the heartbeat.
    async fn set_automatic(&self) -> Result<(), DomeError>;

    /// Releases the dome to manual control and disarms the heartbeat.
    async fn set_manual(&self) -> Result<(), DomeError>;

    /// Reports the aggregated shutter status.
    async fn query_status(&self) -> Result<DomeStatus, DomeError>;

    /// Opens the shutters, waiting up to `timeout` for completion.
    async fn open(&self, timeout: Duration) -> Result<(), DomeError>;

    /// Closes the shutters, waiting up to `timeout` for completion.
    async fn close(&self, timeout: Duration) -> Result<(), DomeError>;

    /// Resets the backend's autonomous-close timer to `timeout` from now.
    async fn ping_heartbeat(&self, timeout: Duration) -> Result<(), DomeError>;
}

/// Constructor registered for a dome backend id.
pub type DomeConstructor = fn(&DomeConfig) -> Result<Arc<dyn DomeInterface>, String>;

/// Resolves a dome backend id to its constructor.
pub fn lookup_backend(name: &str) -> Option<DomeConstructor> {
    match name {
        "simulated" => Some(super::simulated::SimulatedDome::from_config),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_simulated() {
        assert!(lookup_backend("simulated").is_some());
        assert!(lookup_backend("astrohaven").is_none());
    }

    #[test]
    fn only_communication_errors_retry() {
        assert!(DomeError::Communication("refused".into()).is_retryable());
        assert!(!DomeError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(!DomeError::Backend("jam".into()).is_retryable());
    }
}
