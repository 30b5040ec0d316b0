//! Simulated dome backend.
//!
//! Behaves like a heartbeat-protected shutter pair without any hardware:
//! movement takes a configurable travel time, the heartbeat trips if it is
//! not pinged in time, and tests can inject faults. This is the backend used
//! by the integration suite and by sites that run the daemon without a dome
//! attached to real hardware.

use super::interface::{DomeError, DomeInterface};
use crate::command::DomeStatus;
use crate::config::DomeConfig;
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutters {
    Closed,
    Open,
}

#[derive(Debug)]
struct Inner {
    shutters: Shutters,
    moving_until: Option<DateTime<Utc>>,
    moving_target: Shutters,
    automatic: bool,
    heartbeat_expires: Option<DateTime<Utc>>,
    tripped: bool,
    hardware_fault: bool,
    fail_commands: bool,
}

/// In-memory dome with heartbeat semantics.
pub struct SimulatedDome {
    clock: Arc<dyn Clock>,
    travel_time: Duration,
    inner: Mutex<Inner>,
}

impl SimulatedDome {
    /// Registry constructor. Reads the optional `travel_time` backend key
    /// (seconds, default 0 for instant movement).
    pub fn from_config(config: &DomeConfig) -> Result<Arc<dyn DomeInterface>, String> {
        let travel_time = match config.backend.get("travel_time") {
            None => 0.0,
            Some(value) => value
                .as_f64()
                .filter(|t| *t >= 0.0)
                .ok_or_else(|| "travel_time must be a non-negative number".to_string())?,
        };
        Ok(Arc::new(Self::new(
            Arc::new(SystemClock),
            Duration::from_secs_f64(travel_time),
        )))
    }

    /// Creates a simulated dome with an explicit clock, for tests.
    pub fn new(clock: Arc<dyn Clock>, travel_time: Duration) -> Self {
        Self {
            clock,
            travel_time,
            inner: Mutex::new(Inner {
                shutters: Shutters::Closed,
                moving_until: None,
                moving_target: Shutters::Closed,
                automatic: false,
                heartbeat_expires: None,
                tripped: false,
                hardware_fault: false,
                fail_commands: false,
            }),
        }
    }

    /// Forces the shutters open or closed, bypassing movement. Lets tests
    /// model an operator driving the dome by hand.
    pub fn force_shutters_open(&self, open: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutters = if open { Shutters::Open } else { Shutters::Closed };
        inner.moving_until = None;
    }

    /// Injects or clears a hardware fault.
    pub fn set_hardware_fault(&self, fault: bool) {
        self.inner.lock().unwrap().hardware_fault = fault;
    }

    /// Makes subsequent open/close commands fail.
    pub fn set_fail_commands(&self, fail: bool) {
        self.inner.lock().unwrap().fail_commands = fail;
    }

    /// Expires the heartbeat immediately, as if the controller went silent.
    pub fn trip_heartbeat(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.automatic {
            inner.tripped = true;
            inner.shutters = Shutters::Closed;
            inner.moving_until = None;
        }
    }

    /// Applies the passage of time: completes movement and trips an expired
    /// heartbeat (which closes the shutters autonomously).
    fn settle(&self, inner: &mut Inner) {
        let now = self.clock.now();
        if let Some(until) = inner.moving_until {
            if now >= until {
                inner.shutters = inner.moving_target;
                inner.moving_until = None;
            }
        }
        if inner.automatic {
            if let Some(expires) = inner.heartbeat_expires {
                if now > expires {
                    inner.tripped = true;
                    inner.shutters = Shutters::Closed;
                    inner.moving_until = None;
                }
            }
        }
    }

    fn start_move(&self, target: Shutters, timeout: Duration) -> Result<(), DomeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_commands {
            return Err(DomeError::Backend("shutter drive fault".to_string()));
        }
        if inner.hardware_fault {
            return Err(DomeError::Backend("hardware fault".to_string()));
        }
        if self.travel_time > timeout {
            // Movement will outlive the command deadline.
            inner.moving_target = target;
            inner.moving_until = Some(self.clock.now() + chrono::Duration::from_std(self.travel_time).unwrap_or_default());
            return Err(DomeError::Timeout(timeout));
        }
        inner.shutters = target;
        inner.moving_until = None;
        Ok(())
    }
}

#[async_trait]
impl DomeInterface for SimulatedDome {
    async fn set_automatic(&self) -> Result<(), DomeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.automatic = true;
        // Re-arming under operations control acknowledges a tripped
        // heartbeat.
        inner.tripped = false;
        inner.heartbeat_expires = None;
        Ok(())
    }

    async fn set_manual(&self) -> Result<(), DomeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.automatic = false;
        inner.tripped = false;
        inner.heartbeat_expires = None;
        Ok(())
    }

    async fn query_status(&self) -> Result<DomeStatus, DomeError> {
        let mut inner = self.inner.lock().unwrap();
        self.settle(&mut inner);
        if inner.tripped {
            return Ok(DomeStatus::Timeout);
        }
        if inner.hardware_fault {
            return Ok(DomeStatus::HardwareError);
        }
        if inner.moving_until.is_some() {
            return Ok(DomeStatus::Moving);
        }
        Ok(match inner.shutters {
            Shutters::Closed => DomeStatus::Closed,
            Shutters::Open => DomeStatus::Open,
        })
    }

    async fn open(&self, timeout: Duration) -> Result<(), DomeError> {
        self.start_move(Shutters::Open, timeout)
    }

    async fn close(&self, timeout: Duration) -> Result<(), DomeError> {
        self.start_move(Shutters::Closed, timeout)
    }

    async fn ping_heartbeat(&self, timeout: Duration) -> Result<(), DomeError> {
        let mut inner = self.inner.lock().unwrap();
        self.settle(&mut inner);
        if inner.tripped {
            return Err(DomeError::Backend("heartbeat tripped".to_string()));
        }
        if inner.automatic {
            inner.heartbeat_expires =
                Some(self.clock.now() + chrono::Duration::from_std(timeout).unwrap_or_default());
        }
        Ok(())
    }
}
