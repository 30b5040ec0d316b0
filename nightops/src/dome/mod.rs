//! Dome mode state machine and open-window enforcement.
//!
//! The controller owns the dome's operations mode, the scheduled open
//! window, and the heartbeat that stops a silent daemon from leaving the
//! dome open. Mode changes are driven synchronously by remote commands
//! (under the daemon's command lock); the periodic [`DomeController::tick`]
//! reconciles the shutters against the window and the environment verdict.

pub mod interface;
pub mod simulated;

pub use interface::{lookup_backend, DomeConstructor, DomeError, DomeInterface};
pub use simulated::SimulatedDome;

use crate::command::{CommandStatus, DomeStatus, OperationsMode};
use crate::config::DomeConfig;
use crate::environment::EnvironmentSnapshot;
use crate::time::{format_utc, Clock};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempts made to reach the backend within one tick before erroring.
const COMM_RETRIES: u32 = 3;

/// Retries a backend call on communication failures. Timeouts and hardware
/// faults elevate immediately.
async fn with_comm_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T, DomeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DomeError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < COMM_RETRIES => {
                warn!("dome {operation} failed (attempt {attempt}): {e}");
                attempt += 1;
            }
            Err(e) => {
                error!("dome {operation} failed: {e}");
                return Err(e);
            }
        }
    }
}

/// Backend timeouts and window policy, lifted from the dome config block.
#[derive(Clone, Copy, Debug)]
pub struct DomePolicy {
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub movement_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_open_timeout: Duration,
    pub heartbeat_close_timeout: Duration,
    pub reopen_after_weather_alert: bool,
}

impl From<&DomeConfig> for DomePolicy {
    fn from(config: &DomeConfig) -> Self {
        Self {
            open_timeout: Duration::from_secs_f64(config.open_timeout),
            close_timeout: Duration::from_secs_f64(config.close_timeout),
            movement_timeout: Duration::from_secs_f64(config.movement_timeout),
            heartbeat_timeout: Duration::from_secs_f64(config.heartbeat_timeout),
            heartbeat_open_timeout: Duration::from_secs_f64(config.heartbeat_open_timeout),
            heartbeat_close_timeout: Duration::from_secs_f64(config.heartbeat_close_timeout),
            reopen_after_weather_alert: config.reopen_after_weather_alert,
        }
    }
}

#[derive(Debug)]
struct State {
    mode: OperationsMode,
    requested_mode: OperationsMode,
    status: DomeStatus,
    status_updated: DateTime<Utc>,
    open_at: Option<DateTime<Utc>>,
    close_at: Option<DateTime<Utc>>,
    moving_since: Option<DateTime<Utc>>,
    last_heartbeat_ack: Option<DateTime<Utc>>,
}

/// Controller for a single dome backend.
pub struct DomeController {
    backend: Arc<dyn DomeInterface>,
    clock: Arc<dyn Clock>,
    policy: DomePolicy,
    state: Mutex<State>,
}

impl DomeController {
    /// Creates a controller in manual mode with the dome assumed closed.
    pub fn new(backend: Arc<dyn DomeInterface>, clock: Arc<dyn Clock>, policy: DomePolicy) -> Self {
        let now = clock.now();
        Self {
            backend,
            clock,
            policy,
            state: Mutex::new(State {
                mode: OperationsMode::Manual,
                requested_mode: OperationsMode::Manual,
                status: DomeStatus::Closed,
                status_updated: now,
                open_at: None,
                close_at: None,
                moving_since: None,
                last_heartbeat_ack: None,
            }),
        }
    }

    /// Current operations mode.
    pub fn mode(&self) -> OperationsMode {
        self.state.lock().unwrap().mode
    }

    /// Last status reported by the backend.
    pub fn current_status(&self) -> DomeStatus {
        self.state.lock().unwrap().status
    }

    /// True when the telescope may assume the sky is reachable: the dome is
    /// fully open, or an operator holds it in manual mode.
    pub fn is_open_for_observing(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.status == DomeStatus::Open || state.mode == OperationsMode::Manual
    }

    /// Requests a mode change. Runs the backend handshake synchronously so
    /// the caller gets a definitive status.
    pub async fn request_mode(&self, target: OperationsMode) -> CommandStatus {
        let (mode, status) = {
            let mut state = self.state.lock().unwrap();
            state.requested_mode = target;
            (state.mode, state.status)
        };

        match target {
            OperationsMode::Automatic => {
                if mode == OperationsMode::Automatic {
                    return CommandStatus::Succeeded;
                }
                match self.backend.set_automatic().await {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap();
                        if state.mode == OperationsMode::Error {
                            info!("dome error state cleared by operator");
                            // The fault ack also resets the sticky status.
                            if state.status.is_fault() {
                                state.status = DomeStatus::Closed;
                                state.status_updated = self.clock.now();
                            }
                        }
                        state.mode = OperationsMode::Automatic;
                        info!("dome switched to AUTOMATIC mode");
                        CommandStatus::Succeeded
                    }
                    Err(e) => {
                        error!("failed to switch dome to automatic: {e}");
                        self.set_error();
                        CommandStatus::Failed
                    }
                }
            }
            OperationsMode::Manual => {
                if mode == OperationsMode::Manual {
                    return CommandStatus::Succeeded;
                }
                if status != DomeStatus::Closed {
                    return CommandStatus::DomeNotClosed;
                }
                match self.backend.set_manual().await {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap();
                        state.mode = OperationsMode::Manual;
                        state.open_at = None;
                        state.close_at = None;
                        info!("dome switched to MANUAL mode");
                        CommandStatus::Succeeded
                    }
                    Err(e) => {
                        error!("failed to switch dome to manual: {e}");
                        self.set_error();
                        CommandStatus::Failed
                    }
                }
            }
            _ => CommandStatus::Failed,
        }
    }

    /// Schedules the open window. Requires automatic mode.
    pub fn set_window(&self, open_at: DateTime<Utc>, close_at: DateTime<Utc>) -> CommandStatus {
        let mut state = self.state.lock().unwrap();
        if state.mode != OperationsMode::Automatic {
            return CommandStatus::DomeNotAutomatic;
        }
        state.open_at = Some(open_at);
        state.close_at = Some(close_at);
        info!(
            "scheduled dome window {} - {}",
            format_utc(open_at),
            format_utc(close_at)
        );
        CommandStatus::Succeeded
    }

    /// Clears the open window. Requires automatic mode.
    pub fn clear_window(&self) -> CommandStatus {
        let mut state = self.state.lock().unwrap();
        if state.mode != OperationsMode::Automatic {
            return CommandStatus::DomeNotAutomatic;
        }
        state.open_at = None;
        state.close_at = None;
        info!("cleared dome window");
        CommandStatus::Succeeded
    }

    /// Time of the last heartbeat acknowledgement from the backend.
    pub fn last_heartbeat_ack(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_heartbeat_ack
    }

    /// Current window, if one is set.
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let state = self.state.lock().unwrap();
        state.open_at.zip(state.close_at)
    }

    /// Restores a previously captured window without the automatic-mode
    /// check. Used to roll back a failed schedule commit.
    pub fn restore_window(&self, window: Option<(DateTime<Utc>, DateTime<Utc>)>) {
        let mut state = self.state.lock().unwrap();
        state.open_at = window.map(|w| w.0);
        state.close_at = window.map(|w| w.1);
    }

    /// Latches the error mode. The window is dropped so a later
    /// acknowledgement starts from a clean slate.
    fn set_error(&self) {
        let mut state = self.state.lock().unwrap();
        if state.mode != OperationsMode::Error {
            error!("dome controller entering ERROR mode");
        }
        state.mode = OperationsMode::Error;
        state.open_at = None;
        state.close_at = None;
    }

    /// One reconciliation pass. Call once per operations tick with the
    /// snapshot produced earlier in the same tick.
    pub async fn tick(&self, environment: &EnvironmentSnapshot) {
        if self.mode() != OperationsMode::Automatic {
            return;
        }
        let now = self.clock.now();

        let should_be_open = {
            let mut state = self.state.lock().unwrap();

            // The window expires on its own once the close time passes.
            if state.close_at.is_some_and(|close| now > close) {
                info!("dome window has passed, clearing");
                state.open_at = None;
                state.close_at = None;
            }

            // A weather alert cancels the rest of the night when the
            // backend is not allowed to reopen afterwards.
            if !environment.safe
                && !self.policy.reopen_after_weather_alert
                && state.open_at.is_some_and(|open| now > open)
            {
                warn!("weather alert inside dome window, clearing for the night");
                state.open_at = None;
                state.close_at = None;
            }

            environment.safe
                && state
                    .open_at
                    .zip(state.close_at)
                    .is_some_and(|(open, close)| open < now && now < close)
        };

        let Some(status) = self.query_status_with_retries().await else {
            self.set_error();
            return;
        };
        self.record_status(status, now);

        if status.is_fault() {
            error!("dome reported {status}; operator acknowledgement required");
            self.set_error();
            return;
        }

        debug!(
            "dome is {status} and wants to be {}",
            if should_be_open { "OPEN" } else { "CLOSED" }
        );

        let mut moving = status == DomeStatus::Moving;
        if moving {
            let stuck = self
                .state
                .lock()
                .unwrap()
                .moving_since
                .is_some_and(|since| {
                    (now - since).to_std().unwrap_or_default() > self.policy.movement_timeout
                });
            if stuck {
                error!("dome has been moving for longer than the movement timeout");
                self.set_error();
                return;
            }
        } else if status == DomeStatus::Open && !should_be_open {
            info!("closing dome");
            if with_comm_retries("close", || self.backend.close(self.policy.close_timeout))
                .await
                .is_err()
            {
                self.set_error();
                return;
            }
            moving = true;
        } else if status == DomeStatus::Closed && should_be_open {
            info!("opening dome");
            if with_comm_retries("open", || self.backend.open(self.policy.open_timeout))
                .await
                .is_err()
            {
                self.set_error();
                return;
            }
            moving = true;
        }

        // Pick up the post-command status so the rest of the tick (and the
        // telescope) sees where the shutters actually are.
        if moving {
            if let Some(status) = self.query_status_with_retries().await {
                self.record_status(status, self.clock.now());
                moving = status == DomeStatus::Moving;
            }
        }

        let heartbeat_timeout = if moving {
            self.policy.heartbeat_timeout
        } else if should_be_open {
            self.policy.heartbeat_open_timeout
        } else {
            self.policy.heartbeat_close_timeout
        };
        match with_comm_retries("heartbeat", || self.backend.ping_heartbeat(heartbeat_timeout))
            .await
        {
            Ok(()) => {
                self.state.lock().unwrap().last_heartbeat_ack = Some(self.clock.now());
            }
            Err(_) => self.set_error(),
        }
    }

    async fn query_status_with_retries(&self) -> Option<DomeStatus> {
        with_comm_retries("status query", || self.backend.query_status())
            .await
            .ok()
    }

    fn record_status(&self, status: DomeStatus, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.status_updated = now;
        if status == DomeStatus::Moving {
            state.moving_since.get_or_insert(now);
        } else {
            state.moving_since = None;
        }
    }

    /// Status-payload fragment for this controller.
    pub fn status_json(&self) -> Value {
        let state = self.state.lock().unwrap();
        json!({
            "mode": state.mode,
            "requested_mode": state.requested_mode,
            "status": state.status,
            "status_updated": format_utc(state.status_updated),
            "requested_open_date": state.open_at.map(format_utc),
            "requested_close_date": state.close_at.map(format_utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{parse_utc, ManualClock};

    fn policy() -> DomePolicy {
        // Heartbeat timeouts far larger than any clock jump in these tests,
        // so only trip_heartbeat() can trip the simulated dome.
        DomePolicy {
            open_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(120),
            movement_timeout: Duration::from_secs(180),
            heartbeat_timeout: Duration::from_secs(86400),
            heartbeat_open_timeout: Duration::from_secs(86400),
            heartbeat_close_timeout: Duration::from_secs(86400),
            reopen_after_weather_alert: true,
        }
    }

    fn safe_environment(clock: &ManualClock) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            updated: Some(clock.now()),
            safe: true,
            conditions: vec![],
        }
    }

    fn unsafe_environment(clock: &ManualClock) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            safe: false,
            ..safe_environment(clock)
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        dome: Arc<SimulatedDome>,
        controller: DomeController,
    }

    async fn automatic_fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at("2024-03-14T22:00:00Z"));
        let dome = Arc::new(SimulatedDome::new(clock.clone(), Duration::ZERO));
        let controller = DomeController::new(dome.clone(), clock.clone(), policy());
        assert_eq!(
            controller.request_mode(OperationsMode::Automatic).await,
            CommandStatus::Succeeded
        );
        Fixture {
            clock,
            dome,
            controller,
        }
    }

    fn window(controller: &DomeController, open: &str, close: &str) {
        assert_eq!(
            controller.set_window(parse_utc(open).unwrap(), parse_utc(close).unwrap()),
            CommandStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn opens_inside_window_when_safe() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");

        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Open);
        assert!(f.controller.last_heartbeat_ack().is_some());
    }

    #[tokio::test]
    async fn stays_closed_without_a_window() {
        let f = automatic_fixture().await;
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Closed);
    }

    #[tokio::test]
    async fn stays_closed_before_window_opens() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T23:00:00Z", "2024-03-15T06:00:00Z");
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Closed);
    }

    #[tokio::test]
    async fn unsafe_mid_window_closes_but_keeps_window() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Open);

        f.clock.set(parse_utc("2024-03-14T23:00:00Z").unwrap());
        f.controller.tick(&unsafe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Closed);
        assert!(f.controller.window().is_some(), "window survives the alert");

        f.clock.set(parse_utc("2024-03-14T23:30:00Z").unwrap());
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Open);
    }

    #[tokio::test]
    async fn weather_alert_clears_window_when_reopen_disallowed() {
        let clock = Arc::new(ManualClock::at("2024-03-14T22:00:00Z"));
        let dome = Arc::new(SimulatedDome::new(clock.clone(), Duration::ZERO));
        let mut no_reopen = policy();
        no_reopen.reopen_after_weather_alert = false;
        let controller = DomeController::new(dome, clock.clone(), no_reopen);
        controller.request_mode(OperationsMode::Automatic).await;
        window(&controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");

        controller.tick(&unsafe_environment(&clock)).await;
        assert!(controller.window().is_none());
    }

    #[tokio::test]
    async fn window_clears_after_close_time() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        f.controller.tick(&safe_environment(&f.clock)).await;

        f.clock.set(parse_utc("2024-03-15T06:05:00Z").unwrap());
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Closed);
        assert!(f.controller.window().is_none());
    }

    #[tokio::test]
    async fn manual_requires_closed_dome() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.current_status(), DomeStatus::Open);

        assert_eq!(
            f.controller.request_mode(OperationsMode::Manual).await,
            CommandStatus::DomeNotClosed
        );
        assert_eq!(f.controller.mode(), OperationsMode::Automatic);
        assert!(f.controller.window().is_some());
    }

    #[tokio::test]
    async fn repeated_automatic_requests_are_idempotent() {
        let f = automatic_fixture().await;
        for _ in 0..3 {
            assert_eq!(
                f.controller.request_mode(OperationsMode::Automatic).await,
                CommandStatus::Succeeded
            );
        }
        assert_eq!(f.controller.mode(), OperationsMode::Automatic);
    }

    #[tokio::test]
    async fn heartbeat_trip_latches_error_until_acknowledged() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        f.controller.tick(&safe_environment(&f.clock)).await;

        f.dome.trip_heartbeat();
        f.clock.advance(Duration::from_secs(10));
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.mode(), OperationsMode::Error);
        assert!(f.controller.window().is_none());

        // Automatic transitions stay disabled while errored.
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.mode(), OperationsMode::Error);

        // Operator acknowledges by requesting automatic again.
        assert_eq!(
            f.controller.request_mode(OperationsMode::Automatic).await,
            CommandStatus::Succeeded
        );
        assert_eq!(f.controller.mode(), OperationsMode::Automatic);
    }

    #[tokio::test]
    async fn command_failure_latches_error() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        f.dome.set_fail_commands(true);
        f.controller.tick(&safe_environment(&f.clock)).await;
        assert_eq!(f.controller.mode(), OperationsMode::Error);
    }

    #[tokio::test]
    async fn status_json_carries_window_dates() {
        let f = automatic_fixture().await;
        window(&f.controller, "2024-03-14T21:00:00Z", "2024-03-15T06:00:00Z");
        let status = f.controller.status_json();
        assert_eq!(status["mode"], "AUTOMATIC");
        assert_eq!(status["requested_open_date"], "2024-03-14T21:00:00Z");
        assert_eq!(status["requested_close_date"], "2024-03-15T06:00:00Z");
    }
}
