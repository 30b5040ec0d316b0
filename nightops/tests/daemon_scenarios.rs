//! End-to-end scenarios for the operations daemon, driven tick by tick
//! against a simulated dome, a scripted environment daemon, and a pinned
//! clock at a CLASP-like site.

use async_trait::async_trait;
use nightops::command::{CommandStatus, DomeStatus, OperationsMode};
use nightops::config::Config;
use nightops::daemon::OperationsDaemon;
use nightops::dome::SimulatedDome;
use nightops::environment::{EnvironmentError, EnvironmentSource};
use nightops::telescope::{ActionStatus, TelescopeAction};
use nightops::time::{format_utc, parse_utc, Clock, ManualClock};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment daemon stand-in returning whatever the test scripted.
struct ScriptedSource {
    data: Mutex<Result<Value, String>>,
}

#[async_trait]
impl EnvironmentSource for ScriptedSource {
    async fn query(&self) -> Result<Value, EnvironmentError> {
        self.data
            .lock()
            .unwrap()
            .clone()
            .map_err(EnvironmentError::Transport)
    }
}

struct Observatory {
    daemon: Arc<OperationsDaemon>,
    clock: Arc<ManualClock>,
    source: Arc<ScriptedSource>,
    dome: Arc<SimulatedDome>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl Observatory {
    fn config() -> Config {
        Config::from_json(json!({
            "daemon": "127.0.0.1:9002",
            "log_name": "clasp_opsd",
            "control_machines": ["127.0.0.1"],
            "pipeline_machines": ["127.0.0.1"],
            "actions_module": "simulated",
            "loop_delay": 10,
            "site_latitude": 28.7624,
            "site_longitude": -17.8792,
            "site_elevation": 2350,
            "sun_altitude_limit": 5,
            "dome": {
                "module": "simulated",
                "open_timeout": 120,
                "close_timeout": 120,
                "movement_timeout": 180,
                // Far larger than any clock jump in these scenarios so the
                // simulated heartbeat only trips when a test trips it.
                "heartbeat_timeout": 172800,
                "heartbeat_open_timeout": 172800,
                "heartbeat_close_timeout": 172800
            },
            "environment_daemon": "http://127.0.0.1:9010",
            "environment_conditions": [
                {"label": "Rain", "sensors": [
                    {"label": "Rain detector", "sensor": "vaisala", "parameter": "rain", "cadence": 10}
                ]},
                {"label": "Wind", "sensors": [
                    {"label": "Anemometer", "sensor": "vaisala", "parameter": "wind", "cadence": 10}
                ]}
            ]
        }))
        .expect("scenario config is valid")
    }

    /// Boots the observatory at 2024-03-14T22:00:00Z with a safe sky.
    async fn start() -> Self {
        let clock = Arc::new(ManualClock::at("2024-03-14T22:00:00Z"));
        let source = Arc::new(ScriptedSource {
            data: Mutex::new(Ok(Value::Null)),
        });
        let dome = Arc::new(SimulatedDome::new(clock.clone(), Duration::ZERO));

        let daemon = OperationsDaemon::with_backends(
            Self::config(),
            source.clone(),
            Some(dome.clone()),
            clock.clone(),
        );

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(daemon.telescope()).run(shutdown.clone()));

        let observatory = Self {
            daemon,
            clock,
            source,
            dome,
            shutdown,
            worker,
        };
        observatory.set_environment(false, false);
        observatory
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.worker.await;
    }

    /// Publishes fresh sensor data with the given unsafe flags.
    fn set_environment(&self, rain_unsafe: bool, wind_unsafe: bool) {
        let updated = format_utc(self.clock.now());
        *self.source.data.lock().unwrap() = Ok(json!({
            "vaisala": {"parameters": {
                "rain": {"latest": if rain_unsafe {1} else {0}, "unsafe": rain_unsafe, "updated": updated},
                "wind": {"latest": 12.5, "unsafe": wind_unsafe, "updated": updated}
            }}
        }));
    }

    async fn tick(&self) {
        self.daemon.run_tick().await;
    }

    fn jump_to(&self, timestamp: &str) {
        self.clock.set(parse_utc(timestamp).unwrap());
    }

    fn dome_status(&self) -> DomeStatus {
        self.daemon.dome().unwrap().current_status()
    }

    fn march_schedule() -> Value {
        json!({
            "night": "2024-03-14",
            "dome": {"open": "2024-03-14T21:00:00Z", "close": "2024-03-15T06:00:00Z"}
        })
    }

    async fn enable_automatic(&self) {
        assert_eq!(
            self.daemon.dome_control(true).await,
            CommandStatus::Succeeded
        );
        assert_eq!(
            self.daemon.tel_control(true).await,
            CommandStatus::Succeeded
        );
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn scenario_safe_open() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    let (status, errors) = obs
        .daemon
        .schedule_observations(&Observatory::march_schedule())
        .await;
    assert_eq!(status, CommandStatus::Succeeded, "errors: {errors:?}");

    obs.tick().await;
    assert_eq!(obs.dome_status(), DomeStatus::Open);
    obs.stop().await;
}

#[tokio::test]
async fn scenario_unsafe_blocks_open() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.set_environment(true, false);
    obs.tick().await;

    let (status, _) = obs
        .daemon
        .schedule_observations(&Observatory::march_schedule())
        .await;
    assert_eq!(status, CommandStatus::EnvironmentNotSafe);
    assert!(obs.daemon.dome().unwrap().window().is_none());
    obs.stop().await;
}

#[tokio::test]
async fn scenario_manual_lockout_while_open() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;
    obs.daemon
        .schedule_observations(&Observatory::march_schedule())
        .await;
    obs.tick().await;
    assert_eq!(obs.dome_status(), DomeStatus::Open);

    assert_eq!(
        obs.daemon.dome_control(false).await,
        CommandStatus::DomeNotClosed
    );
    assert_eq!(
        obs.daemon.dome().unwrap().mode(),
        OperationsMode::Automatic
    );
    assert_eq!(obs.dome_status(), DomeStatus::Open);
    obs.stop().await;
}

#[tokio::test]
async fn scenario_atomic_rollback_on_invalid_action() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    let mut schedule = Observatory::march_schedule();
    schedule["actions"] = json!([{"type": "Wait"}]); // missing 'delay'
    let (status, errors) = obs.daemon.schedule_observations(&schedule).await;
    assert_eq!(status, CommandStatus::InvalidSchedule);
    assert!(errors.iter().any(|e| e.contains("missing key 'delay'")));

    assert!(obs.daemon.dome().unwrap().window().is_none());
    let telescope = obs.daemon.telescope().status_json();
    assert_eq!(telescope["schedule"].as_array().unwrap().len(), 0);
    obs.stop().await;
}

#[tokio::test]
async fn scenario_rollback_when_telescope_not_automatic() {
    let obs = Observatory::start().await;
    // Dome automatic, telescope left in manual.
    assert_eq!(
        obs.daemon.dome_control(true).await,
        CommandStatus::Succeeded
    );
    obs.tick().await;

    let mut schedule = Observatory::march_schedule();
    schedule["actions"] = json!([{"type": "Wait", "delay": 30}]);
    let (status, _) = obs.daemon.schedule_observations(&schedule).await;
    assert_eq!(status, CommandStatus::TelescopeNotAutomatic);

    // The already-committed window was rolled back.
    assert!(obs.daemon.dome().unwrap().window().is_none());
    obs.stop().await;
}

#[tokio::test]
async fn scenario_mid_window_unsafe_closes_then_reopens() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;
    obs.daemon
        .schedule_observations(&Observatory::march_schedule())
        .await;
    obs.tick().await;
    assert_eq!(obs.dome_status(), DomeStatus::Open);

    obs.jump_to("2024-03-14T23:00:00Z");
    obs.set_environment(true, false);
    obs.tick().await;
    assert_eq!(obs.dome_status(), DomeStatus::Closed);
    let status = obs.daemon.dome().unwrap().status_json();
    assert_eq!(status["requested_open_date"], "2024-03-14T21:00:00Z");
    assert_eq!(status["requested_close_date"], "2024-03-15T06:00:00Z");

    obs.jump_to("2024-03-14T23:30:00Z");
    obs.set_environment(false, false);
    obs.tick().await;
    assert_eq!(obs.dome_status(), DomeStatus::Open);
    obs.stop().await;
}

#[tokio::test]
async fn scenario_stop_drains_queue() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    let schedule = json!({
        "night": "2024-03-14",
        "actions": [
            {"type": "Wait", "delay": 0},
            {"type": "Wait", "delay": 86400},
            {"type": "Wait", "delay": 86400}
        ]
    });
    let (status, errors) = obs.daemon.schedule_observations(&schedule).await;
    assert_eq!(status, CommandStatus::Succeeded, "errors: {errors:?}");

    // Wait for the first action to complete and the second to start.
    settle().await;
    let running = obs.daemon.telescope().status_json();
    let visible = running["schedule"].as_array().unwrap().clone();
    assert_eq!(visible.len(), 2, "first action finished: {visible:?}");
    assert_eq!(visible[0]["state"], "Running");
    assert_eq!(visible[1]["state"], "Pending");

    assert_eq!(
        obs.daemon.stop_telescope().await,
        CommandStatus::Succeeded
    );
    settle().await;

    // Mode unchanged, queue drained.
    assert_eq!(obs.daemon.telescope().mode(), OperationsMode::Automatic);
    let after = obs.daemon.telescope().status_json();
    assert_eq!(after["schedule"].as_array().unwrap().len(), 0);

    // Stop is idempotent.
    assert_eq!(
        obs.daemon.stop_telescope().await,
        CommandStatus::Succeeded
    );
    obs.stop().await;
}

#[tokio::test]
async fn scenario_queued_action_states_after_stop() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    use nightops::telescope::actions::Wait;
    use nightops::telescope::ActionContext;
    let context = ActionContext {
        log_name: "clasp_opsd".to_string(),
        site: obs.daemon.config().site(),
        clock: obs.clock.clone() as Arc<dyn Clock>,
    };
    let first = Wait::new(&json!({"delay": 0}), &context).unwrap();
    let second = Wait::new(&json!({"delay": 86400}), &context).unwrap();
    let third = Wait::new(&json!({"delay": 86400}), &context).unwrap();
    let actions: Vec<Arc<dyn TelescopeAction>> =
        vec![first.clone(), second.clone(), third.clone()];
    assert_eq!(
        obs.daemon.telescope().queue_actions(actions),
        CommandStatus::Succeeded
    );

    settle().await;
    assert_eq!(first.status(), ActionStatus::Complete);
    assert_eq!(second.status(), ActionStatus::Running);

    obs.daemon.stop_telescope().await;
    settle().await;
    assert_eq!(first.status(), ActionStatus::Complete);
    assert_eq!(second.status(), ActionStatus::Aborted);
    assert_eq!(third.status(), ActionStatus::Aborted);
    assert_eq!(obs.daemon.telescope().mode(), OperationsMode::Automatic);
    obs.stop().await;
}

#[tokio::test]
async fn dome_fault_latches_error_and_blocks_schedules() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    obs.dome.set_hardware_fault(true);
    obs.tick().await;
    assert_eq!(obs.daemon.dome().unwrap().mode(), OperationsMode::Error);

    let (status, _) = obs
        .daemon
        .schedule_observations(&Observatory::march_schedule())
        .await;
    assert_eq!(status, CommandStatus::InErrorState);

    // Operator clears the fault and acknowledges with an automatic request.
    obs.dome.set_hardware_fault(false);
    assert_eq!(
        obs.daemon.dome_control(true).await,
        CommandStatus::Succeeded
    );
    assert_eq!(obs.daemon.dome().unwrap().mode(), OperationsMode::Automatic);
    obs.stop().await;
}

#[tokio::test]
async fn dome_control_is_idempotent() {
    let obs = Observatory::start().await;
    for _ in 0..4 {
        assert_eq!(
            obs.daemon.dome_control(true).await,
            CommandStatus::Succeeded
        );
    }
    assert_eq!(obs.daemon.dome().unwrap().mode(), OperationsMode::Automatic);
    obs.stop().await;
}

#[tokio::test]
async fn manual_request_settles_within_one_tick() {
    let obs = Observatory::start().await;
    obs.enable_automatic().await;
    obs.tick().await;

    assert_eq!(
        obs.daemon.tel_control(false).await,
        CommandStatus::Succeeded
    );
    settle().await;
    obs.tick().await;
    assert!(matches!(
        obs.daemon.telescope().mode(),
        OperationsMode::Manual | OperationsMode::Error
    ));
    obs.stop().await;
}

#[tokio::test]
async fn status_payload_has_all_sections() {
    let obs = Observatory::start().await;
    obs.tick().await;

    let payload = obs.daemon.status_payload();
    assert_eq!(payload["environment"]["safe"], true);
    assert_eq!(
        payload["environment"]["conditions"]["Rain"][0]["label"],
        "Rain detector"
    );
    assert_eq!(payload["dome"]["mode"], "MANUAL");
    assert_eq!(payload["telescope"]["mode"], "MANUAL");
    assert_eq!(payload["environment"]["updated"], "2024-03-14T22:00:00Z");
    obs.stop().await;
}

#[tokio::test]
async fn pipeline_notifications_return_null_when_idle() {
    let obs = Observatory::start().await;
    assert_eq!(
        obs.daemon.notify_processed_frame(&json!({"EXPTIME": 5})),
        Value::Null
    );
    assert_eq!(
        obs.daemon
            .notify_guide_profile(&json!({}), &[1.0, 2.0], &[3.0]),
        Value::Null
    );
    obs.stop().await;
}

#[tokio::test]
async fn clear_window_requires_automatic_dome() {
    let obs = Observatory::start().await;
    assert_eq!(
        obs.daemon.clear_dome_window().await,
        CommandStatus::DomeNotAutomatic
    );
    obs.enable_automatic().await;
    assert_eq!(
        obs.daemon.clear_dome_window().await,
        CommandStatus::Succeeded
    );
    obs.stop().await;
}
