//! The operations daemon: composition of the environment watcher, the dome
//! and telescope controllers, and the periodic tick.
//!
//! One tick runs every `loop_delay`: poll the environment, reconcile the
//! dome against the snapshot just produced, then hand the dome-open verdict
//! to the telescope. Mutating remote commands wake the tick early so a new
//! window or freshly queued actions take effect without waiting out the
//! delay.

use crate::command::{CommandStatus, OperationsMode};
use crate::config::{Config, ConfigError};
use crate::dome::{lookup_backend, DomeController, DomeInterface, DomePolicy};
use crate::environment::{EnvironmentSource, EnvironmentWatcher, HttpEnvironmentSource};
use crate::schedule::{parse_dome_window, parse_schedule_actions, validate_schedule};
use crate::telescope::{ActionContext, TelescopeController};
use crate::time::{Clock, SystemClock};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Long-lived state shared by the tick loop and the RPC surface.
pub struct OperationsDaemon {
    config: Config,
    clock: Arc<dyn Clock>,
    environment: Arc<EnvironmentWatcher>,
    dome: Option<Arc<DomeController>>,
    telescope: Arc<TelescopeController>,
    command_lock: Mutex<()>,
    tick_wake: Notify,
}

impl OperationsDaemon {
    /// Builds the daemon from a validated config, resolving the environment
    /// source and dome backend from their registries.
    pub fn from_config(config: Config) -> Result<Arc<Self>, ConfigError> {
        let source = HttpEnvironmentSource::new(&config.environment_daemon).map_err(|e| {
            ConfigError::Invalid {
                errors: vec![format!("environment_daemon: {e}")],
            }
        })?;

        let dome_backend = match &config.dome {
            None => None,
            Some(dome_config) => {
                let constructor = lookup_backend(&dome_config.module).ok_or_else(|| {
                    ConfigError::Invalid {
                        errors: vec![format!(
                            "dome: module '{}' is not a registered dome backend",
                            dome_config.module
                        )],
                    }
                })?;
                Some(constructor(dome_config).map_err(|e| ConfigError::Invalid {
                    errors: vec![format!("dome: {e}")],
                })?)
            }
        };

        Ok(Self::with_backends(
            config,
            Arc::new(source),
            dome_backend,
            Arc::new(SystemClock),
        ))
    }

    /// Builds the daemon with explicit backends. This is the seam the
    /// integration tests use to inject a scripted environment, a simulated
    /// dome, and a pinned clock.
    pub fn with_backends(
        config: Config,
        source: Arc<dyn EnvironmentSource>,
        dome_backend: Option<Arc<dyn DomeInterface>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let environment = Arc::new(EnvironmentWatcher::new(
            source,
            Arc::clone(&clock),
            config.environment_conditions.clone(),
            config.environment_grace_polls,
        ));

        let dome = dome_backend.map(|backend| {
            let policy = config
                .dome
                .as_ref()
                .map(DomePolicy::from)
                .expect("dome backend implies dome config");
            Arc::new(DomeController::new(backend, Arc::clone(&clock), policy))
        });

        let module = crate::telescope::actions::lookup_module(&config.actions_module)
            .expect("actions module resolved during config validation");
        let context = ActionContext {
            log_name: config.log_name.clone(),
            site: config.site(),
            clock: Arc::clone(&clock),
        };
        let telescope = TelescopeController::new(module, context, config.loop_delay());

        Arc::new(Self {
            config,
            clock,
            environment,
            dome,
            telescope,
            command_lock: Mutex::new(()),
            tick_wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn environment(&self) -> &Arc<EnvironmentWatcher> {
        &self.environment
    }

    pub fn dome(&self) -> Option<&Arc<DomeController>> {
        self.dome.as_ref()
    }

    pub fn telescope(&self) -> &Arc<TelescopeController> {
        &self.telescope
    }

    /// The command try-lock guarding all mutating RPCs.
    pub fn command_lock(&self) -> &Mutex<()> {
        &self.command_lock
    }

    fn action_context(&self) -> ActionContext {
        ActionContext {
            log_name: self.config.log_name.clone(),
            site: self.config.site(),
            clock: Arc::clone(&self.clock),
        }
    }

    /// One operations tick: environment poll, dome reconciliation, dome
    /// state forwarding. The telescope worker runs independently.
    pub async fn run_tick(&self) {
        let snapshot = self.environment.poll().await;
        if let Some(dome) = &self.dome {
            dome.tick(&snapshot).await;
        }
        let dome_is_open = match &self.dome {
            Some(dome) => dome.is_open_for_observing(),
            // Dome-less sites treat a safe environment as an open sky.
            None => snapshot.safe,
        };
        self.telescope.notify_dome_state(dome_is_open);
    }

    /// Runs the daemon until the token is cancelled: tick loop, telescope
    /// worker, and the RPC listener.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        info!("operations daemon starting");

        let tick_daemon = Arc::clone(&self);
        let tick_shutdown = shutdown.clone();
        let tick_task = tokio::spawn(async move {
            loop {
                tick_daemon.run_tick().await;
                tokio::select! {
                    _ = tick_shutdown.cancelled() => break,
                    _ = tick_daemon.tick_wake.notified() => {}
                    _ = tokio::time::sleep(tick_daemon.config.loop_delay()) => {}
                }
            }
        });

        let worker = tokio::spawn(Arc::clone(&self.telescope).run(shutdown.clone()));

        let listener = TcpListener::bind(&self.config.daemon).await?;
        info!("listening on {}", self.config.daemon);
        let router = crate::server::router(Arc::clone(&self));
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

        if tick_task.await.is_err() {
            error!("tick loop terminated abnormally");
        }
        if worker.await.is_err() {
            error!("telescope worker terminated abnormally");
        }
        info!("operations daemon stopped");
        Ok(())
    }

    /// Wakes the tick loop so a state change takes effect immediately.
    pub fn wake_tick(&self) {
        self.tick_wake.notify_waiters();
    }

    /// Switches the dome between automatic and manual control.
    pub async fn dome_control(&self, auto: bool) -> CommandStatus {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return CommandStatus::Blocked;
        };
        let Some(dome) = &self.dome else {
            return CommandStatus::Failed;
        };
        let target = if auto {
            OperationsMode::Automatic
        } else {
            OperationsMode::Manual
        };
        let status = dome.request_mode(target).await;
        self.wake_tick();
        status
    }

    /// Switches the telescope between automatic and manual control.
    pub async fn tel_control(&self, auto: bool) -> CommandStatus {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return CommandStatus::Blocked;
        };
        let target = if auto {
            OperationsMode::Automatic
        } else {
            OperationsMode::Manual
        };
        let status = self.telescope.request_mode(target);
        self.wake_tick();
        status
    }

    /// Aborts the running action and drains the queue.
    pub async fn stop_telescope(&self) -> CommandStatus {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return CommandStatus::Blocked;
        };
        let status = self.telescope.abort();
        self.wake_tick();
        status
    }

    /// Clears the dome open window.
    pub async fn clear_dome_window(&self) -> CommandStatus {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return CommandStatus::Blocked;
        };
        let Some(dome) = &self.dome else {
            return CommandStatus::Failed;
        };
        let status = dome.clear_window();
        self.wake_tick();
        status
    }

    /// Validates and commits a schedule: dome window first, then the action
    /// queue. Either both commit or neither; a failed queue step rolls the
    /// window back before returning.
    pub async fn schedule_observations(&self, schedule: &Value) -> (CommandStatus, Vec<String>) {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return (CommandStatus::Blocked, Vec::new());
        };
        let now = self.clock.now();

        let (valid, errors) = validate_schedule(schedule, &self.config, now, true);
        if !valid {
            return (CommandStatus::InvalidSchedule, errors);
        }

        let window = match parse_dome_window(schedule, &self.config) {
            Ok(window) => window,
            Err(error) => return (CommandStatus::InvalidSchedule, vec![error]),
        };
        let actions = match parse_schedule_actions(&self.config, schedule, &self.action_context()) {
            Ok(actions) => actions,
            Err(error) => return (CommandStatus::InvalidSchedule, vec![error]),
        };

        let mut committed_window = None;
        if let Some((open_at, close_at)) = window {
            let Some(dome) = &self.dome else {
                return (
                    CommandStatus::DomeNotAutomatic,
                    vec!["no dome is configured at this site".to_string()],
                );
            };
            if dome.mode() == OperationsMode::Error {
                return (CommandStatus::InErrorState, Vec::new());
            }
            // Opening immediately requires the environment to be safe now.
            if open_at < now && now < close_at && !self.environment.latest().safe {
                return (CommandStatus::EnvironmentNotSafe, Vec::new());
            }
            let previous = dome.window();
            let status = dome.set_window(open_at, close_at);
            if status != CommandStatus::Succeeded {
                return (status, Vec::new());
            }
            committed_window = Some(previous);
        }

        if !actions.is_empty() {
            let rollback = |daemon: &Self| {
                if let (Some(previous), Some(dome)) = (committed_window, &daemon.dome) {
                    dome.restore_window(previous);
                }
            };
            if self.telescope.mode() == OperationsMode::Error {
                rollback(self);
                return (CommandStatus::InErrorState, Vec::new());
            }
            let status = self.telescope.queue_actions(actions);
            if status != CommandStatus::Succeeded {
                rollback(self);
                return (status, Vec::new());
            }
        }

        self.wake_tick();
        (CommandStatus::Succeeded, Vec::new())
    }

    /// Full status payload for the `status` RPC.
    pub fn status_payload(&self) -> Value {
        let mut payload = json!({
            "environment": self.environment.latest().to_json(),
            "telescope": self.telescope.status_json(),
        });
        if let Some(dome) = &self.dome {
            payload["dome"] = dome.status_json();
        }
        payload
    }

    /// Pipeline notification: a processed frame. Returns extra header cards
    /// from the running action, or null.
    pub fn notify_processed_frame(&self, headers: &Value) -> Value {
        self.telescope
            .notify_processed_frame(headers)
            .unwrap_or(Value::Null)
    }

    /// Pipeline notification: a guide profile. Returns extra header cards
    /// from the running action, or null.
    pub fn notify_guide_profile(&self, headers: &Value, x: &[f64], y: &[f64]) -> Value {
        self.telescope
            .notify_guide_profile(headers, x, y)
            .unwrap_or(Value::Null)
    }
}
