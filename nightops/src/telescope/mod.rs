//! Telescope mode state machine and action queue execution.
//!
//! The controller owns an ordered action queue and a worker task that drains
//! it while the telescope is under automatic control. Exactly one action is
//! running at any instant; aborts and mode changes reach it through its own
//! cooperative abort flag, so the worker never has to kill anything.

pub mod action;
pub mod actions;

pub use action::{
    ActionContext, ActionModule, ActionState, ActionStatus, TaskDescriptor, TelescopeAction,
};

use crate::command::{CommandStatus, OperationsMode};
use crate::time::format_utc;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct TelState {
    mode: OperationsMode,
    requested_mode: OperationsMode,
    status_updated: DateTime<Utc>,
    queue: VecDeque<Arc<dyn TelescopeAction>>,
    active: Option<Arc<dyn TelescopeAction>>,
    /// True while there is nothing useful to do and the telescope is parked.
    idle: bool,
    /// True while the active action is the automatic park.
    parking: bool,
    dome_was_open: bool,
}

/// Controller for the telescope action queue.
pub struct TelescopeController {
    context: ActionContext,
    module: Arc<dyn ActionModule>,
    loop_delay: Duration,
    state: Mutex<TelState>,
    wake: Notify,
}

impl TelescopeController {
    /// Creates a controller in manual mode with an empty queue.
    pub fn new(
        module: Arc<dyn ActionModule>,
        context: ActionContext,
        loop_delay: Duration,
    ) -> Arc<Self> {
        let now = context.clock.now();
        Arc::new(Self {
            context,
            module,
            loop_delay,
            state: Mutex::new(TelState {
                mode: OperationsMode::Manual,
                requested_mode: OperationsMode::Manual,
                status_updated: now,
                queue: VecDeque::new(),
                active: None,
                idle: true,
                parking: false,
                dome_was_open: false,
            }),
            wake: Notify::new(),
        })
    }

    /// Current operations mode.
    pub fn mode(&self) -> OperationsMode {
        self.state.lock().unwrap().mode
    }

    /// Worker loop: drains the action queue while automatic, sleeping
    /// `loop_delay` between reconciliation passes unless woken early.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("telescope worker starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            // Run queued actions back to back without sleeping in between.
            while self.step().await {}

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.loop_delay) => {}
            }
        }
        info!("telescope worker stopped");
    }

    /// One reconciliation pass. Returns true if an action was executed, in
    /// which case the caller should immediately reconcile again.
    async fn step(&self) -> bool {
        let to_run = {
            let mut state = self.state.lock().unwrap();
            state.status_updated = self.context.clock.now();

            if state.requested_mode == OperationsMode::Manual
                && state.mode != OperationsMode::Manual
                && state.active.is_none()
            {
                info!("telescope switched to MANUAL mode");
                state.mode = OperationsMode::Manual;
            }

            if state.mode != OperationsMode::Automatic {
                None
            } else if state.active.is_some() {
                None
            } else if let Some(next) = state.queue.pop_front() {
                state.idle = false;
                state.parking = false;
                state.active = Some(Arc::clone(&next));
                Some(next)
            } else if !state.idle {
                // Nothing left to do: stow the telescope until new actions
                // arrive.
                match self.module.park(&self.context) {
                    Some(park) => {
                        info!("action queue empty, parking telescope");
                        state.parking = true;
                        state.active = Some(Arc::clone(&park));
                        Some(park)
                    }
                    None => {
                        state.idle = true;
                        None
                    }
                }
            } else {
                None
            }
        };

        let Some(action) = to_run else {
            return false;
        };

        let dome_is_open = self.state.lock().unwrap().dome_was_open;
        action.dome_is_open_changed(dome_is_open);
        info!("starting action: {}", action.name());
        action.run().await;
        let outcome = action.status();
        info!("action {} finished: {:?}", action.name(), outcome);

        let mut state = self.state.lock().unwrap();
        state.status_updated = self.context.clock.now();
        if state.parking {
            state.idle = true;
            state.parking = false;
        }
        state.active = None;
        if outcome == ActionStatus::Error {
            error!("action failed: {}", action.name());
            // The queue is left intact for operator inspection.
            state.mode = OperationsMode::Error;
            state.requested_mode = OperationsMode::Error;
            state.idle = true;
        }
        true
    }

    /// Requests a mode change.
    ///
    /// Switching to automatic takes effect immediately (and acknowledges an
    /// error state). Switching to manual aborts the running action and
    /// drains the queue; the mode flips once the action has wound down.
    pub fn request_mode(&self, target: OperationsMode) -> CommandStatus {
        {
            let mut state = self.state.lock().unwrap();
            state.requested_mode = target;
            match target {
                OperationsMode::Automatic => {
                    if state.mode == OperationsMode::Error {
                        info!("telescope error state cleared by operator");
                    }
                    if state.mode != OperationsMode::Automatic {
                        info!("telescope switched to AUTOMATIC mode");
                    }
                    state.mode = OperationsMode::Automatic;
                }
                OperationsMode::Manual => {
                    if state.mode != OperationsMode::Manual {
                        if let Some(active) = &state.active {
                            info!("aborting action queue");
                            active.abort();
                        }
                        Self::drain_queue(&mut state);
                        if state.active.is_none() {
                            info!("telescope switched to MANUAL mode");
                            state.mode = OperationsMode::Manual;
                        }
                    }
                }
                _ => return CommandStatus::Failed,
            }
        }
        self.wake.notify_waiters();
        CommandStatus::Succeeded
    }

    /// Aborts the running action and drains the queue without changing
    /// mode. Idempotent.
    pub fn abort(&self) -> CommandStatus {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = &state.active {
                info!("stopping telescope: aborting running action");
                active.abort();
            }
            Self::drain_queue(&mut state);
        }
        self.wake.notify_waiters();
        CommandStatus::Succeeded
    }

    fn drain_queue(state: &mut TelState) {
        for action in state.queue.drain(..) {
            action.abort();
        }
    }

    /// Appends actions to the queue. Requires automatic mode.
    pub fn queue_actions(&self, actions: Vec<Arc<dyn TelescopeAction>>) -> CommandStatus {
        {
            let mut state = self.state.lock().unwrap();
            if state.mode != OperationsMode::Automatic {
                return CommandStatus::TelescopeNotAutomatic;
            }
            info!("queueing {} action(s)", actions.len());
            state.queue.extend(actions);
        }
        self.wake.notify_waiters();
        CommandStatus::Succeeded
    }

    /// Latest dome-open verdict from the operations tick. Forwarded to the
    /// running action on change so it can react to the dome closing.
    pub fn notify_dome_state(&self, dome_is_open: bool) {
        let active = {
            let mut state = self.state.lock().unwrap();
            if state.dome_was_open == dome_is_open {
                return;
            }
            state.dome_was_open = dome_is_open;
            state.active.clone()
        };
        if let Some(action) = active {
            if action.status() == ActionStatus::Running {
                action.dome_is_open_changed(dome_is_open);
            }
        }
    }

    /// Pipeline notification: a frame finished processing.
    pub fn notify_processed_frame(&self, headers: &Value) -> Option<Value> {
        let active = self.state.lock().unwrap().active.clone();
        active
            .filter(|action| action.status() == ActionStatus::Running)
            .and_then(|action| action.received_frame(headers))
    }

    /// Pipeline notification: a guide profile was measured.
    pub fn notify_guide_profile(&self, headers: &Value, x: &[f64], y: &[f64]) -> Option<Value> {
        let active = self.state.lock().unwrap().active.clone();
        active
            .filter(|action| action.status() == ActionStatus::Running)
            .and_then(|action| action.received_guide_profile(headers, x, y))
    }

    /// Status-payload fragment: mode plus the visible schedule (the running
    /// action followed by everything still queued).
    pub fn status_json(&self) -> Value {
        let state = self.state.lock().unwrap();
        let mut schedule = Vec::new();
        if let Some(active) = &state.active {
            if active.status() == ActionStatus::Running {
                schedule.push(json!({
                    "name": active.name(),
                    "tasks": active.task_labels(),
                    "state": active.status(),
                }));
            }
        }
        for action in &state.queue {
            schedule.push(json!({
                "name": action.name(),
                "tasks": action.task_labels(),
                "state": action.status(),
            }));
        }
        json!({
            "mode": state.mode,
            "requested_mode": state.requested_mode,
            "status_updated": format_utc(state.status_updated),
            "schedule": schedule,
        })
    }
}
