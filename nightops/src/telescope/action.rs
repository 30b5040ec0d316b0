//! Telescope action capability set.
//!
//! An action is a scripted unit of telescope behaviour owning its own state
//! machine. The controller drives actions through [`TelescopeAction`] and
//! never reaches into their internals; all coupling (dome state, pipeline
//! notifications, aborts) flows through the trait methods. Concrete actions
//! come from an [`ActionModule`] resolved by registry id at config load.

use crate::sun::Site;
use crate::time::Clock;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Lifecycle state of an action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ActionStatus {
    /// Queued, not yet started.
    #[default]
    Pending,
    /// Currently being driven by the telescope worker.
    Running,
    /// Finished successfully.
    Complete,
    /// Stopped before completion, either directly or by a queue drain.
    Aborted,
    /// Failed; elevates the telescope controller to error mode.
    Error,
}

impl ActionStatus {
    /// Returns true once the action can be removed from the controller.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Error)
    }
}

/// One entry in an action's task list: a plain label or a titled group.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskDescriptor {
    Label(String),
    Group(Vec<String>),
}

impl TaskDescriptor {
    pub fn label(text: impl Into<String>) -> Self {
        Self::Label(text.into())
    }
}

/// Site context handed to actions when they are constructed.
#[derive(Clone)]
pub struct ActionContext {
    pub log_name: String,
    pub site: Site,
    pub clock: Arc<dyn Clock>,
}

/// Capability set the telescope controller requires from every action.
#[async_trait]
pub trait TelescopeAction: Send + Sync + 'static {
    /// Short human-readable name shown in the schedule table.
    fn name(&self) -> &str;

    /// Current lifecycle state.
    fn status(&self) -> ActionStatus;

    /// Task descriptors shown in the schedule table.
    fn task_labels(&self) -> Vec<TaskDescriptor>;

    /// Drives the action to a terminal state. Cooperative: implementations
    /// must observe the abort flag at reasonable granularity (at least once
    /// per second while waiting).
    async fn run(&self);

    /// Requests a graceful stop. Idempotent; a pending action transitions
    /// straight to `Aborted`.
    fn abort(&self);

    /// Notifies the action that the dome has fully opened or closed.
    fn dome_is_open_changed(&self, dome_is_open: bool);

    /// Pipeline notification: a frame finished processing. May return extra
    /// header cards to include in saved images.
    fn received_frame(&self, _headers: &Value) -> Option<Value> {
        None
    }

    /// Pipeline notification: a guide profile was measured.
    fn received_guide_profile(&self, _headers: &Value, _x: &[f64], _y: &[f64]) -> Option<Value> {
        None
    }
}

/// Source of actions for one telescope, selected by the config's
/// `actions_module` key.
pub trait ActionModule: Send + Sync {
    /// Registry id of this module.
    fn name(&self) -> &'static str;

    /// Validates an action block against the action's parameter schema.
    /// Returns `None` when the action type is unknown.
    fn validate(&self, action_type: &str, config: &Value) -> Option<Vec<String>>;

    /// Constructs an action from a validated block.
    fn build(
        &self,
        action_type: &str,
        config: &Value,
        context: &ActionContext,
    ) -> Result<Arc<dyn TelescopeAction>, String>;

    /// The action run when the queue empties, to stow the telescope.
    fn park(&self, context: &ActionContext) -> Option<Arc<dyn TelescopeAction>>;
}

/// Shared bookkeeping for action implementations: status, abort flag, dome
/// state, and the currently displayed task label.
///
/// Every built-in action embeds one of these; bespoke actions are free to
/// roll their own as long as they honour the trait contract.
pub struct ActionState {
    status: Mutex<ActionStatus>,
    aborted: AtomicBool,
    dome_is_open: Mutex<bool>,
    current_task: Mutex<Option<String>>,
    wake: Notify,
}

impl Default for ActionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ActionStatus::Pending),
            aborted: AtomicBool::new(false),
            dome_is_open: Mutex::new(false),
            current_task: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn status(&self) -> ActionStatus {
        *self.status.lock().unwrap()
    }

    /// Transitions `Pending -> Running`. Returns false if the action was
    /// aborted before it ever started, in which case `run` should return
    /// without doing anything.
    pub fn begin(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        if *status == ActionStatus::Pending {
            *status = ActionStatus::Running;
            true
        } else {
            false
        }
    }

    /// Records the terminal state. A stop that lands exactly at the final
    /// checkpoint still reports `Aborted` rather than `Complete`; an
    /// `Error` outcome is preserved either way.
    pub fn finish(&self, terminal: ActionStatus) {
        let mut status = self.status.lock().unwrap();
        if *status == ActionStatus::Running {
            *status = if terminal == ActionStatus::Complete && self.is_aborted() {
                ActionStatus::Aborted
            } else {
                terminal
            };
        }
    }

    /// Flags the action aborted and wakes any cooperative wait. A pending
    /// action goes straight to `Aborted`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        {
            let mut status = self.status.lock().unwrap();
            if *status == ActionStatus::Pending {
                *status = ActionStatus::Aborted;
            }
        }
        self.wake.notify_waiters();
    }

    /// True once an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn set_dome_is_open(&self, dome_is_open: bool) {
        *self.dome_is_open.lock().unwrap() = dome_is_open;
        self.wake.notify_waiters();
    }

    pub fn dome_is_open(&self) -> bool {
        *self.dome_is_open.lock().unwrap()
    }

    pub fn set_task(&self, label: impl Into<String>) {
        *self.current_task.lock().unwrap() = Some(label.into());
    }

    pub fn task_labels(&self) -> Vec<TaskDescriptor> {
        self.current_task
            .lock()
            .unwrap()
            .iter()
            .map(|label| TaskDescriptor::label(label.clone()))
            .collect()
    }

    /// Sleeps up to `duration`, returning early when the action is woken by
    /// an abort or a dome change.
    pub async fn interruptible_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }
}
