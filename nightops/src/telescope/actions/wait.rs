//! Action that waits for a fixed number of seconds.

use crate::telescope::action::{
    ActionContext, ActionState, ActionStatus, TaskDescriptor, TelescopeAction,
};
use crate::time::Clock;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Longest uninterrupted sleep between abort checks.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Waits out a configured delay, counting down in the task label.
pub struct Wait {
    state: ActionState,
    delay: Duration,
    clock: Arc<dyn Clock>,
}

impl Wait {
    pub const TYPE: &'static str = "Wait";

    /// Schema check for the action block: `{"type": "Wait", "delay": <seconds>}`.
    pub fn validate(config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(object) = config.as_object() else {
            return vec!["must be an object".to_string()];
        };
        for key in object.keys() {
            if key != "type" && key != "delay" {
                errors.push(format!("unknown key '{key}'"));
            }
        }
        match object.get("delay") {
            None => errors.push("missing key 'delay'".to_string()),
            Some(delay) if delay.as_f64().is_none_or(|d| d < 0.0) => {
                errors.push("delay: must be a non-negative number".to_string());
            }
            Some(_) => {}
        }
        errors
    }

    pub fn new(config: &Value, context: &ActionContext) -> Result<Arc<dyn TelescopeAction>, String> {
        let delay = config
            .get("delay")
            .and_then(Value::as_f64)
            .filter(|d| *d >= 0.0)
            .ok_or_else(|| "delay: must be a non-negative number".to_string())?;
        Ok(Arc::new(Self {
            state: ActionState::new(),
            delay: Duration::from_secs_f64(delay),
            clock: Arc::clone(&context.clock),
        }))
    }
}

#[async_trait]
impl TelescopeAction for Wait {
    fn name(&self) -> &str {
        "Waiting"
    }

    fn status(&self) -> ActionStatus {
        self.state.status()
    }

    fn task_labels(&self) -> Vec<TaskDescriptor> {
        self.state.task_labels()
    }

    async fn run(&self) {
        if !self.state.begin() {
            return;
        }
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());
        loop {
            let remaining = deadline - self.clock.now();
            if remaining <= chrono::Duration::zero() || self.state.is_aborted() {
                break;
            }
            self.state
                .set_task(format!("Waiting ({}s remaining)", remaining.num_seconds()));
            let sleep = remaining
                .to_std()
                .map(|r| r.min(POLL_INTERVAL))
                .unwrap_or(POLL_INTERVAL);
            self.state.interruptible_sleep(sleep).await;
        }
        self.state.finish(ActionStatus::Complete);
    }

    fn abort(&self) {
        self.state.abort();
    }

    fn dome_is_open_changed(&self, dome_is_open: bool) {
        self.state.set_dome_is_open(dome_is_open);
    }
}
