//! Action that waits until a fixed UTC instant.

use crate::telescope::action::{
    ActionContext, ActionState, ActionStatus, TaskDescriptor, TelescopeAction,
};
use crate::time::{parse_utc, Clock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Waits until the configured UTC time has passed.
pub struct WaitUntil {
    state: ActionState,
    target: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl WaitUntil {
    pub const TYPE: &'static str = "WaitUntil";

    /// Schema check: `{"type": "WaitUntil", "date": "YYYY-MM-DDTHH:MM:SSZ"}`.
    pub fn validate(config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(object) = config.as_object() else {
            return vec!["must be an object".to_string()];
        };
        for key in object.keys() {
            if key != "type" && key != "date" {
                errors.push(format!("unknown key '{key}'"));
            }
        }
        match object.get("date").and_then(Value::as_str) {
            None => errors.push("missing key 'date'".to_string()),
            Some(date) if parse_utc(date).is_err() => {
                errors.push(format!("date: '{date}' is not a valid datetime"));
            }
            Some(_) => {}
        }
        errors
    }

    pub fn new(config: &Value, context: &ActionContext) -> Result<Arc<dyn TelescopeAction>, String> {
        let target = config
            .get("date")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing key 'date'".to_string())
            .and_then(|date| {
                parse_utc(date).map_err(|_| format!("date: '{date}' is not a valid datetime"))
            })?;
        Ok(Arc::new(Self {
            state: ActionState::new(),
            target,
            clock: Arc::clone(&context.clock),
        }))
    }
}

#[async_trait]
impl TelescopeAction for WaitUntil {
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
        self.state
            .set_task(format!("Waiting until {}", self.target.format("%H:%M:%S")));
        loop {
            let remaining = self.target - self.clock.now();
            if remaining <= chrono::Duration::zero() || self.state.is_aborted() {
                break;
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telescope::actions::test_support::context;
    use serde_json::json;

    #[test]
    fn validates_schema() {
        assert!(
            WaitUntil::validate(&json!({"type": "WaitUntil", "date": "2024-03-14T22:00:00Z"}))
                .is_empty()
        );
        assert_eq!(
            WaitUntil::validate(&json!({"type": "WaitUntil"})),
            vec!["missing key 'date'"]
        );
        assert_eq!(
            WaitUntil::validate(&json!({"type": "WaitUntil", "date": "tomorrow"})),
            vec!["date: 'tomorrow' is not a valid datetime"]
        );
    }

    #[tokio::test]
    async fn past_date_completes_immediately() {
        let action =
            WaitUntil::new(&json!({"date": "2000-01-01T00:00:00Z"}), &context()).unwrap();
        action.run().await;
        assert_eq!(action.status(), ActionStatus::Complete);
    }

    #[tokio::test]
    async fn future_date_runs_until_aborted() {
        let action =
            WaitUntil::new(&json!({"date": "2100-01-01T00:00:00Z"}), &context()).unwrap();
        let runner = {
            let action = Arc::clone(&action);
            tokio::spawn(async move { action.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(action.status(), ActionStatus::Running);

        action.abort();
        runner.await.unwrap();
        assert_eq!(action.status(), ActionStatus::Aborted);
    }
}
