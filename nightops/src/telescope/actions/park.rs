//! Action that stows the telescope.
//!
//! The simulated module has no mount hardware, so parking is a single
//! bookkeeping step. The controller queues this action automatically when
//! the queue runs dry.

use crate::telescope::action::{
    ActionContext, ActionState, ActionStatus, TaskDescriptor, TelescopeAction,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Stows the telescope at the park position.
pub struct Park {
    state: ActionState,
}

impl Park {
    pub const TYPE: &'static str = "Park";

    pub fn validate(config: &Value) -> Vec<String> {
        let Some(object) = config.as_object() else {
            return vec!["must be an object".to_string()];
        };
        object
            .keys()
            .filter(|key| key.as_str() != "type")
            .map(|key| format!("unknown key '{key}'"))
            .collect()
    }

    pub fn new(_config: &Value, _context: &ActionContext) -> Result<Arc<dyn TelescopeAction>, String> {
        Ok(Arc::new(Self {
            state: ActionState::new(),
        }))
    }
}

#[async_trait]
impl TelescopeAction for Park {
    fn name(&self) -> &str {
        "Parking"
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
        self.state.set_task("Stowing telescope");
        self.state.finish(ActionStatus::Complete);
    }

    fn abort(&self) {
        self.state.abort();
    }

    fn dome_is_open_changed(&self, dome_is_open: bool) {
        self.state.set_dome_is_open(dome_is_open);
    }
}
