//! Built-in telescope action modules.
//!
//! Real observatories plug in a site-specific module with hardware-driving
//! actions; the `simulated` module ships in-tree for integration testing
//! and for commissioning a site before its hardware module exists.

mod park;
mod wait;
mod wait_until;

pub use park::Park;
pub use wait::Wait;
pub use wait_until::WaitUntil;

use crate::telescope::action::{ActionContext, ActionModule, TelescopeAction};
use serde_json::{json, Value};
use std::sync::Arc;

/// Action module backed entirely by software.
pub struct SimulatedActions;

impl ActionModule for SimulatedActions {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn validate(&self, action_type: &str, config: &Value) -> Option<Vec<String>> {
        match action_type {
            Wait::TYPE => Some(Wait::validate(config)),
            WaitUntil::TYPE => Some(WaitUntil::validate(config)),
            Park::TYPE => Some(Park::validate(config)),
            _ => None,
        }
    }

    fn build(
        &self,
        action_type: &str,
        config: &Value,
        context: &ActionContext,
    ) -> Result<Arc<dyn TelescopeAction>, String> {
        match action_type {
            Wait::TYPE => Wait::new(config, context),
            WaitUntil::TYPE => WaitUntil::new(config, context),
            Park::TYPE => Park::new(config, context),
            _ => Err(format!("unknown action type '{action_type}'")),
        }
    }

    fn park(&self, context: &ActionContext) -> Option<Arc<dyn TelescopeAction>> {
        Park::new(&json!({}), context).ok()
    }
}

/// Resolves an action module id from the config's `actions_module` key.
pub fn lookup_module(name: &str) -> Option<Arc<dyn ActionModule>> {
    match name {
        "simulated" => Some(Arc::new(SimulatedActions)),
        _ => None,
    }
}
