//! Blocking HTTP client for the operations daemon's RPC surface.

use crate::error::CliError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Command replies as the daemon serializes them.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandReply {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl CommandReply {
    /// Converts a non-zero reply into an error for `?` chains.
    pub fn into_result(self) -> Result<(), CliError> {
        if self.code == 0 {
            Ok(())
        } else {
            Err(CliError::Command(self))
        }
    }
}

/// Default round-trip timeout. Mode changes run a backend handshake, so
/// this is longer than a plain status query needs.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client bound to one daemon address.
pub struct DaemonClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl DaemonClient {
    /// Creates a client for the `host:port` address from the site config.
    pub fn new(address: &str) -> Result<Self, CliError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CliError::Local(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{address}"),
            client,
        })
    }

    /// Fetches the full status payload.
    pub fn status(&self) -> Result<Value, CliError> {
        self.client
            .get(format!("{}/status", self.base_url))
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|e| CliError::Transport(e.to_string()))
    }

    /// Switches the dome between automatic and manual control.
    pub fn dome_control(&self, auto: bool) -> Result<CommandReply, CliError> {
        self.post("/dome/control", &json!({"auto": auto}))
    }

    /// Clears the dome open window.
    pub fn clear_dome_window(&self) -> Result<CommandReply, CliError> {
        self.post("/dome/clear_window", &Value::Null)
    }

    /// Switches the telescope between automatic and manual control.
    pub fn tel_control(&self, auto: bool) -> Result<CommandReply, CliError> {
        self.post("/telescope/control", &json!({"auto": auto}))
    }

    /// Aborts the running action and drains the queue.
    pub fn stop_telescope(&self) -> Result<CommandReply, CliError> {
        self.post("/telescope/stop", &Value::Null)
    }

    /// Submits a schedule for tonight.
    pub fn schedule_observations(&self, schedule: &Value) -> Result<CommandReply, CliError> {
        self.post("/schedule", schedule)
    }

    fn post(&self, path: &str, body: &Value) -> Result<CommandReply, CliError> {
        self.client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|e| CliError::Transport(e.to_string()))
    }
}
