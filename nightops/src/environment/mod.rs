//! Environment aggregation: raw sensor values folded into safety verdicts.
//!
//! Once per tick the watcher pulls the environment daemon's data dictionary
//! and reduces it to one boolean per condition group and one aggregate flag.
//! A condition is unsafe when any sensor flags unsafe or when every sensor
//! has gone stale; the aggregate is the conjunction over all conditions.

mod source;

pub use source::{EnvironmentError, EnvironmentSource, HttpEnvironmentSource};

use crate::config::{ConditionConfig, SensorConfig};
use crate::time::{format_utc, parse_utc, Clock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

/// One sensor's contribution to a condition verdict.
#[derive(Clone, Debug, Serialize)]
pub struct SensorReading {
    pub label: String,
    /// Latest reported value, or null when the sensor is unavailable.
    pub value: Value,
    #[serde(rename = "unsafe")]
    pub is_unsafe: bool,
    pub stale: bool,
}

impl SensorReading {
    fn unavailable(label: &str) -> Self {
        Self {
            label: label.to_string(),
            value: Value::Null,
            is_unsafe: false,
            stale: true,
        }
    }

    /// A sensor counts towards condition safety only while fresh.
    pub fn is_fresh(&self) -> bool {
        !self.stale
    }
}

/// Verdict for one condition group.
#[derive(Clone, Debug)]
pub struct ConditionReport {
    pub label: String,
    pub safe: bool,
    pub sensors: Vec<SensorReading>,
}

/// Point-in-time aggregate of the whole environment.
#[derive(Clone, Debug)]
pub struct EnvironmentSnapshot {
    /// Time of the last successful poll; `None` before the first.
    pub updated: Option<DateTime<Utc>>,
    /// True when every condition is safe.
    pub safe: bool,
    pub conditions: Vec<ConditionReport>,
}

impl EnvironmentSnapshot {
    /// Snapshot used before the first poll: everything unavailable, unsafe.
    fn initial(conditions: &[ConditionConfig]) -> Self {
        Self {
            updated: None,
            safe: false,
            conditions: conditions
                .iter()
                .map(|condition| ConditionReport {
                    label: condition.label.clone(),
                    safe: false,
                    sensors: condition
                        .sensors
                        .iter()
                        .map(|sensor| SensorReading::unavailable(&sensor.label))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Renders the status-payload shape:
    /// `{updated, safe, conditions: {label: [sensor, ...]}}`.
    pub fn to_json(&self) -> Value {
        let mut conditions = serde_json::Map::new();
        for condition in &self.conditions {
            conditions.insert(
                condition.label.clone(),
                serde_json::to_value(&condition.sensors).unwrap_or(Value::Null),
            );
        }
        json!({
            "updated": self.updated.map(format_utc),
            "safe": self.safe,
            "conditions": Value::Object(conditions),
        })
    }
}

struct WatcherState {
    consecutive_failures: u32,
    snapshot: Arc<EnvironmentSnapshot>,
}

/// Polls the environment daemon and publishes aggregated snapshots.
///
/// Snapshots are published whole on a watch channel so readers (the dome
/// tick, the status RPC) never block the poller.
pub struct EnvironmentWatcher {
    source: Arc<dyn EnvironmentSource>,
    clock: Arc<dyn Clock>,
    conditions: Vec<ConditionConfig>,
    grace_polls: u32,
    state: Mutex<WatcherState>,
    tx: watch::Sender<Arc<EnvironmentSnapshot>>,
}

impl EnvironmentWatcher {
    /// Creates a watcher over the given condition groups.
    pub fn new(
        source: Arc<dyn EnvironmentSource>,
        clock: Arc<dyn Clock>,
        conditions: Vec<ConditionConfig>,
        grace_polls: u32,
    ) -> Self {
        let snapshot = Arc::new(EnvironmentSnapshot::initial(&conditions));
        let (tx, _) = watch::channel(Arc::clone(&snapshot));
        Self {
            source,
            clock,
            conditions,
            grace_polls,
            state: Mutex::new(WatcherState {
                consecutive_failures: 0,
                snapshot,
            }),
            tx,
        }
    }

    /// Returns the most recently published snapshot.
    pub fn latest(&self) -> Arc<EnvironmentSnapshot> {
        Arc::clone(&self.state.lock().unwrap().snapshot)
    }

    /// Subscribes to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EnvironmentSnapshot>> {
        self.tx.subscribe()
    }

    /// Queries the environment daemon once and publishes the new snapshot.
    pub async fn poll(&self) -> Arc<EnvironmentSnapshot> {
        let result = self.source.query().await;
        let now = self.clock.now();

        let mut state = self.state.lock().unwrap();
        let was_safe = state.snapshot.safe;

        let snapshot = match result {
            Ok(data) => {
                state.consecutive_failures = 0;
                Arc::new(self.evaluate(&data, now))
            }
            Err(e) => {
                state.consecutive_failures += 1;
                warn!(
                    failures = state.consecutive_failures,
                    "failed to query environment: {e}"
                );
                Arc::new(Self::degrade(
                    &state.snapshot,
                    state.consecutive_failures > self.grace_polls,
                ))
            }
        };

        if was_safe && !snapshot.safe {
            let unsafe_labels: Vec<&str> = snapshot
                .conditions
                .iter()
                .filter(|c| !c.safe)
                .map(|c| c.label.as_str())
                .collect();
            warn!("environment has become unsafe ({})", unsafe_labels.join(", "));
        } else if !was_safe && snapshot.safe {
            info!("environment is safe again");
        }

        state.snapshot = Arc::clone(&snapshot);
        let _ = self.tx.send(Arc::clone(&snapshot));
        snapshot
    }

    /// Folds a raw data dictionary into a snapshot.
    fn evaluate(&self, data: &Value, now: DateTime<Utc>) -> EnvironmentSnapshot {
        let conditions: Vec<ConditionReport> = self
            .conditions
            .iter()
            .map(|condition| {
                let sensors: Vec<SensorReading> = condition
                    .sensors
                    .iter()
                    .map(|sensor| read_sensor(sensor, data, now))
                    .collect();
                let any_fresh = sensors.iter().any(SensorReading::is_fresh);
                let any_unsafe = sensors.iter().any(|s| s.is_unsafe);
                ConditionReport {
                    label: condition.label.clone(),
                    safe: any_fresh && !any_unsafe,
                    sensors,
                }
            })
            .collect();

        EnvironmentSnapshot {
            updated: Some(now),
            safe: conditions.iter().all(|c| c.safe),
            conditions,
        }
    }

    /// Carries the previous snapshot through a failed poll: values are kept
    /// but every sensor is marked stale. Within the grace window the old
    /// verdicts stand; beyond it the aggregate is forced unsafe.
    fn degrade(previous: &EnvironmentSnapshot, out_of_grace: bool) -> EnvironmentSnapshot {
        let conditions: Vec<ConditionReport> = previous
            .conditions
            .iter()
            .map(|condition| ConditionReport {
                label: condition.label.clone(),
                safe: condition.safe,
                sensors: condition
                    .sensors
                    .iter()
                    .map(|sensor| SensorReading {
                        stale: true,
                        ..sensor.clone()
                    })
                    .collect(),
            })
            .collect();

        EnvironmentSnapshot {
            updated: previous.updated,
            safe: !out_of_grace && previous.safe,
            conditions,
        }
    }
}

/// Extracts one sensor reading from the raw data dictionary.
fn read_sensor(config: &SensorConfig, data: &Value, now: DateTime<Utc>) -> SensorReading {
    let Some(parameter) = data
        .get(&config.sensor)
        .and_then(|sensor| sensor.get("parameters"))
        .and_then(|parameters| parameters.get(&config.parameter))
    else {
        return SensorReading::unavailable(&config.label);
    };

    let value = parameter.get("latest").cloned().unwrap_or(Value::Null);
    let is_unsafe = parameter
        .get(&config.unsafe_key)
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let stale = match parameter
        .get("updated")
        .and_then(Value::as_str)
        .and_then(|s| parse_utc(s).ok())
    {
        // Exactly at the max-age threshold still counts as fresh.
        Some(updated) => now - updated > chrono::Duration::from_std(config.max_age())
            .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        None => true,
    };

    SensorReading {
        label: config.label.clone(),
        value,
        is_unsafe,
        stale,
    }
}
