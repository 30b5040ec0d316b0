//! Schedule validation and parsing.
//!
//! A schedule is the JSON document an operator submits for one observing
//! night: an optional dome window and an optional list of action blocks.
//! Everything here is a pure function of the schedule, the site config, and
//! the supplied "now"; nothing touches controller state, which is what makes
//! the daemon's commit step straightforward to roll back.

use crate::config::Config;
use crate::sun::{night_start_end, NightWindow};
use crate::telescope::action::{ActionContext, TelescopeAction};
use crate::time::{format_utc, parse_utc};
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde_json::Value;
use std::sync::Arc;

/// The observing night an instant belongs to: nights run noon to noon UTC,
/// labelled by the date of the first noon.
pub fn current_night(now: DateTime<Utc>) -> NaiveDate {
    if now.hour() < 12 {
        (now - Duration::days(1)).date_naive()
    } else {
        now.date_naive()
    }
}

/// Validates a schedule against the site config.
///
/// Returns `(valid, messages)`. Messages are human-readable and may include
/// a leading informational line (e.g. a night mismatch when `require_night`
/// is false) even for a valid schedule.
pub fn validate_schedule(
    schedule: &Value,
    config: &Config,
    now: DateTime<Utc>,
    require_night: bool,
) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    let night = match schedule.get("night").and_then(Value::as_str) {
        None => return (false, vec!["missing key 'night'".to_string()]),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(night) => night,
            Err(_) => return (false, vec![format!("night: {raw} is not a valid date")]),
        },
    };

    if let Some(dome) = schedule.get("dome") {
        errors.extend(validate_dome(dome, config, night));
    }

    match schedule.get("actions") {
        None => {}
        Some(Value::Array(actions)) => {
            for (index, action) in actions.iter().enumerate() {
                errors.extend(validate_action(index, action, config));
            }
        }
        Some(_) => errors.push("actions: must be a list".to_string()),
    }

    let mut valid = errors.is_empty();

    // A night mismatch is fatal only when the schedule is being committed
    // for tonight; advance validation downgrades it to information.
    let tonight = current_night(now);
    if night != tonight {
        if require_night {
            valid = false;
            errors.insert(0, format!("night: {night} is not tonight ({tonight})"));
        } else {
            errors.insert(0, format!("info: night {night} is not tonight ({tonight})"));
        }
    }

    (valid, errors)
}

/// Checks the dome block: `{"open": <datetime|"auto">, "close": <datetime|"auto">}`.
fn validate_dome(block: &Value, config: &Config, night: NaiveDate) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(object) = block.as_object() else {
        return vec!["dome: must be an object".to_string()];
    };

    for key in object.keys() {
        if key != "open" && key != "close" {
            errors.push(format!("dome: unknown key '{key}'"));
        }
    }

    let window = night_start_end(night, &config.site(), config.sun_altitude_limit);
    let mut resolved = [window.start, window.end];
    for (slot, key) in resolved.iter_mut().zip(["open", "close"]) {
        match object.get(key).and_then(Value::as_str) {
            None => errors.push(format!("dome: missing key '{key}'")),
            Some("auto") => {
                if window.is_empty() {
                    errors.push(format!(
                        "dome: {key}: the sun never sets below the altitude limit on {night}"
                    ));
                }
            }
            Some(raw) => match parse_utc(raw) {
                Ok(date) => {
                    if !window.contains(date) {
                        errors.push(format!(
                            "dome: {key}: {raw} is not auto or between {} and {}",
                            format_utc(window.start),
                            format_utc(window.end)
                        ));
                    }
                    *slot = date;
                }
                Err(_) => errors.push(format!("dome: {key}: {raw} is not a valid datetime")),
            },
        }
    }

    if errors.is_empty() && resolved[0] >= resolved[1] {
        errors.push("dome: open time must be earlier than close time".to_string());
    }

    errors
}

/// Checks one action block against its type's parameter schema.
fn validate_action(index: usize, block: &Value, config: &Config) -> Vec<String> {
    let Some(action_type) = block.get("type").and_then(Value::as_str) else {
        return vec![format!("action {index}: missing key 'type'")];
    };

    let Some(module) = crate::telescope::actions::lookup_module(&config.actions_module) else {
        return vec![format!(
            "action {index}: actions module '{}' is not registered",
            config.actions_module
        )];
    };

    match module.validate(action_type, block) {
        None => vec![format!(
            "action {index}: unknown action type '{action_type}'"
        )],
        Some(errors) => errors
            .into_iter()
            .map(|error| format!("action {index} ({action_type}): {error}"))
            .collect(),
    }
}

/// Parses the dome window from a schedule.
///
/// Returns `Ok(None)` when the schedule has no dome block. `"auto"` bounds
/// resolve to the computed night start/end.
pub fn parse_dome_window(
    schedule: &Value,
    config: &Config,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, String> {
    let Some(dome) = schedule.get("dome").and_then(Value::as_object) else {
        return Ok(None);
    };
    let (Some(open), Some(close)) = (
        dome.get("open").and_then(Value::as_str),
        dome.get("close").and_then(Value::as_str),
    ) else {
        return Err("dome block must define 'open' and 'close'".to_string());
    };

    let night_window = if open == "auto" || close == "auto" {
        let night = schedule
            .get("night")
            .and_then(Value::as_str)
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .ok_or_else(|| "missing key 'night'".to_string())?;
        let window = night_start_end(night, &config.site(), config.sun_altitude_limit);
        if window.is_empty() {
            return Err(format!(
                "the sun never sets below the altitude limit on {night}"
            ));
        }
        Some(window)
    } else {
        None
    };

    let resolve = |raw: &str, auto_value: fn(&NightWindow) -> DateTime<Utc>| {
        if raw == "auto" {
            night_window
                .as_ref()
                .map(auto_value)
                .ok_or_else(|| "missing key 'night'".to_string())
        } else {
            parse_utc(raw).map_err(|_| format!("{raw} is not a valid datetime"))
        }
    };

    let open_at = resolve(open, |w| w.start)?;
    let close_at = resolve(close, |w| w.end)?;
    if open_at >= close_at {
        return Err("open time must be earlier than close time".to_string());
    }
    Ok(Some((open_at, close_at)))
}

/// Constructs the action list from a schedule.
///
/// Returns an empty list when the schedule has no actions block.
pub fn parse_schedule_actions(
    config: &Config,
    schedule: &Value,
    context: &ActionContext,
) -> Result<Vec<Arc<dyn TelescopeAction>>, String> {
    let Some(blocks) = schedule.get("actions") else {
        return Ok(Vec::new());
    };
    let blocks = blocks
        .as_array()
        .ok_or_else(|| "actions: must be a list".to_string())?;

    let module = crate::telescope::actions::lookup_module(&config.actions_module)
        .ok_or_else(|| format!("actions module '{}' is not registered", config.actions_module))?;

    let mut actions = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.iter().enumerate() {
        let action_type = block
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("action {index}: missing key 'type'"))?;
        let action = module
            .build(action_type, block, context)
            .map_err(|error| format!("action {index} ({action_type}): {error}"))?;
        actions.push(action);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use serde_json::json;

    fn config() -> Config {
        Config::from_json(json!({
            "daemon": "127.0.0.1:9002",
            "log_name": "opsd",
            "control_machines": ["127.0.0.1"],
            "pipeline_machines": ["127.0.0.1"],
            "actions_module": "simulated",
            "loop_delay": 10,
            "site_latitude": 28.7624,
            "site_longitude": -17.8792,
            "site_elevation": 2350,
            "sun_altitude_limit": 5,
            "environment_daemon": "http://127.0.0.1:9010",
            "environment_conditions": [
                {"label": "Rain", "sensors": [
                    {"label": "Rain", "sensor": "vaisala", "parameter": "rain"}
                ]}
            ]
        }))
        .expect("test config is valid")
    }

    fn context() -> ActionContext {
        ActionContext {
            log_name: "opsd".to_string(),
            site: config().site(),
            clock: Arc::new(SystemClock),
        }
    }

    fn now() -> DateTime<Utc> {
        parse_utc("2024-03-14T22:00:00Z").unwrap()
    }

    fn good_schedule() -> Value {
        json!({
            "night": "2024-03-14",
            "dome": {"open": "2024-03-14T21:00:00Z", "close": "2024-03-15T06:00:00Z"},
            "actions": [
                {"type": "Wait", "delay": 30},
                {"type": "WaitUntil", "date": "2024-03-15T01:00:00Z"}
            ]
        })
    }

    #[test]
    fn night_rolls_over_at_noon() {
        assert_eq!(
            current_night(parse_utc("2024-03-15T11:59:59Z").unwrap()),
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
        );
        assert_eq!(
            current_night(parse_utc("2024-03-15T12:00:00Z").unwrap()),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
    }

    #[test]
    fn accepts_a_complete_schedule() {
        let (valid, errors) = validate_schedule(&good_schedule(), &config(), now(), true);
        assert!(valid, "errors: {errors:?}");
        assert!(errors.is_empty());
    }

    #[test]
    fn missing_night_is_fatal() {
        let (valid, errors) = validate_schedule(&json!({}), &config(), now(), false);
        assert!(!valid);
        assert_eq!(errors, vec!["missing key 'night'"]);
    }

    #[test]
    fn wrong_night_fails_only_when_required() {
        let mut schedule = good_schedule();
        schedule["night"] = "2024-03-13".into();
        schedule.as_object_mut().unwrap().remove("dome");
        schedule.as_object_mut().unwrap().remove("actions");

        let (valid, errors) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
        assert!(errors[0].contains("is not tonight"));

        let (valid, errors) = validate_schedule(&schedule, &config(), now(), false);
        assert!(valid);
        assert!(errors[0].starts_with("info:"));
    }

    #[test]
    fn rejects_window_outside_the_night() {
        let mut schedule = good_schedule();
        // Mid-afternoon, well before the sun crosses the limit.
        schedule["dome"]["open"] = "2024-03-14T15:00:00Z".into();
        let (valid, errors) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("dome: open")));
    }

    #[test]
    fn rejects_window_straddling_the_night_boundary() {
        let mut schedule = good_schedule();
        schedule["dome"]["close"] = "2024-03-15T13:00:00Z".into();
        let (valid, _) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
    }

    #[test]
    fn rejects_equal_open_and_close() {
        let mut schedule = good_schedule();
        schedule["dome"]["close"] = schedule["dome"]["open"].clone();
        let (valid, errors) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
        assert!(errors
            .iter()
            .any(|e| e.contains("open time must be earlier")));
    }

    #[test]
    fn rejects_unknown_action_type() {
        let mut schedule = good_schedule();
        schedule["actions"][0] = json!({"type": "SlewTelescope"});
        let (valid, errors) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
        assert_eq!(errors, vec!["action 0: unknown action type 'SlewTelescope'"]);
    }

    #[test]
    fn rejects_bad_action_parameters() {
        let mut schedule = good_schedule();
        schedule["actions"][0] = json!({"type": "Wait"});
        let (valid, errors) = validate_schedule(&schedule, &config(), now(), true);
        assert!(!valid);
        assert_eq!(errors, vec!["action 0 (Wait): missing key 'delay'"]);
    }

    #[test]
    fn parses_explicit_window() {
        let window = parse_dome_window(&good_schedule(), &config())
            .unwrap()
            .unwrap();
        assert_eq!(format_utc(window.0), "2024-03-14T21:00:00Z");
        assert_eq!(format_utc(window.1), "2024-03-15T06:00:00Z");
    }

    #[test]
    fn parses_auto_window_to_night_bounds() {
        let mut schedule = good_schedule();
        schedule["dome"]["open"] = "auto".into();
        schedule["dome"]["close"] = "auto".into();
        let window = parse_dome_window(&schedule, &config()).unwrap().unwrap();
        let night = night_start_end(
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            &config().site(),
            5.0,
        );
        assert_eq!(window.0, night.start);
        assert_eq!(window.1, night.end);
    }

    #[test]
    fn no_dome_block_means_no_window() {
        let mut schedule = good_schedule();
        schedule.as_object_mut().unwrap().remove("dome");
        assert!(parse_dome_window(&schedule, &config()).unwrap().is_none());
    }

    #[test]
    fn parses_actions_in_order() {
        let actions = parse_schedule_actions(&config(), &good_schedule(), &context()).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name(), "Waiting");
    }

    #[test]
    fn valid_schedule_parses_and_invalid_does_not() {
        // validate_schedule succeeds iff both parse steps succeed.
        let schedule = good_schedule();
        let (valid, _) = validate_schedule(&schedule, &config(), now(), true);
        assert!(valid);
        assert!(parse_dome_window(&schedule, &config()).is_ok());
        assert!(parse_schedule_actions(&config(), &schedule, &context()).is_ok());

        let mut broken = good_schedule();
        broken["actions"][0] = json!({"type": "SlewTelescope"});
        let (valid, _) = validate_schedule(&broken, &config(), now(), true);
        assert!(!valid);
        assert!(parse_schedule_actions(&config(), &broken, &context()).is_err());
    }
}
