use crate::config::AttendanceSettings;
use crate::ipc::error::HandlerErr;
use crate::model::{is_iso_day, local_day, MAX_PERIODS};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

/// `periods`, default 1, within `1..=MAX_PERIODS`.
pub fn get_periods(params: &Value) -> Result<i64, HandlerErr> {
    let periods = get_optional_i64(params, "periods")?.unwrap_or(1);
    if !(1..=MAX_PERIODS).contains(&periods) {
        return Err(HandlerErr::bad_params(format!(
            "periods must be in 1..={}",
            MAX_PERIODS
        )));
    }
    Ok(periods)
}

/// Optional `YYYY-MM-DD` parameter; present but malformed is an error.
pub fn get_optional_day(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key) {
        None => Ok(None),
        Some(s) if is_iso_day(&s) => Ok(Some(s)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

pub fn get_required_day(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_optional_day(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Local calendar day, overridable by a `today` parameter.
/// Local calendar day. A `today` param is honored only when the process
/// allows clock overrides.
pub fn today(params: &Value, settings: &AttendanceSettings, now: DateTime<Utc>) -> Result<String, HandlerErr> {
    match get_optional_day(params, "today")? {
        Some(day) if settings.allow_clock_override => Ok(day),
        Some(_) => Err(HandlerErr::bad_params("today cannot be overridden on this sidecar")),
        None => Ok(local_day(now, settings.utc_offset_minutes)),
    }
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}
