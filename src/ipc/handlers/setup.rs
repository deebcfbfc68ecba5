use crate::config::AttendanceSettings;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::is_iso_day;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
        }
    }
}

/// Section defaults come from the process environment.
fn default_section(section: SetupSection, base: &AttendanceSettings) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "academicStartDate": base.academic_start_date,
            "lowAttendanceThreshold": base.low_attendance_threshold,
            "qrValiditySeconds": base.qr_validity_seconds,
            "photoGraceSeconds": base.photo_grace_seconds,
            "mergeUnlabeledSessions": base.merge_unlabeled_sessions
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_day(v: &Value, key: &str) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?.trim();
    if !is_iso_day(s) {
        return Err(format!("{} must be YYYY-MM-DD", key));
    }
    Ok(s.to_string())
}

/// Applies `patch` field by field; the first invalid or unknown field aborts.
fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "academicStartDate" => {
                    obj.insert(k.clone(), Value::String(parse_day(v, k)?));
                }
                "lowAttendanceThreshold" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                "qrValiditySeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 600)?));
                }
                "photoGraceSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 86_400)?));
                }
                "mergeUnlabeledSessions" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
    base: &AttendanceSettings,
) -> anyhow::Result<Value> {
    let mut current = default_section(section, base);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stored values are applied one at a time so a single bad field
            // only loses itself.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(field = %k, error = %e, "skipping stored setup value");
                }
            }
        }
    }
    Ok(current)
}

/// Environment settings with the workspace's `attendance` section applied.
pub(crate) fn effective_settings(
    conn: &rusqlite::Connection,
    base: &AttendanceSettings,
) -> anyhow::Result<AttendanceSettings> {
    let section = load_section(conn, SetupSection::Attendance, base)?;
    let mut out = base.clone();
    if let Some(v) = section.get("academicStartDate").and_then(|v| v.as_str()) {
        out.academic_start_date = v.to_string();
    }
    if let Some(v) = section.get("lowAttendanceThreshold").and_then(|v| v.as_i64()) {
        out.low_attendance_threshold = v;
    }
    if let Some(v) = section.get("qrValiditySeconds").and_then(|v| v.as_i64()) {
        out.qr_validity_seconds = v;
    }
    if let Some(v) = section.get("photoGraceSeconds").and_then(|v| v.as_i64()) {
        out.photo_grace_seconds = v;
    }
    if let Some(v) = section.get("mergeUnlabeledSessions").and_then(|v| v.as_bool()) {
        out.merge_unlabeled_sessions = v;
    }
    Ok(out)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let attendance = match load_section(conn, SetupSection::Attendance, &state.config.attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "attendance": attendance,
            "utcOffsetMinutes": state.config.attendance.utc_offset_minutes
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section, &state.config.attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
