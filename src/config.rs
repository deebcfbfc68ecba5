//! Process configuration loaded from `.env` and the environment.
//!
//! Every knob has a default; a value that fails to parse is logged and
//! replaced by its default so a typo never keeps the sidecar from starting.
//! Workspaces can further override [`AttendanceSettings`] through the
//! `attendance` setup section.

use crate::model::is_iso_day;
use std::env;

pub const DEFAULT_ACADEMIC_START_DATE: &str = "2025-09-16";
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;
pub const DEFAULT_LOW_ATTENDANCE_THRESHOLD: i64 = 75;
pub const DEFAULT_QR_VALIDITY_SECONDS: i64 = 30;
pub const DEFAULT_PHOTO_GRACE_SECONDS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceSettings {
    pub academic_start_date: String,
    pub utc_offset_minutes: i32,
    pub low_attendance_threshold: i64,
    pub qr_validity_seconds: i64,
    pub photo_grace_seconds: i64,
    pub merge_unlabeled_sessions: bool,
    /// Lets requests pin "today" through a `today` param. Test harnesses only.
    pub allow_clock_override: bool,
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        Self {
            academic_start_date: DEFAULT_ACADEMIC_START_DATE.to_string(),
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            low_attendance_threshold: DEFAULT_LOW_ATTENDANCE_THRESHOLD,
            qr_validity_seconds: DEFAULT_QR_VALIDITY_SECONDS,
            photo_grace_seconds: DEFAULT_PHOTO_GRACE_SECONDS,
            merge_unlabeled_sessions: false,
            allow_clock_override: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub attendance: AttendanceSettings,
    /// Key mixed into QR tokens. Random per process unless pinned.
    pub qr_secret: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AttendanceSettings::default();
        let academic_start_date = match lookup("ATTENDD_ACADEMIC_START_DATE") {
            Some(v) if is_iso_day(v.trim()) => v.trim().to_string(),
            Some(v) => {
                tracing::error!(value = %v, "ATTENDD_ACADEMIC_START_DATE is not YYYY-MM-DD; using default");
                defaults.academic_start_date.clone()
            }
            None => defaults.academic_start_date.clone(),
        };

        let attendance = AttendanceSettings {
            academic_start_date,
            utc_offset_minutes: parse_range(
                &lookup,
                "ATTENDD_UTC_OFFSET_MINUTES",
                -14 * 60,
                14 * 60,
                i64::from(defaults.utc_offset_minutes),
            ) as i32,
            low_attendance_threshold: parse_range(
                &lookup,
                "ATTENDD_LOW_ATTENDANCE_THRESHOLD",
                0,
                100,
                defaults.low_attendance_threshold,
            ),
            qr_validity_seconds: parse_range(
                &lookup,
                "ATTENDD_QR_VALIDITY_SECS",
                1,
                600,
                defaults.qr_validity_seconds,
            ),
            photo_grace_seconds: parse_range(
                &lookup,
                "ATTENDD_PHOTO_GRACE_SECS",
                0,
                86_400,
                defaults.photo_grace_seconds,
            ),
            merge_unlabeled_sessions: parse_flag(&lookup, "ATTENDD_MERGE_UNLABELED_SESSIONS"),
            allow_clock_override: parse_flag(&lookup, "ATTENDD_ALLOW_CLOCK_OVERRIDE"),
        };

        let qr_secret = lookup("ATTENDD_QR_SECRET")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            attendance,
            qr_secret,
        }
    }
}

fn parse_range<F>(lookup: &F, key: &str, min: i64, max: i64, default: i64) -> i64
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if (min..=max).contains(&n) => n,
        _ => {
            tracing::warn!(key, value = %raw, min, max, default, "ignoring out-of-range config value");
            default
        }
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => false,
    }
}
