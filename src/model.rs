use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    /// Anything other than an explicit `present` counts as absent.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("present") {
            Self::Present
        } else {
            Self::Absent
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMethod {
    Manual,
    Qr,
    QrPhotoVerified,
    Unknown,
}

impl AttendanceMethod {
    /// Older rows only carry `verification_method`; a QR-ish value there implies a QR mark.
    pub fn derive(method: Option<&str>, verification_method: Option<&str>) -> Self {
        match method.map(|m| m.trim().to_ascii_lowercase()).as_deref() {
            Some("manual") => return Self::Manual,
            Some("qr") => return Self::Qr,
            Some("qr_photo_verified") => return Self::QrPhotoVerified,
            _ => {}
        }
        match verification_method.map(|m| m.trim().to_ascii_lowercase()) {
            Some(v) if v.starts_with("qr_and_photo") => Self::QrPhotoVerified,
            Some(v) if v.starts_with("qr") => Self::Qr,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Qr => "qr",
            Self::QrPhotoVerified => "qr_photo_verified",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub id: String,
    pub user_id: String,
    pub student_name: String,
    pub reg_number: String,
    pub school: String,
    pub batch: String,
    pub subject: String,
    pub date: String,
    pub periods: i64,
    pub status: AttendanceStatus,
    pub session_id: Option<String>,
    pub qr_session_id: Option<String>,
    pub marked_by: Option<String>,
    pub faculty_name: Option<String>,
    pub method: AttendanceMethod,
    pub has_photo: bool,
    pub class_time: Option<String>,
    pub marked_at: Option<String>,
}

impl AttendanceEvent {
    /// The explicit session identifier, preferring `session_id` over `qr_session_id`.
    pub fn session_label(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.qr_session_id.as_deref().filter(|s| !s.trim().is_empty()))
    }

    /// Rows without a usable date or subject are kept out of every aggregate.
    pub fn is_well_formed(&self) -> bool {
        !self.subject.trim().is_empty() && is_iso_day(&self.date)
    }

    pub fn is_present(&self) -> bool {
        self.status == AttendanceStatus::Present
    }
}

/// Upper bound for periods accepted on new marks, leave requests and QR sessions.
pub const MAX_PERIODS: i64 = 12;

/// Legacy rows may carry a null, zero or negative period count; those count as one period.
pub fn normalize_periods(raw: Option<i64>) -> i64 {
    raw.filter(|p| *p > 0).unwrap_or(1)
}

/// Period totals saturate instead of overflowing on oversized legacy rows.
pub fn sum_periods<I: IntoIterator<Item = i64>>(periods: I) -> i64 {
    periods.into_iter().fold(0, i64::saturating_add)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub reg_number: String,
    pub school: String,
    pub batch: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    PendingVerification,
    Processed,
}

impl PhotoStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending_verification" => Some(Self::PendingVerification),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingVerification => "pending_verification",
            Self::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempPhoto {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub reg_number: String,
    pub school: String,
    pub batch: String,
    pub subject: String,
    pub date: String,
    pub periods: i64,
    pub qr_session_id: Option<String>,
    pub faculty_id: Option<String>,
    pub faculty_name: Option<String>,
    pub photo_ref: String,
    pub status: PhotoStatus,
    pub submitted_at: String,
    pub processed_at: Option<String>,
    pub faculty_decision: Option<String>,
}

/// Inclusive `[start, as_of]` range of `YYYY-MM-DD` days.
///
/// Both bounds are zero-padded, so plain string comparison orders them chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicWindow {
    pub start_date: String,
    pub as_of_date: String,
}

impl AcademicWindow {
    pub fn new(start_date: impl Into<String>, as_of_date: impl Into<String>) -> Self {
        Self {
            start_date: start_date.into(),
            as_of_date: as_of_date.into(),
        }
    }

    pub fn contains(&self, date: &str) -> bool {
        date >= self.start_date.as_str() && date <= self.as_of_date.as_str()
    }
}

/// True only for zero-padded, calendar-valid `YYYY-MM-DD` strings.
pub fn is_iso_day(raw: &str) -> bool {
    raw.len() == 10 && NaiveDate::parse_from_str(raw, DAY_FORMAT).is_ok()
}

pub fn parse_iso_day(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(raw, DAY_FORMAT).ok()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn local_offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
}

/// Calendar day in the store's local convention for the given instant.
pub fn local_day(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    format_day(now.with_timezone(&local_offset(utc_offset_minutes)).date_naive())
}

/// Wall-clock `HH:MM` in the store's local convention.
pub fn local_clock(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    now.with_timezone(&local_offset(utc_offset_minutes))
        .format("%H:%M")
        .to_string()
}

pub fn shift_day(date: &str, days: i64) -> Option<String> {
    let day = parse_iso_day(date)?;
    day.checked_add_signed(Duration::days(days)).map(format_day)
}
