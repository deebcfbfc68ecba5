use crate::model::{is_iso_day, sum_periods, AcademicWindow, AttendanceEvent, AttendanceStatus, Student};
use crate::sessions::{self, ReconciledSession, SessionKeyPolicy};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalcError {
    #[error("{0} is not a YYYY-MM-DD day")]
    BadDay(String),
    #[error("window start {start} is after as-of date {as_of}")]
    InvertedWindow { start: String, as_of: String },
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        "bad_params"
    }
}

/// Checked `[start, as_of]` window.
pub fn academic_window(start: &str, as_of: &str) -> Result<AcademicWindow, CalcError> {
    for day in [start, as_of] {
        if !is_iso_day(day) {
            return Err(CalcError::BadDay(day.to_string()));
        }
    }
    if start > as_of {
        return Err(CalcError::InvertedWindow {
            start: start.to_string(),
            as_of: as_of.to_string(),
        });
    }
    Ok(AcademicWindow::new(start, as_of))
}

/// `Fair` divides by class-wide periods held; `Degraded` falls back to the
/// student's own attempted periods after a store read failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcMode {
    Fair,
    Degraded,
}

/// Where a batch row's percentage columns came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    Fair,
    Degraded,
    /// The student's history could not be read; percentages are withheld.
    Unavailable,
}

impl From<CalcMode> for HistoryMode {
    fn from(mode: CalcMode) -> Self {
        match mode {
            CalcMode::Fair => Self::Fair,
            CalcMode::Degraded => Self::Degraded,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CalcOptions {
    pub policy: SessionKeyPolicy,
    pub low_threshold: i64,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self {
            policy: SessionKeyPolicy::Strict,
            low_threshold: 75,
        }
    }
}

/// Integer percentage, rounded half up, `0` when nothing was held.
///
/// The flag is set when `present > total`, which only happens on inconsistent
/// data; the value is then capped at 100.
pub fn percentage(present: i64, total: i64) -> (i64, bool) {
    if total <= 0 {
        return (0, present > 0);
    }
    let present = present.max(0);
    // Widened so oversized legacy period counts cannot overflow.
    let value = (200 * i128::from(present) + i128::from(total)) / (2 * i128::from(total));
    if value > 100 {
        (100, true)
    } else {
        (value as i64, present > total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    Excellence,
    HighAchiever,
    PerfectRecord,
    AttendanceGoal,
    KeepGoing,
}

pub fn badges(overall_percentage: i64, low_subject_count: usize) -> Vec<Badge> {
    let mut out = Vec::new();
    if overall_percentage >= 90 {
        out.push(Badge::Excellence);
    }
    if overall_percentage >= 85 {
        out.push(Badge::HighAchiever);
    }
    if low_subject_count == 0 {
        out.push(Badge::PerfectRecord);
    }
    if overall_percentage >= 75 {
        out.push(Badge::AttendanceGoal);
    }
    if out.is_empty() {
        out.push(Badge::KeepGoing);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttendance {
    pub subject: String,
    pub present_periods: i64,
    pub total_periods: i64,
    pub percentage: i64,
    pub low: bool,
    pub inconsistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallAttendance {
    pub present_periods: i64,
    pub total_periods: i64,
    pub percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub user_id: String,
    pub window: AcademicWindow,
    pub mode: CalcMode,
    pub subjects: Vec<SubjectAttendance>,
    pub overall: OverallAttendance,
    pub excluded_events: usize,
    pub low_subjects: Vec<String>,
    pub badges: Vec<Badge>,
}

impl StudentAttendance {
    pub fn subject(&self, subject: &str) -> Option<&SubjectAttendance> {
        self.subjects.iter().find(|s| s.subject == subject)
    }
}

/// Splits a student's rows into in-window usable rows, counting malformed ones.
fn usable_rows<'a>(
    user_id: &str,
    events: &'a [AttendanceEvent],
    window: &AcademicWindow,
) -> (Vec<&'a AttendanceEvent>, usize) {
    let mut rows = Vec::new();
    let mut excluded = 0_usize;
    for e in events {
        if !e.is_well_formed() {
            excluded += 1;
            tracing::warn!(
                user_id = %user_id,
                event_id = %e.id,
                "excluding attendance row with missing or malformed subject/date"
            );
            continue;
        }
        if window.contains(&e.date) {
            rows.push(e);
        }
    }
    if excluded > 0 {
        tracing::info!(user_id = %user_id, excluded, "attendance rows excluded from aggregation");
    }
    (rows, excluded)
}

fn subject_row(
    user_id: &str,
    subject: &str,
    present_periods: i64,
    total_periods: i64,
    low_threshold: i64,
) -> SubjectAttendance {
    let (pct, inconsistent) = percentage(present_periods, total_periods);
    if inconsistent {
        tracing::warn!(
            user_id = %user_id,
            subject = %subject,
            present_periods,
            total_periods,
            "present periods exceed periods held"
        );
    }
    SubjectAttendance {
        subject: subject.to_string(),
        present_periods,
        total_periods,
        percentage: pct,
        low: pct < low_threshold,
        inconsistent,
    }
}

fn finish(
    user_id: &str,
    window: &AcademicWindow,
    mode: CalcMode,
    subjects: Vec<SubjectAttendance>,
    excluded_events: usize,
) -> StudentAttendance {
    let present_periods = sum_periods(subjects.iter().map(|s| s.present_periods));
    let total_periods = sum_periods(subjects.iter().map(|s| s.total_periods));
    let (overall_pct, _) = percentage(present_periods, total_periods);
    let low_subjects: Vec<String> = subjects
        .iter()
        .filter(|s| s.low)
        .map(|s| s.subject.clone())
        .collect();
    let badges = badges(overall_pct, low_subjects.len());
    StudentAttendance {
        user_id: user_id.to_string(),
        window: window.clone(),
        mode,
        subjects,
        overall: OverallAttendance {
            present_periods,
            total_periods,
            percentage: overall_pct,
        },
        excluded_events,
        low_subjects,
        badges,
    }
}

/// Fair-evaluation summary for one student over `window`.
///
/// `student_events` are the student's own rows. `fetch_subject` returns every
/// row for a subject across all students; it is the class-wide denominator
/// source. If it fails for any subject, the whole result falls back to
/// [`degraded_student_attendance`].
pub fn student_attendance<F, E>(
    user_id: &str,
    student_events: &[AttendanceEvent],
    window: &AcademicWindow,
    opts: CalcOptions,
    mut fetch_subject: F,
) -> StudentAttendance
where
    F: FnMut(&str) -> Result<Vec<AttendanceEvent>, E>,
    E: Display,
{
    let (rows, excluded) = usable_rows(user_id, student_events, window);
    let subjects: BTreeSet<&str> = rows.iter().map(|e| e.subject.as_str()).collect();

    let mut out = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let class_rows = match fetch_subject(subject) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    subject = %subject,
                    error = %e,
                    "subject-wide read failed; using degraded attendance ratio"
                );
                return degraded_student_attendance(user_id, student_events, window, opts);
            }
        };
        let tally = sessions::reconcile(
            class_rows
                .iter()
                .filter(|e| e.subject == subject && e.is_well_formed() && window.contains(&e.date)),
            opts.policy,
        );
        let present = sum_periods(
            rows.iter()
                .filter(|e| e.subject == subject && e.is_present())
                .map(|e| e.periods),
        );
        out.push(subject_row(
            user_id,
            subject,
            present,
            tally.total_classes_held,
            opts.low_threshold,
        ));
    }

    finish(user_id, window, CalcMode::Fair, out, excluded)
}

/// Present periods over the student's own attempted periods.
pub fn degraded_student_attendance(
    user_id: &str,
    student_events: &[AttendanceEvent],
    window: &AcademicWindow,
    opts: CalcOptions,
) -> StudentAttendance {
    let (rows, excluded) = usable_rows(user_id, student_events, window);
    let mut per_subject: HashMap<&str, (i64, i64)> = HashMap::new();
    for e in &rows {
        let entry = per_subject.entry(e.subject.as_str()).or_insert((0, 0));
        entry.1 = entry.1.saturating_add(e.periods);
        if e.is_present() {
            entry.0 = entry.0.saturating_add(e.periods);
        }
    }
    let mut subjects: Vec<&str> = per_subject.keys().copied().collect();
    subjects.sort_unstable();
    let out = subjects
        .into_iter()
        .map(|subject| {
            let (present, attempted) = per_subject[subject];
            subject_row(user_id, subject, present, attempted, opts.low_threshold)
        })
        .collect();
    finish(user_id, window, CalcMode::Degraded, out, excluded)
}

/// Per (student, session) outcome. Absence with no row at all is inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAttendanceState {
    Present,
    AbsentRecorded,
    AbsentInferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMark {
    pub session_key: String,
    pub periods: i64,
    pub state: SessionAttendanceState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStudentRow {
    pub student_id: String,
    pub name: String,
    pub reg_number: String,
    pub sessions: Vec<SessionMark>,
    pub classes_attended_today: Option<i64>,
    pub subject_percentage: Option<i64>,
    pub overall_percentage: Option<i64>,
    /// Absent when no session was held.
    pub mode: Option<HistoryMode>,
    pub has_photo: bool,
    pub inconsistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDaySummary {
    pub enrolled: usize,
    pub present_students: Option<usize>,
    pub absent_students: Option<usize>,
    pub attendance_percentage: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDayReport {
    pub school: String,
    pub batch: String,
    pub subject: String,
    pub date: String,
    pub session_held: bool,
    pub total_classes_today: Option<i64>,
    pub sessions: Vec<ReconciledSession>,
    pub summary: BatchDaySummary,
    pub rows: Vec<BatchStudentRow>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchDayQuery<'a> {
    pub school: &'a str,
    pub batch: &'a str,
    pub subject: &'a str,
    pub date: &'a str,
}

/// Day report for one `(school, batch, subject, date)`.
///
/// `day_events` are the store's rows for `(subject, date)`; only rows of the
/// queried school and batch define the sessions held. `history` maps student
/// ids to their windowed summaries for the percentage columns.
pub fn batch_day_report(
    query: BatchDayQuery<'_>,
    roster: &[Student],
    day_events: &[AttendanceEvent],
    history: &HashMap<String, StudentAttendance>,
    policy: SessionKeyPolicy,
) -> BatchDayReport {
    let scoped: Vec<&AttendanceEvent> = day_events
        .iter()
        .filter(|e| {
            e.subject == query.subject
                && e.date == query.date
                && e.school == query.school
                && e.batch == query.batch
        })
        .collect();
    let tally = sessions::reconcile(scoped.iter().copied(), policy);
    let total = tally.total_classes_held;

    if total == 0 {
        let rows = roster
            .iter()
            .map(|s| BatchStudentRow {
                student_id: s.id.clone(),
                name: s.full_name.clone(),
                reg_number: s.reg_number.clone(),
                sessions: Vec::new(),
                classes_attended_today: None,
                subject_percentage: None,
                overall_percentage: None,
                mode: None,
                has_photo: false,
                inconsistent: false,
            })
            .collect();
        return BatchDayReport {
            school: query.school.to_string(),
            batch: query.batch.to_string(),
            subject: query.subject.to_string(),
            date: query.date.to_string(),
            session_held: false,
            total_classes_today: None,
            sessions: Vec::new(),
            summary: BatchDaySummary {
                enrolled: roster.len(),
                present_students: None,
                absent_students: None,
                attendance_percentage: None,
            },
            rows,
        };
    }

    let mut rows = Vec::with_capacity(roster.len());
    let mut attended_sum = 0_i64;
    let mut present_students = 0_usize;
    for student in roster {
        let own: Vec<&AttendanceEvent> = scoped
            .iter()
            .copied()
            .filter(|e| e.user_id == student.id && e.is_well_formed())
            .collect();

        let marks: Vec<SessionMark> = tally
            .sessions
            .iter()
            .map(|s| {
                let in_session: Vec<&&AttendanceEvent> = own
                    .iter()
                    .filter(|e| sessions::session_key(e, policy) == s.key)
                    .collect();
                let state = if in_session.iter().any(|e| e.is_present()) {
                    SessionAttendanceState::Present
                } else if !in_session.is_empty() {
                    SessionAttendanceState::AbsentRecorded
                } else {
                    SessionAttendanceState::AbsentInferred
                };
                SessionMark {
                    session_key: s.key.clone(),
                    periods: s.periods,
                    state,
                }
            })
            .collect();

        let attended = sum_periods(own.iter().filter(|e| e.is_present()).map(|e| e.periods));
        let inconsistent = attended > total;
        if inconsistent {
            tracing::warn!(
                student_id = %student.id,
                subject = %query.subject,
                date = %query.date,
                attended,
                total,
                "classes attended exceed classes held"
            );
        }
        if marks.iter().any(|m| m.state == SessionAttendanceState::Present) {
            present_students += 1;
        }
        attended_sum = attended_sum.saturating_add(attended);

        let (mode, subject_percentage, overall_percentage) = match history.get(&student.id) {
            Some(h) => (
                HistoryMode::from(h.mode),
                Some(h.subject(query.subject).map(|s| s.percentage).unwrap_or(0)),
                Some(h.overall.percentage),
            ),
            None => (HistoryMode::Unavailable, None, None),
        };

        rows.push(BatchStudentRow {
            student_id: student.id.clone(),
            name: student.full_name.clone(),
            reg_number: student.reg_number.clone(),
            sessions: marks,
            classes_attended_today: Some(attended),
            subject_percentage,
            overall_percentage,
            mode: Some(mode),
            has_photo: own.iter().any(|e| e.has_photo),
            inconsistent,
        });
    }

    let enrolled = roster.len();
    let attendance_percentage = if enrolled > 0 {
        Some(percentage(attended_sum, total.saturating_mul(enrolled as i64)).0)
    } else {
        None
    };

    BatchDayReport {
        school: query.school.to_string(),
        batch: query.batch.to_string(),
        subject: query.subject.to_string(),
        date: query.date.to_string(),
        session_held: true,
        total_classes_today: Some(total),
        sessions: tally.sessions,
        summary: BatchDaySummary {
            enrolled,
            present_students: Some(present_students),
            absent_students: Some(enrolled - present_students),
            attendance_percentage,
        },
        rows,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub date: String,
    pub status: AttendanceStatus,
    pub periods: i64,
    pub method: String,
    pub faculty_name: Option<String>,
    pub marked_by: Option<String>,
    pub has_photo: bool,
    pub marked_at: Option<String>,
}

/// One student's record in one subject, labelled with the attempted-periods ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectHistory {
    pub subject: String,
    pub records: Vec<HistoryRecord>,
    pub present_periods: i64,
    pub absent_periods: i64,
    pub attempted_periods: i64,
    pub attempted_percentage: i64,
    pub excluded_events: usize,
}

fn newest_first(a: &AttendanceEvent, b: &AttendanceEvent) -> Ordering {
    b.date
        .cmp(&a.date)
        .then_with(|| b.marked_at.cmp(&a.marked_at))
}

pub fn subject_history(events: &[AttendanceEvent], subject: &str) -> SubjectHistory {
    let mut excluded_events = 0_usize;
    let mut rows: Vec<&AttendanceEvent> = Vec::new();
    for e in events {
        if !e.is_well_formed() {
            excluded_events += 1;
            continue;
        }
        if e.subject == subject {
            rows.push(e);
        }
    }
    rows.sort_by(|a, b| newest_first(a, b));

    let present_periods = sum_periods(rows.iter().filter(|e| e.is_present()).map(|e| e.periods));
    let attempted_periods = sum_periods(rows.iter().map(|e| e.periods));
    let records = rows
        .iter()
        .map(|e| HistoryRecord {
            id: e.id.clone(),
            date: e.date.clone(),
            status: e.status,
            periods: e.periods,
            method: e.method.as_str().to_string(),
            faculty_name: e.faculty_name.clone(),
            marked_by: e.marked_by.clone(),
            has_photo: e.has_photo,
            marked_at: e.marked_at.clone(),
        })
        .collect();

    SubjectHistory {
        subject: subject.to_string(),
        records,
        present_periods,
        absent_periods: attempted_periods - present_periods,
        attempted_periods,
        attempted_percentage: percentage(present_periods, attempted_periods).0,
        excluded_events,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRecord {
    pub subject: String,
    pub status: AttendanceStatus,
    pub periods: i64,
    pub method: String,
    pub has_photo: bool,
    pub marked_at: Option<String>,
}

/// A student's rows for one day, oldest mark first.
pub fn daily_records(events: &[AttendanceEvent], date: &str) -> Vec<DailyRecord> {
    let mut rows: Vec<&AttendanceEvent> = events
        .iter()
        .filter(|e| e.date == date && !e.subject.trim().is_empty())
        .collect();
    rows.sort_by(|a, b| a.marked_at.cmp(&b.marked_at));
    rows.into_iter()
        .map(|e| DailyRecord {
            subject: e.subject.clone(),
            status: e.status,
            periods: e.periods.max(1),
            method: e.method.as_str().to_string(),
            has_photo: e.has_photo,
            marked_at: e.marked_at.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttendanceStatus::{Absent, Present};
    use crate::sessions::tests::event;

    fn window() -> AcademicWindow {
        AcademicWindow::new("2025-09-16", "2025-10-31")
    }

    #[test]
    fn window_bounds_are_checked() {
        assert_eq!(
            academic_window("2025-09-16", "2025-09-16").map(|w| w.contains("2025-09-16")),
            Ok(true)
        );
        assert_eq!(
            academic_window("2025-10-02", "2025-10-01"),
            Err(CalcError::InvertedWindow {
                start: "2025-10-02".to_string(),
                as_of: "2025-10-01".to_string()
            })
        );
        assert_eq!(
            academic_window("2025-9-16", "2025-10-01"),
            Err(CalcError::BadDay("2025-9-16".to_string()))
        );
    }

    fn no_fetch_errors(rows: &[AttendanceEvent]) -> impl FnMut(&str) -> Result<Vec<AttendanceEvent>, String> + '_ {
        move |subject| {
            Ok(rows
                .iter()
                .filter(|e| e.subject == subject)
                .cloned()
                .collect())
        }
    }

    fn own(rows: &[AttendanceEvent], user: &str) -> Vec<AttendanceEvent> {
        rows.iter().filter(|e| e.user_id == user).cloned().collect()
    }

    #[test]
    fn percentage_rounds_half_up_and_guards_zero() {
        assert_eq!(percentage(6, 8), (75, false));
        assert_eq!(percentage(1, 8), (13, false));
        assert_eq!(percentage(2, 3), (67, false));
        assert_eq!(percentage(0, 0), (0, false));
        assert_eq!(percentage(0, 10), (0, false));
        assert_eq!(percentage(10, 10), (100, false));
        assert_eq!(percentage(3, 2), (100, true));
        assert_eq!(percentage(2, 0), (0, true));
    }

    #[test]
    fn oversized_legacy_periods_do_not_overflow() {
        assert_eq!(percentage(i64::MAX, i64::MAX), (100, false));
        assert_eq!(percentage(i64::MAX / 2, i64::MAX), (50, false));
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), i64::MAX, Present),
            event("alice", "DSA", "2025-09-21", Some("b"), i64::MAX, Present),
        ];
        let summary = student_attendance(
            "alice",
            &rows,
            &window(),
            CalcOptions::default(),
            no_fetch_errors(&rows),
        );
        let dsa = summary.subject("DSA").expect("dsa row");
        assert_eq!(dsa.present_periods, i64::MAX);
        assert_eq!(dsa.total_periods, i64::MAX);
        assert_eq!(dsa.percentage, 100);
    }

    #[test]
    fn fair_denominator_counts_sessions_the_student_missed() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("bob", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("bob", "DSA", "2025-09-22", Some("b"), 2, Present),
            event("bob", "DSA", "2025-09-23", Some("c"), 4, Present),
        ];
        let alice = own(&rows, "alice");
        let summary = student_attendance(
            "alice",
            &alice,
            &window(),
            CalcOptions::default(),
            no_fetch_errors(&rows),
        );
        assert_eq!(summary.mode, CalcMode::Fair);
        let dsa = summary.subject("DSA").expect("dsa row");
        assert_eq!(dsa.present_periods, 2);
        assert_eq!(dsa.total_periods, 8);
        assert_eq!(dsa.percentage, 25);
        assert!(dsa.low);
    }

    #[test]
    fn six_of_eight_is_seventy_five() {
        let rows = vec![
            event("alice", "OS", "2025-09-20", Some("a"), 2, Present),
            event("alice", "OS", "2025-09-21", Some("b"), 2, Present),
            event("alice", "OS", "2025-09-22", Some("c"), 2, Present),
            event("alice", "OS", "2025-09-23", Some("d"), 2, Absent),
        ];
        let summary = student_attendance(
            "alice",
            &rows,
            &window(),
            CalcOptions::default(),
            no_fetch_errors(&rows),
        );
        assert_eq!(summary.overall.present_periods, 6);
        assert_eq!(summary.overall.total_periods, 8);
        assert_eq!(summary.overall.percentage, 75);
        assert!(!summary.subject("OS").expect("os").low);
    }

    #[test]
    fn overall_is_pooled_not_mean_of_subjects() {
        // DSA: 1/1 = 100%. OS: 1/4 = 25%. Mean would be 63; pooled is 2/5 = 40.
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), 1, Present),
            event("alice", "OS", "2025-09-20", Some("b"), 1, Present),
            event("bob", "OS", "2025-09-21", Some("c"), 3, Present),
        ];
        let alice = own(&rows, "alice");
        let summary = student_attendance(
            "alice",
            &alice,
            &window(),
            CalcOptions::default(),
            no_fetch_errors(&rows),
        );
        assert_eq!(summary.subject("DSA").expect("dsa").percentage, 100);
        assert_eq!(summary.subject("OS").expect("os").percentage, 25);
        assert_eq!(summary.overall.percentage, 40);
        assert_eq!(summary.low_subjects, vec!["OS".to_string()]);
        assert_eq!(summary.badges, vec![Badge::KeepGoing]);
    }

    #[test]
    fn zero_present_and_full_present_bounds() {
        let mut rows = Vec::new();
        for (i, day) in ["2025-09-20", "2025-09-21", "2025-09-22", "2025-09-23", "2025-09-24"]
            .iter()
            .enumerate()
        {
            let sid = format!("s{}", i);
            rows.push(event("full", "DBMS", day, Some(sid.as_str()), 2, Present));
            rows.push(event("none", "DBMS", day, Some(sid.as_str()), 2, Absent));
        }
        let full = own(&rows, "full");
        let none = own(&rows, "none");
        let s_full = student_attendance("full", &full, &window(), CalcOptions::default(), no_fetch_errors(&rows));
        let s_none = student_attendance("none", &none, &window(), CalcOptions::default(), no_fetch_errors(&rows));
        assert_eq!(s_full.subject("DBMS").expect("row").total_periods, 10);
        assert_eq!(s_full.subject("DBMS").expect("row").percentage, 100);
        assert_eq!(s_none.subject("DBMS").expect("row").percentage, 0);
        assert!(s_full.badges.contains(&Badge::Excellence));
        assert!(s_full.badges.contains(&Badge::PerfectRecord));
    }

    #[test]
    fn rows_outside_window_are_ignored() {
        let rows = vec![
            event("alice", "DSA", "2025-09-10", Some("old"), 5, Present),
            event("alice", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("bob", "DSA", "2025-11-05", Some("future"), 2, Present),
        ];
        let alice = own(&rows, "alice");
        let summary = student_attendance("alice", &alice, &window(), CalcOptions::default(), no_fetch_errors(&rows));
        assert_eq!(summary.overall.present_periods, 2);
        assert_eq!(summary.overall.total_periods, 2);
    }

    #[test]
    fn malformed_rows_are_counted_not_fatal() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("alice", "", "2025-09-21", Some("b"), 2, Present),
            event("alice", "DSA", "", Some("c"), 2, Present),
        ];
        let summary = student_attendance("alice", &rows, &window(), CalcOptions::default(), no_fetch_errors(&rows));
        assert_eq!(summary.excluded_events, 2);
        assert_eq!(summary.overall.percentage, 100);
    }

    #[test]
    fn fetch_failure_degrades_to_attempted_ratio() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("alice", "DSA", "2025-09-21", Some("b"), 2, Absent),
        ];
        let summary = student_attendance(
            "alice",
            &rows,
            &window(),
            CalcOptions::default(),
            |_subject: &str| -> Result<Vec<AttendanceEvent>, String> { Err("offline".to_string()) },
        );
        assert_eq!(summary.mode, CalcMode::Degraded);
        assert_eq!(summary.overall.total_periods, 4);
        assert_eq!(summary.overall.percentage, 50);
    }

    #[test]
    fn student_with_no_rows_gets_empty_summary() {
        let summary = student_attendance("ghost", &[], &window(), CalcOptions::default(), no_fetch_errors(&[]));
        assert!(summary.subjects.is_empty());
        assert_eq!(summary.overall.percentage, 0);
    }

    fn roster() -> Vec<Student> {
        ["alice", "bob", "carol"]
            .iter()
            .map(|id| Student {
                id: id.to_string(),
                full_name: format!("Student {}", id),
                reg_number: format!("REG-{}", id),
                school: "School of Technology".to_string(),
                batch: "24B1".to_string(),
                email: None,
            })
            .collect()
    }

    fn query() -> BatchDayQuery<'static> {
        BatchDayQuery {
            school: "School of Technology",
            batch: "24B1",
            subject: "DSA",
            date: "2025-09-20",
        }
    }

    #[test]
    fn batch_report_without_session_is_explicit_no_session() {
        let report = batch_day_report(query(), &roster(), &[], &HashMap::new(), SessionKeyPolicy::Strict);
        assert!(!report.session_held);
        assert_eq!(report.total_classes_today, None);
        assert_eq!(report.summary.attendance_percentage, None);
        assert_eq!(report.rows.len(), 3);
        assert!(report.rows.iter().all(|r| r.subject_percentage.is_none()
            && r.classes_attended_today.is_none()));
    }

    #[test]
    fn batch_report_tri_state_and_totals() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("s1"), 2, Present),
            event("bob", "DSA", "2025-09-20", Some("s1"), 2, Absent),
        ];
        let report = batch_day_report(query(), &roster(), &rows, &HashMap::new(), SessionKeyPolicy::Strict);
        assert!(report.session_held);
        assert_eq!(report.total_classes_today, Some(2));
        let state = |id: &str| {
            report
                .rows
                .iter()
                .find(|r| r.student_id == id)
                .map(|r| r.sessions[0].state)
        };
        assert_eq!(state("alice"), Some(SessionAttendanceState::Present));
        assert_eq!(state("bob"), Some(SessionAttendanceState::AbsentRecorded));
        assert_eq!(state("carol"), Some(SessionAttendanceState::AbsentInferred));
        assert_eq!(report.summary.present_students, Some(1));
        assert_eq!(report.summary.absent_students, Some(2));
        // 2 attended of 2 periods x 3 students.
        assert_eq!(report.summary.attendance_percentage, Some(33));
        let carol = report.rows.iter().find(|r| r.student_id == "carol").expect("carol");
        assert_eq!(carol.classes_attended_today, Some(0));
        assert_eq!(carol.subject_percentage, None);
        assert_eq!(carol.mode, Some(HistoryMode::Unavailable));
    }

    #[test]
    fn batch_rows_report_where_their_percentages_came_from() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("s1"), 2, Present),
            event("bob", "DSA", "2025-09-20", Some("s1"), 2, Absent),
        ];
        let mut history = HashMap::new();
        history.insert(
            "alice".to_string(),
            student_attendance("alice", &rows[..1], &window(), CalcOptions::default(), no_fetch_errors(&rows)),
        );
        history.insert(
            "bob".to_string(),
            student_attendance(
                "bob",
                &rows[1..],
                &window(),
                CalcOptions::default(),
                |_subject: &str| -> Result<Vec<AttendanceEvent>, String> { Err("offline".to_string()) },
            ),
        );
        let report = batch_day_report(query(), &roster(), &rows, &history, SessionKeyPolicy::Strict);
        let row = |id: &str| report.rows.iter().find(|r| r.student_id == id).expect("row");

        assert_eq!(row("alice").mode, Some(HistoryMode::Fair));
        assert_eq!(row("alice").subject_percentage, Some(100));
        assert_eq!(row("alice").overall_percentage, Some(100));
        assert_eq!(row("bob").mode, Some(HistoryMode::Degraded));
        assert_eq!(row("bob").subject_percentage, Some(0));
        // Carol's history lookup failed, so nothing is reported for her.
        assert_eq!(row("carol").mode, Some(HistoryMode::Unavailable));
        assert_eq!(row("carol").subject_percentage, None);
        assert_eq!(row("carol").overall_percentage, None);
        assert_eq!(row("carol").classes_attended_today, Some(0));

        let empty = batch_day_report(query(), &roster(), &[], &history, SessionKeyPolicy::Strict);
        assert!(empty.rows.iter().all(|r| r.mode.is_none()));
    }

    #[test]
    fn batch_report_flags_over_attendance() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("s1"), 2, Present),
            {
                let mut dup = event("alice", "DSA", "2025-09-20", Some("s1"), 2, Present);
                dup.id = "dup".to_string();
                dup
            },
        ];
        let report = batch_day_report(query(), &roster(), &rows, &HashMap::new(), SessionKeyPolicy::Strict);
        let alice = report.rows.iter().find(|r| r.student_id == "alice").expect("alice");
        assert_eq!(alice.classes_attended_today, Some(4));
        assert!(alice.inconsistent);
    }

    #[test]
    fn batch_report_ignores_other_batches_sessions() {
        let mut other = event("zed", "DSA", "2025-09-20", Some("other"), 3, Present);
        other.batch = "24B2".to_string();
        let rows = vec![event("alice", "DSA", "2025-09-20", Some("s1"), 2, Present), other];
        let report = batch_day_report(query(), &roster(), &rows, &HashMap::new(), SessionKeyPolicy::Strict);
        assert_eq!(report.total_classes_today, Some(2));
    }

    #[test]
    fn subject_history_is_newest_first_with_attempted_ratio() {
        let rows = vec![
            event("alice", "DSA", "2025-09-20", Some("a"), 2, Present),
            event("alice", "DSA", "2025-09-22", Some("b"), 1, Absent),
            event("alice", "OS", "2025-09-21", Some("c"), 2, Present),
        ];
        let h = subject_history(&rows, "DSA");
        assert_eq!(h.records.len(), 2);
        assert_eq!(h.records[0].date, "2025-09-22");
        assert_eq!(h.present_periods, 2);
        assert_eq!(h.absent_periods, 1);
        assert_eq!(h.attempted_percentage, 67);
    }

    #[test]
    fn daily_records_sorted_by_mark_time() {
        let mut late = event("alice", "OS", "2025-09-20", Some("b"), 1, Present);
        late.marked_at = Some("2025-09-20T10:00:00Z".to_string());
        let mut early = event("alice", "DSA", "2025-09-20", Some("a"), 2, Absent);
        early.marked_at = Some("2025-09-20T08:00:00Z".to_string());
        let other_day = event("alice", "DSA", "2025-09-21", Some("c"), 2, Present);
        let out = daily_records(&[late, early, other_day], "2025-09-20");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subject, "DSA");
        assert_eq!(out[1].subject, "OS");
    }
}
