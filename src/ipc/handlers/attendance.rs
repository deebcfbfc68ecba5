use crate::calc::{self, BatchDayQuery, CalcOptions, StudentAttendance};
use crate::config::AttendanceSettings;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::setup::effective_settings;
use crate::ipc::helpers::{
    get_optional_day, get_optional_i64, get_optional_str, get_periods, get_required_day,
    get_required_str, timestamp, today,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{
    local_clock, shift_day, AcademicWindow, AttendanceEvent, AttendanceMethod, AttendanceStatus,
};
use crate::repo::{AttendanceRepository, RepoError, SqliteRepository};
use crate::sessions::SessionKeyPolicy;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

fn calc_options(settings: &AttendanceSettings) -> CalcOptions {
    CalcOptions {
        policy: SessionKeyPolicy::from_merge_flag(settings.merge_unlabeled_sessions),
        low_threshold: settings.low_attendance_threshold,
    }
}

/// `[startDate, asOfDate]`, each overridable per call.
fn window_from_params(
    params: &Value,
    settings: &AttendanceSettings,
    today: &str,
) -> Result<AcademicWindow, HandlerErr> {
    let start = get_optional_day(params, "startDate")?
        .unwrap_or_else(|| settings.academic_start_date.clone());
    let as_of = get_optional_day(params, "asOfDate")?.unwrap_or_else(|| today.to_string());
    Ok(calc::academic_window(&start, &as_of)?)
}

/// Fair summary with subject-wide rows cached across calls.
fn student_summary_cached(
    repo: &impl AttendanceRepository,
    user_id: &str,
    window: &AcademicWindow,
    opts: CalcOptions,
    cache: &mut HashMap<String, Vec<AttendanceEvent>>,
) -> Result<StudentAttendance, RepoError> {
    let own = repo.events_for_student(user_id)?;
    Ok(calc::student_attendance(
        user_id,
        &own,
        window,
        opts,
        |subject: &str| -> Result<Vec<AttendanceEvent>, RepoError> {
            if let Some(rows) = cache.get(subject) {
                return Ok(rows.clone());
            }
            let rows = repo.events_for_subject(subject)?;
            cache.insert(subject.to_string(), rows.clone());
            Ok(rows)
        },
    ))
}

struct ManualMark {
    student_id: String,
    present: bool,
}

fn parse_marks(params: &Value) -> Result<Vec<ManualMark>, HandlerErr> {
    let Some(items) = params.get("marks").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("marks must be an array"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let student_id = get_required_str(v, "studentId")
                .map_err(|_| HandlerErr::bad_params(format!("marks[{}].studentId is required", i)))?;
            let present = v
                .get("present")
                .and_then(|p| p.as_bool())
                .ok_or_else(|| HandlerErr::bad_params(format!("marks[{}].present must be boolean", i)))?;
            Ok(ManualMark { student_id, present })
        })
        .collect()
}

fn attendance_submit_manual(
    repo: &impl AttendanceRepository,
    settings: &AttendanceSettings,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let batch = get_required_str(params, "batch")?;
    let subject = get_required_str(params, "subject")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let faculty_name = get_optional_str(params, "facultyName");
    let periods = get_periods(params)?;
    let date = match get_optional_day(params, "date")? {
        Some(d) => d,
        None => today(params, settings, now)?,
    };
    let marks = parse_marks(params)?;
    if marks.is_empty() {
        return Err(HandlerErr::bad_params("marks must not be empty"));
    }

    let roster = repo.find_students(&school, &batch)?;
    let by_id: HashMap<&str, _> = roster.iter().map(|s| (s.id.as_str(), s)).collect();

    let existing_sessions_today = repo.manual_sessions_for(&date, &subject, &batch, &marked_by)?;
    let session_id = format!(
        "manual_{}_{}_{}",
        subject,
        batch,
        uuid::Uuid::new_v4().simple()
    );
    let class_time = local_clock(now, settings.utc_offset_minutes);
    let marked_at = timestamp(now);

    let mut events = Vec::with_capacity(marks.len());
    for m in &marks {
        let Some(student) = by_id.get(m.student_id.as_str()) else {
            return Err(HandlerErr::bad_params(format!(
                "student {} is not enrolled in {} {}",
                m.student_id, school, batch
            )));
        };
        events.push(AttendanceEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: student.id.clone(),
            student_name: student.full_name.clone(),
            reg_number: student.reg_number.clone(),
            school: school.clone(),
            batch: batch.clone(),
            subject: subject.clone(),
            date: date.clone(),
            periods,
            status: if m.present {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Absent
            },
            session_id: Some(session_id.clone()),
            qr_session_id: None,
            marked_by: Some(marked_by.clone()),
            faculty_name: faculty_name.clone(),
            method: AttendanceMethod::Manual,
            has_photo: false,
            class_time: Some(class_time.clone()),
            marked_at: Some(marked_at.clone()),
        });
    }

    let created = repo.insert_events(&events)?;
    let present_count = marks.iter().filter(|m| m.present).count();
    tracing::info!(
        session_id = %session_id,
        subject = %subject,
        batch = %batch,
        created,
        present = present_count,
        "manual attendance submitted"
    );
    Ok(json!({
        "sessionId": session_id,
        "date": date,
        "classTime": class_time,
        "periods": periods,
        "created": created,
        "presentCount": present_count,
        "absentCount": marks.len() - present_count,
        "existingSessionsToday": existing_sessions_today
    }))
}

fn attendance_student_summary(
    repo: &impl AttendanceRepository,
    settings: &AttendanceSettings,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let today = today(params, settings, now)?;
    let window = window_from_params(params, settings, &today)?;
    let mut cache = HashMap::new();
    let summary = student_summary_cached(repo, &user_id, &window, calc_options(settings), &mut cache)?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn attendance_student_report(
    repo: &impl AttendanceRepository,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let reg = get_required_str(params, "regNumber")?;
    let subject = get_required_str(params, "subject")?;
    let Some(student) = repo.find_student_by_reg(&reg)? else {
        return Err(HandlerErr::not_found(format!("no student with registration number {}", reg)));
    };
    let events = repo.events_for_student_subject(&student.id, &subject)?;
    let history = calc::subject_history(&events, &subject);
    Ok(json!({
        "student": student,
        "history": history,
        "percentageBasis": "attempted"
    }))
}

fn attendance_batch_report(
    repo: &impl AttendanceRepository,
    settings: &AttendanceSettings,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let batch = get_required_str(params, "batch")?;
    let subject = get_required_str(params, "subject")?;
    let date = get_required_day(params, "date")?;
    let today = today(params, settings, now)?;
    if date > today {
        return Err(HandlerErr::new(
            "future_date",
            format!("cannot report on {}: it is after {}", date, today),
        ));
    }
    let window = window_from_params(params, settings, &today)?;
    let opts = calc_options(settings);

    let roster = repo.find_students(&school, &batch)?;
    let day_events = repo.events_for_subject_date(&subject, &date)?;

    let query = BatchDayQuery {
        school: &school,
        batch: &batch,
        subject: &subject,
        date: &date,
    };
    // Histories are only needed when a session was held; the calc ignores
    // them otherwise, so skip the per-student reads.
    let mut history = HashMap::new();
    let outline = calc::batch_day_report(query, &[], &day_events, &history, opts.policy);
    if outline.session_held {
        let mut cache = HashMap::new();
        for student in &roster {
            match student_summary_cached(repo, &student.id, &window, opts, &mut cache) {
                Ok(s) => {
                    history.insert(student.id.clone(), s);
                }
                Err(e) => {
                    tracing::warn!(
                        student_id = %student.id,
                        error = %e,
                        "history lookup failed; row percentages withheld"
                    );
                }
            }
        }
    }

    let report = calc::batch_day_report(query, &roster, &day_events, &history, opts.policy);
    let mut out = serde_json::to_value(&report).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    if !report.session_held {
        out["message"] = json!("No Attendance Session Found");
    }
    out["window"] = json!(window);
    Ok(out)
}

fn attendance_daily(
    repo: &impl AttendanceRepository,
    settings: &AttendanceSettings,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let date = match get_optional_day(params, "date")? {
        Some(d) => d,
        None => {
            let offset = get_optional_i64(params, "offsetDays")?.unwrap_or(0);
            if !(0..=366).contains(&offset) {
                return Err(HandlerErr::bad_params("offsetDays must be in 0..=366"));
            }
            let today = today(params, settings, now)?;
            shift_day(&today, -offset)
                .ok_or_else(|| HandlerErr::bad_params("offsetDays moves outside the calendar"))?
        }
    };
    let events = repo.events_for_student_date(&user_id, &date)?;
    let records = calc::daily_records(&events, &date);
    Ok(json!({ "date": date, "records": records }))
}

type Op = fn(&SqliteRepository<'_>, &AttendanceSettings, &Value, DateTime<Utc>) -> Result<Value, HandlerErr>;

fn handle_with_settings(state: &mut AppState, req: &Request, op: Op) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let settings = match effective_settings(conn, &state.config.attendance) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match op(&SqliteRepository::new(conn), &settings, &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_student_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_student_report(&SqliteRepository::new(conn), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submitManual" => Some(handle_with_settings(state, req, |r, s, p, n| {
            attendance_submit_manual(r, s, p, n)
        })),
        "attendance.studentSummary" => Some(handle_with_settings(state, req, |r, s, p, n| {
            attendance_student_summary(r, s, p, n)
        })),
        "attendance.studentReport" => Some(handle_attendance_student_report(state, req)),
        "attendance.batchReport" => Some(handle_with_settings(state, req, |r, s, p, n| {
            attendance_batch_report(r, s, p, n)
        })),
        "attendance.daily" => Some(handle_with_settings(state, req, |r, s, p, n| {
            attendance_daily(r, s, p, n)
        })),
        _ => None,
    }
}
