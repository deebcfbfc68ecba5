use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::setup::effective_settings;
use crate::ipc::helpers::{get_optional_str, get_periods, get_required_str, timestamp, today};
use crate::ipc::types::{AppState, Request};
use crate::model::{local_clock, AttendanceEvent, AttendanceMethod, AttendanceStatus, Student};
use crate::qr::{QrIssue, QrPayload, QrRegistry, QrSession};
use crate::repo::{AttendanceRepository, SqliteRepository};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

pub(crate) fn parse_payload(params: &Value) -> Result<QrPayload, HandlerErr> {
    let raw = params
        .get("payload")
        .ok_or_else(|| HandlerErr::bad_params("missing payload"))?;
    // Scanners may hand over the encoded string rather than the object.
    let value = match raw {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| HandlerErr::new("qr_invalid", format!("payload is not JSON: {}", e)))?,
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|e| HandlerErr::new("qr_invalid", format!("malformed payload: {}", e)))
}

/// Checks shared by a direct scan and a photo submission.
pub(crate) fn validate_scan(
    registry: &QrRegistry,
    repo: &impl AttendanceRepository,
    payload: &QrPayload,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(QrSession, Student), HandlerErr> {
    let session = registry.validate(payload, now)?.clone();
    let Some(student) = repo.find_student(user_id)? else {
        return Err(HandlerErr::not_found(format!("no student profile for {}", user_id)));
    };
    let issued = &session.payload;
    if student.school != issued.school {
        return Err(HandlerErr::new(
            "wrong_school",
            format!("this QR code is for {}", issued.school),
        )
        .with_details(json!({ "expected": issued.school, "actual": student.school })));
    }
    if student.batch != issued.batch {
        return Err(HandlerErr::new(
            "wrong_batch",
            format!("this QR code is for batch {}", issued.batch),
        )
        .with_details(json!({ "expected": issued.batch, "actual": student.batch })));
    }
    if repo.event_exists_for_session(user_id, &issued.date, &issued.subject, &issued.session_id)? {
        return Err(HandlerErr::new(
            "already_marked",
            format!("attendance already marked for {} in this session", issued.subject),
        ));
    }
    // A photo awaiting review already stands for this student's mark.
    if repo.photo_exists_for_session(user_id, &issued.date, &issued.subject, &issued.session_id)? {
        return Err(HandlerErr::new(
            "already_submitted",
            "a photo was already submitted for this session",
        ));
    }
    Ok((session, student))
}

fn handle_qr_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let settings = match effective_settings(conn, &state.config.attendance) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = Utc::now();
    let issue = (|| -> Result<QrIssue, HandlerErr> {
        Ok(QrIssue {
            school: get_required_str(&req.params, "school")?,
            batch: get_required_str(&req.params, "batch")?,
            subject: get_required_str(&req.params, "subject")?,
            periods: get_periods(&req.params)?,
            faculty_id: get_required_str(&req.params, "facultyId")?,
            faculty_name: get_optional_str(&req.params, "facultyName"),
            date: today(&req.params, &settings, now)?,
            class_time: local_clock(now, settings.utc_offset_minutes),
        })
    })();
    let issue = match issue {
        Ok(v) => v,
        Err(error) => return error.response(&req.id),
    };
    let session = state.qr.issue(issue, now, settings.qr_validity_seconds);
    ok(
        &req.id,
        json!({
            "sessionId": session.payload.session_id,
            "payload": session.payload,
            "issuedAt": timestamp(session.issued_at),
            "expiresAt": timestamp(session.expires_at),
            "validitySeconds": settings.qr_validity_seconds
        }),
    )
}

fn handle_qr_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(error) => return error.response(&req.id),
    };
    match state.qr.status(&session_id, Utc::now()) {
        Ok(status) => ok(&req.id, json!(status)),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn qr_scan(
    registry: &QrRegistry,
    repo: &impl AttendanceRepository,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let payload = parse_payload(params)?;
    let user_id = get_required_str(params, "userId")?;
    let (session, student) = validate_scan(registry, repo, &payload, &user_id, now)?;
    let issued = session.payload;
    let event = AttendanceEvent {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: student.id.clone(),
        student_name: student.full_name,
        reg_number: student.reg_number,
        school: student.school,
        batch: student.batch,
        subject: issued.subject.clone(),
        date: issued.date.clone(),
        periods: issued.periods,
        status: AttendanceStatus::Present,
        session_id: None,
        qr_session_id: Some(issued.session_id.clone()),
        marked_by: Some(issued.faculty_id),
        faculty_name: issued.faculty_name,
        method: AttendanceMethod::Qr,
        has_photo: false,
        class_time: Some(issued.class_time),
        marked_at: Some(timestamp(now)),
    };
    repo.insert_events(std::slice::from_ref(&event))?;
    tracing::info!(
        session_id = %issued.session_id,
        user_id = %event.user_id,
        "QR attendance marked"
    );
    Ok(json!({
        "eventId": event.id,
        "status": "present",
        "sessionId": issued.session_id,
        "subject": issued.subject,
        "date": issued.date,
        "periods": event.periods
    }))
}

fn handle_qr_scan(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match qr_scan(&state.qr, &SqliteRepository::new(conn), &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "qr.generate" => Some(handle_qr_generate(state, req)),
        "qr.status" => Some(handle_qr_status(state, req)),
        "qr.scan" => Some(handle_qr_scan(state, req)),
        _ => None,
    }
}
