use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::qr::{parse_payload, validate_scan};
use crate::ipc::handlers::setup::effective_settings;
use crate::ipc::helpers::{get_optional_str, get_required_str, timestamp};
use crate::ipc::types::{AppState, Request};
use crate::model::{PhotoStatus, TempPhoto};
use crate::qr::QrRegistry;
use crate::repo::{AttendanceRepository, SqliteRepository};
use crate::verification::{Decision, DecisionStore, VerificationSession};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;

const CLEANUP_BATCH: usize = 100;

fn photos_submit(
    registry: &QrRegistry,
    repo: &impl AttendanceRepository,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let payload = parse_payload(params)?;
    let user_id = get_required_str(params, "userId")?;
    let photo_ref = get_required_str(params, "photoRef")?;
    let (session, student) = validate_scan(registry, repo, &payload, &user_id, now)?;
    let issued = session.payload;
    let photo = TempPhoto {
        id: uuid::Uuid::new_v4().to_string(),
        student_id: student.id,
        student_name: student.full_name,
        reg_number: student.reg_number,
        school: student.school,
        batch: student.batch,
        subject: issued.subject,
        date: issued.date,
        periods: issued.periods,
        qr_session_id: Some(issued.session_id),
        faculty_id: Some(issued.faculty_id),
        faculty_name: issued.faculty_name,
        photo_ref,
        status: PhotoStatus::PendingVerification,
        submitted_at: timestamp(now),
        processed_at: None,
        faculty_decision: None,
    };
    repo.insert_temp_photo(&photo)?;
    Ok(json!({
        "photoId": photo.id,
        "status": photo.status,
        "qrSessionId": photo.qr_session_id
    }))
}

fn photo_rows(session: &VerificationSession) -> Vec<Value> {
    session
        .photos()
        .iter()
        .map(|p| {
            json!({
                "photoId": p.id,
                "studentId": p.student_id,
                "studentName": p.student_name,
                "regNumber": p.reg_number,
                "photoRef": p.photo_ref,
                "submittedAt": p.submitted_at,
                "decision": session.decision(&p.id).map(Decision::as_str)
            })
        })
        .collect()
}

fn verification_open(
    decisions: &mut DecisionStore,
    registry: &QrRegistry,
    repo: &impl AttendanceRepository,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let qr_session_id = get_required_str(params, "qrSessionId")?;
    let school = get_required_str(params, "school")?;
    let batch = get_required_str(params, "batch")?;
    // Sessions from an earlier process are gone; the caller's roster is trusted then.
    if let Some(issued) = registry.get(&qr_session_id).map(|s| &s.payload) {
        if issued.school != school {
            return Err(HandlerErr::new(
                "wrong_school",
                format!("session {} belongs to {}", qr_session_id, issued.school),
            )
            .with_details(json!({ "expected": issued.school, "actual": school })));
        }
        if issued.batch != batch {
            return Err(HandlerErr::new(
                "wrong_batch",
                format!("session {} belongs to batch {}", qr_session_id, issued.batch),
            )
            .with_details(json!({ "expected": issued.batch, "actual": batch })));
        }
    }
    let photos = repo.pending_photos_for_session(&qr_session_id)?;
    let roster = repo.find_students(&school, &batch)?;
    let session = decisions.open(VerificationSession::open(qr_session_id.clone(), photos, roster));
    Ok(json!({
        "qrSessionId": qr_session_id,
        "photos": photo_rows(session),
        "rosterSize": session.roster_len(),
        "summary": session.summary()
    }))
}

fn verification_toggle(decisions: &mut DecisionStore, params: &Value) -> Result<Value, HandlerErr> {
    let qr_session_id = get_required_str(params, "qrSessionId")?;
    let photo_id = get_required_str(params, "photoId")?;
    let session = decisions.get_mut(&qr_session_id)?;
    let decision = match get_optional_str(params, "decision") {
        Some(raw) => {
            let d = Decision::parse(&raw).ok_or_else(|| {
                HandlerErr::bad_params("decision must be one of: present, absent, pending")
            })?;
            session.set(&photo_id, d)?
        }
        None => session.toggle(&photo_id)?,
    };
    Ok(json!({
        "photoId": photo_id,
        "decision": decision,
        "summary": session.summary()
    }))
}

fn verification_summary(decisions: &DecisionStore, params: &Value) -> Result<Value, HandlerErr> {
    let qr_session_id = get_required_str(params, "qrSessionId")?;
    let session = decisions.get(&qr_session_id)?;
    Ok(json!({
        "qrSessionId": qr_session_id,
        "photos": photo_rows(session),
        "summary": session.summary()
    }))
}

fn verification_save(
    decisions: &mut DecisionStore,
    repo: &impl AttendanceRepository,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let qr_session_id = get_required_str(params, "qrSessionId")?;
    let verified_by = get_required_str(params, "verifiedBy")?;
    let stamp = timestamp(now);
    let session = decisions.get(&qr_session_id)?;
    let mut marked = HashSet::new();
    for p in session.photos() {
        if session.decision(&p.id) == Some(Decision::Present)
            && repo.event_exists_for_session(&p.student_id, &p.date, &p.subject, &qr_session_id)?
        {
            marked.insert(p.student_id.clone());
        }
    }
    let plan = session.plan_save(&verified_by, &stamp, &marked);

    if let Err(e) = repo.commit_verification(&plan.events, &plan.processed, &verified_by, &stamp) {
        tracing::warn!(
            qr_session_id = %qr_session_id,
            error = %e,
            "verification save failed; decisions kept for retry"
        );
        return Err(e.into());
    }
    decisions.close(&qr_session_id);

    tracing::info!(
        qr_session_id = %qr_session_id,
        present = plan.events.len(),
        absent = plan.absent_decided.len(),
        inferred_absent = plan.inferred_absent.len(),
        already_marked = plan.already_marked.len(),
        "verification saved"
    );
    let event_ids: Vec<&str> = plan.events.iter().map(|e| e.id.as_str()).collect();
    Ok(json!({
        "qrSessionId": qr_session_id,
        "created": plan.events.len(),
        "eventIds": event_ids,
        "presentStudents": plan.events.iter().map(|e| e.user_id.as_str()).collect::<Vec<_>>(),
        "absentStudents": plan.absent_decided,
        "inferredAbsent": plan.inferred_absent,
        "alreadyMarked": plan.already_marked,
        "processed": plan.processed.len()
    }))
}

fn photos_cleanup(
    repo: &impl AttendanceRepository,
    grace_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let cutoff = timestamp(now - Duration::seconds(grace_seconds));
    let deleted = repo.delete_processed_photos_before(&cutoff, CLEANUP_BATCH)?;
    tracing::info!(deleted, cutoff = %cutoff, "processed photo cleanup");
    Ok(json!({ "deleted": deleted, "cutoff": cutoff }))
}

fn handle_photos_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match photos_submit(&state.qr, &SqliteRepository::new(conn), &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_verification_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match verification_open(&mut state.decisions, &state.qr, &SqliteRepository::new(conn), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_verification_toggle(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    match verification_toggle(&mut state.decisions, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_verification_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    match verification_summary(&state.decisions, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_verification_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match verification_save(&mut state.decisions, &SqliteRepository::new(conn), &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_photos_cleanup(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let settings = match effective_settings(conn, &state.config.attendance) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match photos_cleanup(&SqliteRepository::new(conn), settings.photo_grace_seconds, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "photos.submit" => Some(handle_photos_submit(state, req)),
        "verification.open" => Some(handle_verification_open(state, req)),
        "verification.toggle" => Some(handle_verification_toggle(state, req)),
        "verification.summary" => Some(handle_verification_summary(state, req)),
        "verification.save" => Some(handle_verification_save(state, req)),
        "photos.cleanup" => Some(handle_photos_cleanup(state, req)),
        _ => None,
    }
}
