use crate::config::AttendanceSettings;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_periods, get_required_day, get_required_str,
    timestamp, today,
};
use crate::ipc::types::{AppState, Request};
use crate::leave::{leave_decision_notice, LeaveRequest, LeaveStatus};
use crate::repo::{AttendanceRepository, SqliteRepository};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

const REASON_MAX: usize = 1000;

fn leave_submit(
    repo: &impl AttendanceRepository,
    settings: &AttendanceSettings,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let date = get_required_day(params, "date")?;
    let subject = get_required_str(params, "subject")?;
    let reason = get_required_str(params, "reason")?;
    if reason.chars().count() > REASON_MAX {
        return Err(HandlerErr::bad_params(format!("reason length must be <= {}", REASON_MAX)));
    }
    let periods = get_periods(params)?;
    let today = today(params, settings, now)?;
    if date < today {
        return Err(HandlerErr::new(
            "past_date",
            format!("leave cannot be requested for {}, which is before {}", date, today),
        ));
    }
    let Some(student) = repo.find_student(&user_id)? else {
        return Err(HandlerErr::not_found(format!("no student profile for {}", user_id)));
    };
    let request = LeaveRequest::new(&student, &date, &subject, periods, &reason, &timestamp(now));
    repo.insert_leave_request(&request)?;
    tracing::info!(request_id = %request.id, user_id = %user_id, date = %date, "leave requested");
    Ok(json!({ "requestId": request.id, "status": request.status }))
}

fn leave_list_pending(repo: &impl AttendanceRepository) -> Result<Value, HandlerErr> {
    let requests = repo.pending_leave_requests()?;
    Ok(json!({ "requests": requests }))
}

fn leave_decide(
    repo: &impl AttendanceRepository,
    params: &Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let processed_by = get_required_str(params, "processedBy")?;
    let comment = get_optional_str(params, "comment");
    let status = match LeaveStatus::parse(&get_required_str(params, "status")?) {
        Some(s @ (LeaveStatus::Approved | LeaveStatus::Rejected)) => s,
        _ => return Err(HandlerErr::bad_params("status must be one of: approved, rejected")),
    };
    let Some(mut request) = repo.find_leave_request(&request_id)? else {
        return Err(HandlerErr::not_found(format!("no leave request {}", request_id)));
    };
    if request.status != LeaveStatus::Pending {
        return Err(HandlerErr::bad_params(format!(
            "leave request {} is already {}",
            request_id,
            request.status.as_str()
        )));
    }
    let stamp = timestamp(now);
    request.status = status;
    request.processed_by = Some(processed_by);
    request.processed_at = Some(stamp.clone());
    request.faculty_comment = comment.clone();
    let notice = leave_decision_notice(&request, status, comment.as_deref(), &stamp);
    repo.decide_leave_request(&request, &notice)?;
    tracing::info!(request_id = %request.id, status = status.as_str(), "leave request decided");
    Ok(json!({ "request": request, "notificationId": notice.id }))
}

fn notifications_list(repo: &impl AttendanceRepository, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let unread_only = get_optional_bool(params, "unreadOnly")?.unwrap_or(false);
    let since = get_optional_str(params, "since");
    let notifications = repo.notifications_for_user(&user_id, unread_only, since.as_deref())?;
    // Rows are newest first, so the first row is the next cursor.
    let cursor = notifications
        .first()
        .map(|n| n.created_at.clone())
        .or(since);
    Ok(json!({ "notifications": notifications, "cursor": cursor }))
}

fn notifications_mark_read(repo: &impl AttendanceRepository, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    match repo.mark_notification_read(&id)? {
        Some(changed) => Ok(json!({ "id": id, "changed": changed })),
        None => Err(HandlerErr::not_found(format!("no notification {}", id))),
    }
}

fn handle_leave_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match leave_submit(&SqliteRepository::new(conn), &state.config.attendance, &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_leave_list_pending(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match leave_list_pending(&SqliteRepository::new(conn)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_leave_decide(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match leave_decide(&SqliteRepository::new(conn), &req.params, Utc::now()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notifications_list(&SqliteRepository::new(conn), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_notifications_mark_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notifications_mark_read(&SqliteRepository::new(conn), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "leave.submit" => Some(handle_leave_submit(state, req)),
        "leave.listPending" => Some(handle_leave_list_pending(state, req)),
        "leave.decide" => Some(handle_leave_decide(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        "notifications.markRead" => Some(handle_notifications_mark_read(state, req)),
        _ => None,
    }
}
