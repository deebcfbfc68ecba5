use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, timestamp};
use crate::ipc::types::{AppState, Request};
use crate::model::Student;
use crate::repo::{AttendanceRepository, SqliteRepository};
use serde_json::{json, Value};

fn parse_student(v: &Value, idx: usize) -> Result<Student, HandlerErr> {
    let field = |key: &str| {
        get_required_str(v, key).map_err(|_| {
            HandlerErr::bad_params(format!("students[{}].{} is required", idx, key))
        })
    };
    Ok(Student {
        id: get_optional_str(v, "id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        full_name: field("fullName")?,
        reg_number: field("regNumber")?,
        school: field("school")?,
        batch: field("batch")?,
        email: get_optional_str(v, "email"),
    })
}

fn students_upsert(repo: &impl AttendanceRepository, params: &Value) -> Result<Value, HandlerErr> {
    let Some(items) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("students must be an array"));
    };
    let students = items
        .iter()
        .enumerate()
        .map(|(i, v)| parse_student(v, i))
        .collect::<Result<Vec<_>, _>>()?;
    let n = repo.upsert_students(&students, &timestamp(chrono::Utc::now()))?;
    let ids: Vec<&str> = students.iter().map(|s| s.id.as_str()).collect();
    Ok(json!({ "upserted": n, "ids": ids }))
}

fn students_list(repo: &impl AttendanceRepository, params: &Value) -> Result<Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let batch = get_required_str(params, "batch")?;
    let students = repo.find_students(&school, &batch)?;
    Ok(json!({ "students": students }))
}

fn students_find_by_reg(repo: &impl AttendanceRepository, params: &Value) -> Result<Value, HandlerErr> {
    let reg = get_required_str(params, "regNumber")?;
    match repo.find_student_by_reg(&reg)? {
        Some(student) => Ok(json!({ "student": student })),
        None => Err(HandlerErr::not_found(format!("no student with registration number {}", reg))),
    }
}

fn handle_with_repo(
    state: &mut AppState,
    req: &Request,
    op: fn(&SqliteRepository<'_>, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match op(&SqliteRepository::new(conn), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(handle_with_repo(state, req, |r, p| students_upsert(r, p))),
        "students.list" => Some(handle_with_repo(state, req, |r, p| students_list(r, p))),
        "students.findByReg" => Some(handle_with_repo(state, req, |r, p| students_find_by_reg(r, p))),
        _ => None,
    }
}
