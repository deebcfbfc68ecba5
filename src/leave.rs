use crate::model::Student;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
}

impl LeaveStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub id: String,
    pub user_id: String,
    pub student_name: String,
    pub reg_number: String,
    pub school: String,
    pub batch: String,
    pub date: String,
    pub subject: String,
    pub periods: i64,
    pub reason: String,
    pub status: LeaveStatus,
    pub submitted_at: String,
    pub processed_by: Option<String>,
    pub processed_at: Option<String>,
    pub faculty_comment: Option<String>,
}

impl LeaveRequest {
    pub fn new(
        student: &Student,
        date: &str,
        subject: &str,
        periods: i64,
        reason: &str,
        submitted_at: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: student.id.clone(),
            student_name: student.full_name.clone(),
            reg_number: student.reg_number.clone(),
            school: student.school.clone(),
            batch: student.batch.clone(),
            date: date.to_string(),
            subject: subject.to_string(),
            periods: periods.max(1),
            reason: reason.trim().to_string(),
            status: LeaveStatus::Pending,
            submitted_at: submitted_at.to_string(),
            processed_by: None,
            processed_at: None,
            faculty_comment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: String,
    pub related_id: Option<String>,
}

/// Notification sent to the student once a leave request is decided.
pub fn leave_decision_notice(
    request: &LeaveRequest,
    status: LeaveStatus,
    comment: Option<&str>,
    created_at: &str,
) -> Notification {
    let verdict = match status {
        LeaveStatus::Approved => "approved",
        LeaveStatus::Rejected => "rejected",
        LeaveStatus::Pending => "updated",
    };
    let mut message = format!(
        "Your leave request for {} on {} has been {}.",
        request.subject, request.date, verdict
    );
    if let Some(c) = comment.map(str::trim).filter(|c| !c.is_empty()) {
        message.push_str(&format!(" Comment: {}", c));
    }
    Notification {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: request.user_id.clone(),
        kind: "leave_status".to_string(),
        title: format!("Leave request {}", verdict),
        message,
        read: false,
        created_at: created_at.to_string(),
        related_id: Some(request.id.clone()),
    }
}
