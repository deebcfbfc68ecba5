//! Storage seam between the aggregation code and the workspace database.
//!
//! Reads are plain equality filters; window filtering happens in `calc`.

use crate::leave::{LeaveRequest, LeaveStatus, Notification};
use crate::model::{
    normalize_periods, AttendanceEvent, AttendanceMethod, AttendanceStatus, PhotoStatus, Student,
    TempPhoto,
};
use crate::verification::Decision;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("commit failed: {0}")]
    Commit(String),
}

impl RepoError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn backend(err: impl Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn write(err: impl Display) -> Self {
        Self::Write(err.to_string())
    }

    pub fn commit(err: impl Display) -> Self {
        Self::Commit(err.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "bad_params",
            Self::Backend(_) => "db_query_failed",
            Self::Write(_) => "db_update_failed",
            Self::Commit(_) => "db_commit_failed",
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

pub trait AttendanceRepository {
    fn find_students(&self, school: &str, batch: &str) -> RepoResult<Vec<Student>>;
    fn find_student(&self, id: &str) -> RepoResult<Option<Student>>;
    fn find_student_by_reg(&self, reg_number: &str) -> RepoResult<Option<Student>>;
    fn upsert_students(&self, students: &[Student], updated_at: &str) -> RepoResult<usize>;

    fn events_for_student(&self, user_id: &str) -> RepoResult<Vec<AttendanceEvent>>;
    fn events_for_student_subject(&self, user_id: &str, subject: &str) -> RepoResult<Vec<AttendanceEvent>>;
    fn events_for_subject(&self, subject: &str) -> RepoResult<Vec<AttendanceEvent>>;
    fn events_for_subject_date(&self, subject: &str, date: &str) -> RepoResult<Vec<AttendanceEvent>>;
    fn events_for_student_date(&self, user_id: &str, date: &str) -> RepoResult<Vec<AttendanceEvent>>;
    fn event_exists_for_session(
        &self,
        user_id: &str,
        date: &str,
        subject: &str,
        session_id: &str,
    ) -> RepoResult<bool>;
    fn manual_sessions_for(&self, date: &str, subject: &str, batch: &str, marked_by: &str) -> RepoResult<usize>;
    /// All rows commit or none do.
    fn insert_events(&self, events: &[AttendanceEvent]) -> RepoResult<usize>;

    fn insert_temp_photo(&self, photo: &TempPhoto) -> RepoResult<()>;
    fn pending_photos_for_session(&self, qr_session_id: &str) -> RepoResult<Vec<TempPhoto>>;
    fn photo_exists_for_session(
        &self,
        student_id: &str,
        date: &str,
        subject: &str,
        qr_session_id: &str,
    ) -> RepoResult<bool>;
    /// Inserts the events and marks every listed photo processed in one transaction.
    fn commit_verification(
        &self,
        events: &[AttendanceEvent],
        processed: &[(String, Decision)],
        verified_by: &str,
        processed_at: &str,
    ) -> RepoResult<()>;
    fn delete_processed_photos_before(&self, cutoff: &str, limit: usize) -> RepoResult<usize>;

    fn insert_leave_request(&self, request: &LeaveRequest) -> RepoResult<()>;
    fn find_leave_request(&self, id: &str) -> RepoResult<Option<LeaveRequest>>;
    fn pending_leave_requests(&self) -> RepoResult<Vec<LeaveRequest>>;
    /// Updates the request and stores the student notification together.
    fn decide_leave_request(&self, decided: &LeaveRequest, notice: &Notification) -> RepoResult<()>;
    fn notifications_for_user(
        &self,
        user_id: &str,
        unread_only: bool,
        since: Option<&str>,
    ) -> RepoResult<Vec<Notification>>;
    /// `None` when the notification does not exist, otherwise whether it changed.
    fn mark_notification_read(&self, id: &str) -> RepoResult<Option<bool>>;
}

pub struct SqliteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_events<P: rusqlite::Params>(&self, filter: &str, params: P) -> RepoResult<Vec<AttendanceEvent>> {
        let sql = format!(
            "SELECT {} FROM attendance_events WHERE {} ORDER BY date, marked_at, id",
            EVENT_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql).map_err(RepoError::backend)?;
        stmt.query_map(params, event_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(RepoError::backend)
    }
}

const STUDENT_COLUMNS: &str = "id, full_name, reg_number, school, batch, email";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        full_name: r.get(1)?,
        reg_number: r.get(2)?,
        school: r.get(3)?,
        batch: r.get(4)?,
        email: r.get(5)?,
    })
}

const EVENT_COLUMNS: &str = "id, user_id, student_name, reg_number, school, batch, subject, date, \
     periods, status, session_id, qr_session_id, marked_by, faculty_name, method, \
     verification_method, has_photo, class_time, marked_at";

fn non_blank(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

fn event_from_row(r: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    let status: Option<String> = r.get(9)?;
    let method: Option<String> = r.get(14)?;
    let verification_method: Option<String> = r.get(15)?;
    Ok(AttendanceEvent {
        id: r.get(0)?,
        user_id: r.get(1)?,
        student_name: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
        reg_number: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
        school: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
        batch: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
        subject: r.get::<_, Option<String>>(6)?.unwrap_or_default(),
        date: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
        periods: normalize_periods(r.get(8)?),
        status: AttendanceStatus::parse(status.as_deref().unwrap_or_default()),
        session_id: non_blank(r.get(10)?),
        qr_session_id: non_blank(r.get(11)?),
        marked_by: r.get(12)?,
        faculty_name: r.get(13)?,
        method: AttendanceMethod::derive(method.as_deref(), verification_method.as_deref()),
        has_photo: r.get::<_, Option<i64>>(16)?.unwrap_or(0) != 0,
        class_time: r.get(17)?,
        marked_at: r.get(18)?,
    })
}

fn verification_method_for(method: AttendanceMethod) -> Option<&'static str> {
    match method {
        AttendanceMethod::Qr => Some("qr_only"),
        AttendanceMethod::QrPhotoVerified => Some("qr_and_photo_verified"),
        AttendanceMethod::Manual | AttendanceMethod::Unknown => None,
    }
}

fn insert_event(conn: &Connection, e: &AttendanceEvent) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO attendance_events({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            EVENT_COLUMNS
        ),
        params![
            e.id,
            e.user_id,
            e.student_name,
            e.reg_number,
            e.school,
            e.batch,
            e.subject,
            e.date,
            e.periods,
            e.status.as_str(),
            e.session_id,
            e.qr_session_id,
            e.marked_by,
            e.faculty_name,
            e.method.as_str(),
            verification_method_for(e.method),
            e.has_photo as i64,
            e.class_time,
            e.marked_at,
        ],
    )
}

const PHOTO_COLUMNS: &str = "id, student_id, student_name, reg_number, school, batch, subject, date, \
     periods, qr_session_id, faculty_id, faculty_name, photo_ref, status, submitted_at, \
     processed_at, faculty_decision";

fn photo_from_row(r: &Row<'_>) -> rusqlite::Result<TempPhoto> {
    let status: String = r.get(13)?;
    Ok(TempPhoto {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        reg_number: r.get(3)?,
        school: r.get(4)?,
        batch: r.get(5)?,
        subject: r.get(6)?,
        date: r.get(7)?,
        periods: normalize_periods(r.get(8)?),
        qr_session_id: r.get(9)?,
        faculty_id: r.get(10)?,
        faculty_name: r.get(11)?,
        photo_ref: r.get(12)?,
        status: PhotoStatus::parse(&status).unwrap_or(PhotoStatus::PendingVerification),
        submitted_at: r.get(14)?,
        processed_at: r.get(15)?,
        faculty_decision: r.get(16)?,
    })
}

const LEAVE_COLUMNS: &str = "id, user_id, student_name, reg_number, school, batch, date, subject, \
     periods, reason, status, submitted_at, processed_by, processed_at, faculty_comment";

fn leave_from_row(r: &Row<'_>) -> rusqlite::Result<LeaveRequest> {
    let status: String = r.get(10)?;
    Ok(LeaveRequest {
        id: r.get(0)?,
        user_id: r.get(1)?,
        student_name: r.get(2)?,
        reg_number: r.get(3)?,
        school: r.get(4)?,
        batch: r.get(5)?,
        date: r.get(6)?,
        subject: r.get(7)?,
        periods: normalize_periods(r.get(8)?),
        reason: r.get(9)?,
        status: LeaveStatus::parse(&status).unwrap_or(LeaveStatus::Pending),
        submitted_at: r.get(11)?,
        processed_by: r.get(12)?,
        processed_at: r.get(13)?,
        faculty_comment: r.get(14)?,
    })
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, message, is_read, created_at, related_id";

fn notification_from_row(r: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: r.get(0)?,
        user_id: r.get(1)?,
        kind: r.get(2)?,
        title: r.get(3)?,
        message: r.get(4)?,
        read: r.get::<_, i64>(5)? != 0,
        created_at: r.get(6)?,
        related_id: r.get(7)?,
    })
}

impl AttendanceRepository for SqliteRepository<'_> {
    fn find_students(&self, school: &str, batch: &str) -> RepoResult<Vec<Student>> {
        let sql = format!(
            "SELECT {} FROM students WHERE school = ? AND batch = ? ORDER BY reg_number, full_name",
            STUDENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(RepoError::backend)?;
        stmt.query_map([school, batch], student_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(RepoError::backend)
    }

    fn find_student(&self, id: &str) -> RepoResult<Option<Student>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
                [id],
                student_from_row,
            )
            .optional()
            .map_err(RepoError::backend)
    }

    fn find_student_by_reg(&self, reg_number: &str) -> RepoResult<Option<Student>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM students WHERE reg_number = ? ORDER BY id LIMIT 1",
                    STUDENT_COLUMNS
                ),
                [reg_number],
                student_from_row,
            )
            .optional()
            .map_err(RepoError::backend)
    }

    fn upsert_students(&self, students: &[Student], updated_at: &str) -> RepoResult<usize> {
        let tx = self.conn.unchecked_transaction().map_err(RepoError::write)?;
        for s in students {
            tx.execute(
                "INSERT INTO students(id, full_name, reg_number, school, batch, email, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                   full_name = excluded.full_name,
                   reg_number = excluded.reg_number,
                   school = excluded.school,
                   batch = excluded.batch,
                   email = excluded.email,
                   updated_at = excluded.updated_at",
                params![s.id, s.full_name, s.reg_number, s.school, s.batch, s.email, updated_at],
            )
            .map_err(RepoError::write)?;
        }
        tx.commit().map_err(RepoError::commit)?;
        Ok(students.len())
    }

    fn events_for_student(&self, user_id: &str) -> RepoResult<Vec<AttendanceEvent>> {
        self.query_events("user_id = ?", [user_id])
    }

    fn events_for_student_subject(&self, user_id: &str, subject: &str) -> RepoResult<Vec<AttendanceEvent>> {
        self.query_events("user_id = ? AND subject = ?", [user_id, subject])
    }

    fn events_for_subject(&self, subject: &str) -> RepoResult<Vec<AttendanceEvent>> {
        self.query_events("subject = ?", [subject])
    }

    fn events_for_subject_date(&self, subject: &str, date: &str) -> RepoResult<Vec<AttendanceEvent>> {
        self.query_events("subject = ? AND date = ?", [subject, date])
    }

    fn events_for_student_date(&self, user_id: &str, date: &str) -> RepoResult<Vec<AttendanceEvent>> {
        self.query_events("user_id = ? AND date = ?", [user_id, date])
    }

    fn event_exists_for_session(
        &self,
        user_id: &str,
        date: &str,
        subject: &str,
        session_id: &str,
    ) -> RepoResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM attendance_events
                 WHERE user_id = ? AND date = ? AND subject = ?
                   AND (session_id = ?4 OR qr_session_id = ?4)
                 LIMIT 1",
                params![user_id, date, subject, session_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some())
            .map_err(RepoError::backend)
    }

    fn manual_sessions_for(&self, date: &str, subject: &str, batch: &str, marked_by: &str) -> RepoResult<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(DISTINCT session_id) FROM attendance_events
                 WHERE date = ? AND subject = ? AND batch = ? AND marked_by = ?
                   AND method = 'manual' AND session_id IS NOT NULL",
                [date, subject, batch, marked_by],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as usize)
            .map_err(RepoError::backend)
    }

    fn insert_events(&self, events: &[AttendanceEvent]) -> RepoResult<usize> {
        if let Some(bad) = events.iter().find(|e| !e.is_well_formed()) {
            return Err(RepoError::invalid_argument(format!(
                "event {} has no usable subject/date",
                bad.id
            )));
        }
        let tx = self.conn.unchecked_transaction().map_err(RepoError::write)?;
        for e in events {
            insert_event(&tx, e).map_err(RepoError::write)?;
        }
        tx.commit().map_err(RepoError::commit)?;
        Ok(events.len())
    }

    fn insert_temp_photo(&self, p: &TempPhoto) -> RepoResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO temp_photos({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    PHOTO_COLUMNS
                ),
                params![
                    p.id,
                    p.student_id,
                    p.student_name,
                    p.reg_number,
                    p.school,
                    p.batch,
                    p.subject,
                    p.date,
                    p.periods,
                    p.qr_session_id,
                    p.faculty_id,
                    p.faculty_name,
                    p.photo_ref,
                    p.status.as_str(),
                    p.submitted_at,
                    p.processed_at,
                    p.faculty_decision,
                ],
            )
            .map(|_| ())
            .map_err(RepoError::write)
    }

    fn pending_photos_for_session(&self, qr_session_id: &str) -> RepoResult<Vec<TempPhoto>> {
        let sql = format!(
            "SELECT {} FROM temp_photos
             WHERE qr_session_id = ? AND status = 'pending_verification'
             ORDER BY submitted_at, id",
            PHOTO_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(RepoError::backend)?;
        stmt.query_map([qr_session_id], photo_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(RepoError::backend)
    }

    fn photo_exists_for_session(
        &self,
        student_id: &str,
        date: &str,
        subject: &str,
        qr_session_id: &str,
    ) -> RepoResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM temp_photos
                 WHERE student_id = ? AND date = ? AND subject = ? AND qr_session_id = ?
                 LIMIT 1",
                [student_id, date, subject, qr_session_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some())
            .map_err(RepoError::backend)
    }

    fn commit_verification(
        &self,
        events: &[AttendanceEvent],
        processed: &[(String, Decision)],
        verified_by: &str,
        processed_at: &str,
    ) -> RepoResult<()> {
        let tx = self.conn.unchecked_transaction().map_err(RepoError::write)?;
        for e in events {
            insert_event(&tx, e).map_err(RepoError::write)?;
        }
        for (photo_id, decision) in processed {
            tx.execute(
                "UPDATE temp_photos
                 SET status = 'processed', processed_at = ?, faculty_decision = ?, verified_by = ?
                 WHERE id = ?",
                params![processed_at, decision.as_str(), verified_by, photo_id],
            )
            .map_err(RepoError::write)?;
        }
        tx.commit().map_err(RepoError::commit)
    }

    fn delete_processed_photos_before(&self, cutoff: &str, limit: usize) -> RepoResult<usize> {
        self.conn
            .execute(
                "DELETE FROM temp_photos WHERE id IN (
                   SELECT id FROM temp_photos
                   WHERE status = 'processed' AND processed_at IS NOT NULL AND processed_at < ?
                   ORDER BY processed_at
                   LIMIT ?
                 )",
                params![cutoff, limit as i64],
            )
            .map_err(RepoError::write)
    }

    fn insert_leave_request(&self, l: &LeaveRequest) -> RepoResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO leave_requests({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    LEAVE_COLUMNS
                ),
                params![
                    l.id,
                    l.user_id,
                    l.student_name,
                    l.reg_number,
                    l.school,
                    l.batch,
                    l.date,
                    l.subject,
                    l.periods,
                    l.reason,
                    l.status.as_str(),
                    l.submitted_at,
                    l.processed_by,
                    l.processed_at,
                    l.faculty_comment,
                ],
            )
            .map(|_| ())
            .map_err(RepoError::write)
    }

    fn find_leave_request(&self, id: &str) -> RepoResult<Option<LeaveRequest>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM leave_requests WHERE id = ?", LEAVE_COLUMNS),
                [id],
                leave_from_row,
            )
            .optional()
            .map_err(RepoError::backend)
    }

    fn pending_leave_requests(&self) -> RepoResult<Vec<LeaveRequest>> {
        let sql = format!(
            "SELECT {} FROM leave_requests WHERE status = 'pending' ORDER BY submitted_at, id",
            LEAVE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(RepoError::backend)?;
        stmt.query_map([], leave_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(RepoError::backend)
    }

    fn decide_leave_request(&self, decided: &LeaveRequest, notice: &Notification) -> RepoResult<()> {
        let tx = self.conn.unchecked_transaction().map_err(RepoError::write)?;
        tx.execute(
            "UPDATE leave_requests
             SET status = ?, processed_by = ?, processed_at = ?, faculty_comment = ?
             WHERE id = ?",
            params![
                decided.status.as_str(),
                decided.processed_by,
                decided.processed_at,
                decided.faculty_comment,
                decided.id,
            ],
        )
        .map_err(RepoError::write)?;
        tx.execute(
            &format!(
                "INSERT INTO notifications({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                NOTIFICATION_COLUMNS
            ),
            params![
                notice.id,
                notice.user_id,
                notice.kind,
                notice.title,
                notice.message,
                notice.read as i64,
                notice.created_at,
                notice.related_id,
            ],
        )
        .map_err(RepoError::write)?;
        tx.commit().map_err(RepoError::commit)
    }

    fn notifications_for_user(
        &self,
        user_id: &str,
        unread_only: bool,
        since: Option<&str>,
    ) -> RepoResult<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications
             WHERE user_id = ?1
               AND (?2 = 0 OR is_read = 0)
               AND (?3 IS NULL OR created_at > ?3)
             ORDER BY created_at DESC, id",
            NOTIFICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(RepoError::backend)?;
        stmt.query_map(params![user_id, unread_only as i64, since], notification_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(RepoError::backend)
    }

    fn mark_notification_read(&self, id: &str) -> RepoResult<Option<bool>> {
        let current: Option<i64> = self
            .conn
            .query_row("SELECT is_read FROM notifications WHERE id = ?", [id], |r| r.get(0))
            .optional()
            .map_err(RepoError::backend)?;
        match current {
            None => Ok(None),
            Some(v) if v != 0 => Ok(Some(false)),
            Some(_) => {
                self.conn
                    .execute("UPDATE notifications SET is_read = 1 WHERE id = ?", [id])
                    .map_err(RepoError::write)?;
                Ok(Some(true))
            }
        }
    }
}
