use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "attendd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            reg_number TEXT NOT NULL,
            school TEXT NOT NULL,
            batch TEXT NOT NULL,
            email TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school_batch ON students(school, batch)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_reg ON students(reg_number)",
        [],
    )?;

    // subject, date, periods and the session columns stay nullable: imported
    // rows from older stores may lack any of them.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_events(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            student_name TEXT,
            reg_number TEXT,
            school TEXT,
            batch TEXT,
            subject TEXT,
            date TEXT,
            periods INTEGER,
            status TEXT NOT NULL,
            session_id TEXT,
            marked_by TEXT,
            faculty_name TEXT,
            has_photo INTEGER NOT NULL DEFAULT 0,
            marked_at TEXT
        )",
        [],
    )?;
    ensure_attendance_events_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_user_subject ON attendance_events(user_id, subject)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_subject_date ON attendance_events(subject, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_user_date ON attendance_events(user_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_photos(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            reg_number TEXT NOT NULL,
            school TEXT NOT NULL,
            batch TEXT NOT NULL,
            subject TEXT NOT NULL,
            date TEXT NOT NULL,
            periods INTEGER NOT NULL,
            qr_session_id TEXT,
            faculty_id TEXT,
            faculty_name TEXT,
            photo_ref TEXT NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            processed_at TEXT,
            faculty_decision TEXT,
            verified_by TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_photos_session ON temp_photos(qr_session_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_photos_processed ON temp_photos(status, processed_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS leave_requests(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            reg_number TEXT NOT NULL,
            school TEXT NOT NULL,
            batch TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT NOT NULL,
            periods INTEGER NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            processed_by TEXT,
            processed_at TEXT,
            faculty_comment TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_leave_requests_status ON leave_requests(status, submitted_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            related_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_attendance_events_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "attendance_events", "qr_session_id")? {
        conn.execute("ALTER TABLE attendance_events ADD COLUMN qr_session_id TEXT", [])?;
    }
    if !table_has_column(conn, "attendance_events", "method")? {
        conn.execute("ALTER TABLE attendance_events ADD COLUMN method TEXT", [])?;
    }
    if !table_has_column(conn, "attendance_events", "verification_method")? {
        conn.execute(
            "ALTER TABLE attendance_events ADD COLUMN verification_method TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "attendance_events", "class_time")? {
        conn.execute("ALTER TABLE attendance_events ADD COLUMN class_time TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        rusqlite::params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}-{}", prefix, nanos))
    }

    #[test]
    fn open_is_idempotent_and_migrates_old_event_tables() {
        let ws = temp_workspace("attendd-db");
        std::fs::create_dir_all(&ws).expect("mkdir");
        {
            let conn = Connection::open(ws.join(DB_FILE)).expect("open raw");
            conn.execute(
                "CREATE TABLE attendance_events(
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    student_name TEXT,
                    reg_number TEXT,
                    school TEXT,
                    batch TEXT,
                    subject TEXT,
                    date TEXT,
                    periods INTEGER,
                    status TEXT NOT NULL,
                    session_id TEXT,
                    marked_by TEXT,
                    faculty_name TEXT,
                    has_photo INTEGER NOT NULL DEFAULT 0,
                    marked_at TEXT
                )",
                [],
            )
            .expect("legacy table");
        }
        let conn = open_db(&ws).expect("open_db");
        assert!(table_has_column(&conn, "attendance_events", "qr_session_id").expect("pragma"));
        assert!(table_has_column(&conn, "attendance_events", "verification_method").expect("pragma"));
        drop(conn);
        open_db(&ws).expect("reopen");
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[test]
    fn settings_round_trip() {
        let ws = temp_workspace("attendd-settings");
        let conn = open_db(&ws).expect("open_db");
        assert!(settings_get_json(&conn, "setup.attendance").expect("get").is_none());
        let v = serde_json::json!({ "lowAttendanceThreshold": 80 });
        settings_set_json(&conn, "setup.attendance", &v).expect("set");
        settings_set_json(&conn, "setup.attendance", &v).expect("overwrite");
        assert_eq!(settings_get_json(&conn, "setup.attendance").expect("get"), Some(v));
        let _ = std::fs::remove_dir_all(&ws);
    }
}
