use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_attendd");
    let mut child = Command::new(exe)
        .env("ATTENDD_ALLOW_CLOCK_OVERRIDE", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    request_ok(
        stdin,
        reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "seed",
        "students.upsert",
        json!({ "students": [
            { "id": "alice", "fullName": "Alice Iyer", "regNumber": "24B1-001",
              "school": "School of Technology", "batch": "24B1" },
            { "id": "bob", "fullName": "Bob Menon", "regNumber": "24B1-002",
              "school": "School of Technology", "batch": "24B1" },
            { "id": "carol", "fullName": "Carol Das", "regNumber": "24B1-003",
              "school": "School of Technology", "batch": "24B1" },
            { "id": "dave", "fullName": "Dave Pillai", "regNumber": "24B2-001",
              "school": "School of Technology", "batch": "24B2" }
        ] }),
    );
}

/// Rows shaped like an older store: no session id, one disagreeing periods value.
fn seed_unlabeled_rows(workspace: &PathBuf) {
    let conn = rusqlite::Connection::open(workspace.join("attendd.sqlite3")).expect("open db");
    let rows: [(&str, &str, i64, &str, &str); 4] = [
        ("legacy-1", "alice", 2, "present", "09:00"),
        ("legacy-2", "bob", 2, "absent", "09:00"),
        ("legacy-3", "carol", 1, "present", "09:00"),
        ("legacy-4", "alice", 1, "present", "11:00"),
    ];
    for (id, user, periods, status, class_time) in rows {
        conn.execute(
            "INSERT INTO attendance_events(id, user_id, school, batch, subject, date, periods, status, marked_by, class_time)
             VALUES(?, ?, 'School of Technology', '24B1', 'DSA', '2025-09-25', ?, ?, 'fac-1', ?)",
            rusqlite::params![id, user, periods, status, class_time],
        )
        .expect("insert legacy row");
    }
}

fn row<'a>(report: &'a serde_json::Value, student: &str) -> &'a serde_json::Value {
    report["rows"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["studentId"] == json!(student)))
        .expect("student row")
}

#[test]
fn day_without_a_session_reports_no_figures() {
    let workspace = temp_dir("attendd-batch-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "attendance.batchReport",
        json!({
            "school": "School of Technology", "batch": "24B1", "subject": "DSA",
            "date": "2025-09-25", "today": "2025-10-01"
        }),
    );
    assert_eq!(report["sessionHeld"], json!(false));
    assert!(report["totalClassesToday"].is_null());
    assert_eq!(report["message"], json!("No Attendance Session Found"));
    assert_eq!(report["summary"]["enrolled"], json!(3));
    assert!(report["summary"]["attendancePercentage"].is_null());
    for r in report["rows"].as_array().expect("rows") {
        assert!(r["classesAttendedToday"].is_null());
        assert!(r["subjectPercentage"].is_null());
        assert!(r["overallPercentage"].is_null());
        assert!(r["mode"].is_null());
    }

    let future = request(
        &mut stdin,
        &mut reader,
        "f",
        "attendance.batchReport",
        json!({
            "school": "School of Technology", "batch": "24B1", "subject": "DSA",
            "date": "2025-10-02", "today": "2025-10-01"
        }),
    );
    assert_eq!(future["error"]["code"], json!("future_date"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unlabeled_rows_reconcile_into_sessions_with_tri_state_marks() {
    let workspace = temp_dir("attendd-batch-tristate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);
    seed_unlabeled_rows(&workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "attendance.batchReport",
        json!({
            "school": "School of Technology", "batch": "24B1", "subject": "DSA",
            "date": "2025-09-25", "today": "2025-10-01"
        }),
    );
    assert_eq!(report["sessionHeld"], json!(true));
    // 09:00 session takes the majority value 2, the 11:00 session adds 1.
    assert_eq!(report["totalClassesToday"], json!(3));
    let sessions = report["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["key"], json!("2025-09-25_DSA_fac-1_09:00"));
    assert_eq!(sessions[0]["periods"], json!(2));
    assert_eq!(sessions[0]["conflictingPeriods"], json!([1, 2]));
    assert_eq!(sessions[1]["periods"], json!(1));

    let alice = row(&report, "alice");
    assert_eq!(alice["classesAttendedToday"], json!(3));
    assert_eq!(alice["sessions"][0]["state"], json!("present"));
    assert_eq!(alice["sessions"][1]["state"], json!("present"));

    let bob = row(&report, "bob");
    assert_eq!(bob["classesAttendedToday"], json!(0));
    assert_eq!(bob["sessions"][0]["state"], json!("absent_recorded"));
    assert_eq!(bob["sessions"][1]["state"], json!("absent_inferred"));

    let carol = row(&report, "carol");
    assert_eq!(carol["classesAttendedToday"], json!(1));
    assert_eq!(carol["sessions"][1]["state"], json!("absent_inferred"));

    assert_eq!(report["summary"]["enrolled"], json!(3));
    assert_eq!(report["summary"]["presentStudents"], json!(2));
    assert_eq!(report["summary"]["absentStudents"], json!(1));
    assert_eq!(report["summary"]["attendancePercentage"], json!(44));

    // Alice attended every DSA period held in the window.
    assert_eq!(alice["subjectPercentage"], json!(100));
    assert_eq!(bob["subjectPercentage"], json!(0));
    assert_eq!(alice["mode"], json!("fair"));
    assert_eq!(bob["mode"], json!("fair"));

    // Another batch held nothing that day.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "other",
        "attendance.batchReport",
        json!({
            "school": "School of Technology", "batch": "24B2", "subject": "DSA",
            "date": "2025-09-25", "today": "2025-10-01"
        }),
    );
    assert_eq!(other["sessionHeld"], json!(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
