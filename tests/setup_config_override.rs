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

fn submit(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    date: &str,
    present: bool,
) {
    request_ok(
        stdin,
        reader,
        id,
        "attendance.submitManual",
        json!({
            "school": "School of Technology", "batch": "24B1", "subject": "DSA",
            "markedBy": "fac-1", "periods": 1, "date": date,
            "marks": [{ "studentId": "alice", "present": present }]
        }),
    );
}

#[test]
fn stored_settings_override_environment_defaults() {
    let workspace = temp_dir("attendd-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "seed",
        "students.upsert",
        json!({ "students": [
            { "id": "alice", "fullName": "Alice Iyer", "regNumber": "24B1-001",
              "school": "School of Technology", "batch": "24B1" }
        ] }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "get", "setup.get", json!({}));
    assert_eq!(defaults["attendance"]["academicStartDate"], json!("2025-09-16"));
    assert_eq!(defaults["attendance"]["lowAttendanceThreshold"], json!(75));

    // One session before the default window start, three inside it.
    submit(&mut stdin, &mut reader, "s0", "2025-09-10", true);
    submit(&mut stdin, &mut reader, "s1", "2025-09-20", true);
    submit(&mut stdin, &mut reader, "s2", "2025-09-21", true);
    submit(&mut stdin, &mut reader, "s3", "2025-09-22", false);

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "before",
        "attendance.studentSummary",
        json!({ "userId": "alice", "today": "2025-10-01" }),
    );
    assert_eq!(before["overall"]["totalPeriods"], json!(3));
    assert_eq!(before["overall"]["percentage"], json!(67));
    assert_eq!(before["lowSubjects"], json!(["DSA"]));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "update",
        "setup.update",
        json!({ "section": "attendance", "patch": {
            "academicStartDate": "2025-09-01",
            "lowAttendanceThreshold": 60
        } }),
    );
    assert_eq!(updated["value"]["academicStartDate"], json!("2025-09-01"));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "after",
        "attendance.studentSummary",
        json!({ "userId": "alice", "today": "2025-10-01" }),
    );
    assert_eq!(after["window"]["startDate"], json!("2025-09-01"));
    assert_eq!(after["overall"]["totalPeriods"], json!(4));
    assert_eq!(after["overall"]["percentage"], json!(75));
    assert_eq!(after["lowSubjects"], json!([]));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "unknown",
        "setup.update",
        json!({ "section": "attendance", "patch": { "colour": "blue" } }),
    );
    assert_eq!(unknown["error"]["code"], json!("bad_params"));
    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "range",
        "setup.update",
        json!({ "section": "attendance", "patch": { "lowAttendanceThreshold": 120 } }),
    );
    assert_eq!(out_of_range["error"]["code"], json!("bad_params"));

    // Rejected patches leave the stored section untouched.
    let current = request_ok(&mut stdin, &mut reader, "get-2", "setup.get", json!({}));
    assert_eq!(current["attendance"]["lowAttendanceThreshold"], json!(60));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn environment_supplies_the_window_start() {
    let workspace = temp_dir("attendd-setup-env");
    let exe = env!("CARGO_BIN_EXE_attendd");
    let mut child = Command::new(exe)
        .env("ATTENDD_ALLOW_CLOCK_OVERRIDE", "1")
        .env("ATTENDD_ACADEMIC_START_DATE", "2026-01-05")
        .env("ATTENDD_LOW_ATTENDANCE_THRESHOLD", "80")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendd");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    request_ok(
        &mut stdin,
        &mut reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let settings = request_ok(&mut stdin, &mut reader, "get", "setup.get", json!({}));
    assert_eq!(settings["attendance"]["academicStartDate"], json!("2026-01-05"));
    assert_eq!(settings["attendance"]["lowAttendanceThreshold"], json!(80));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
