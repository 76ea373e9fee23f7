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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_tokens(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, String) {
    request_ok(
        stdin,
        reader,
        "a1",
        "admin.create",
        json!({
            "name": "Ada Admin",
            "email": "ada@example.com",
            "password": "secret99",
            "employeeId": "ADM-1"
        }),
    );
    let admin_token = request_ok(
        stdin,
        reader,
        "al",
        "admin.login",
        json!({ "email": "ada@example.com", "password": "secret99" }),
    )["token"]
        .as_str()
        .expect("admin token")
        .to_string();

    request_ok(
        stdin,
        reader,
        "t1",
        "auth.registerTeacher",
        json!({
            "name": "Tess Teacher",
            "email": "tess@example.com",
            "password": "secret99",
            "employeeId": "EMP-1",
            "phone": "555-0101",
            "address": "2 Main St",
            "qualification": "BEd",
            "subjects": ["Math"],
            "assignedClasses": [{ "class": "5", "section": "A", "subject": "Math" }]
        }),
    );
    let teacher_token = request_ok(
        stdin,
        reader,
        "tl",
        "auth.login",
        json!({ "email": "tess@example.com", "password": "secret99", "userType": "teacher" }),
    )["token"]
        .as_str()
        .expect("teacher token")
        .to_string();

    (admin_token, teacher_token)
}

#[test]
fn upsert_replaces_only_supplied_fields() {
    let workspace = temp_dir("schoold-timetable");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (admin_token, teacher_token) = seed_tokens(&mut stdin, &mut reader);

    let schedule = json!([{
        "day": "Monday",
        "periods": [
            { "period": 1, "subject": "Math", "startTime": "09:00", "endTime": "09:45" },
            { "period": 2, "subject": "Science", "startTime": "09:50", "endTime": "10:35" }
        ]
    }]);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "up1",
        "timetable.upsert",
        json!({
            "token": admin_token,
            "class": "5",
            "section": "A",
            "schedule": schedule
        }),
    );
    assert_eq!(created["timetable"]["schedule"], schedule);
    assert_eq!(created["timetable"]["holidays"], json!([]));

    // Supplying only holidays must keep the stored schedule.
    let holidays = json!([{ "date": "2024-03-08", "reason": "Staff day" }]);
    let merged = request_ok(
        &mut stdin,
        &mut reader,
        "up2",
        "timetable.upsert",
        json!({
            "token": admin_token,
            "class": "5",
            "section": "A",
            "holidays": holidays
        }),
    );
    assert_eq!(merged["timetable"]["schedule"], schedule);
    assert_eq!(merged["timetable"]["holidays"], holidays);

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "timetable.get",
        json!({ "token": teacher_token, "class": "5", "section": "A" }),
    );
    assert_eq!(fetched["timetable"]["holidays"], holidays);

    // Non-admins cannot upsert.
    let denied = request_raw(
        &mut stdin,
        &mut reader,
        "up3",
        "timetable.upsert",
        json!({
            "token": teacher_token,
            "class": "5",
            "section": "A",
            "schedule": schedule
        }),
    );
    assert_eq!(denied["error"]["code"], json!("forbidden"));

    // Invalid day names are rejected before any write.
    let bad_day = request_raw(
        &mut stdin,
        &mut reader,
        "up4",
        "timetable.upsert",
        json!({
            "token": admin_token,
            "class": "6",
            "section": "B",
            "schedule": [{ "day": "Funday", "periods": [] }]
        }),
    );
    assert_eq!(bad_day["error"]["code"], json!("bad_params"));
    let missing = request_raw(
        &mut stdin,
        &mut reader,
        "get2",
        "timetable.get",
        json!({ "token": teacher_token, "class": "6", "section": "B" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn holidays_of_a_missing_timetable_are_an_empty_list() {
    let workspace = temp_dir("schoold-holidays");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_, teacher_token) = seed_tokens(&mut stdin, &mut reader);

    let holidays = request_ok(
        &mut stdin,
        &mut reader,
        "h1",
        "timetable.holidays",
        json!({ "token": teacher_token, "class": "9", "section": "Z" }),
    );
    assert_eq!(holidays["holidays"], json!([]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_classes_come_from_the_teacher_record() {
    let workspace = temp_dir("schoold-teacherclasses");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_, teacher_token) = seed_tokens(&mut stdin, &mut reader);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "tc",
        "timetable.teacherClasses",
        json!({ "token": teacher_token }),
    );
    assert_eq!(
        result["assignedClasses"],
        json!([{ "class": "5", "section": "A", "subject": "Math" }])
    );
    assert_eq!(result["teacherInfo"]["employeeId"], json!("EMP-1"));
    assert_eq!(result["teacherInfo"]["subjects"], json!(["Math"]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
