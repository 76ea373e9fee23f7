use chrono::Utc;
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

fn request_ok(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    student_id: String,
    teacher_token: String,
    student_token: String,
    parent_token: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let parent = request_ok(
        stdin,
        reader,
        "p1",
        "auth.registerParent",
        json!({
            "name": "Pat Parent",
            "email": "pat@example.com",
            "password": "secret99",
            "phone": "555-0100",
            "address": "1 Main St",
            "occupation": "engineer",
            "relation": "mother"
        }),
    );
    let parent_id = parent["parent"]["id"].as_str().expect("parent id").to_string();

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

    let student = request_ok(
        stdin,
        reader,
        "s1",
        "auth.registerStudent",
        json!({
            "name": "Sam Student",
            "email": "sam@example.com",
            "password": "secret99",
            "rollNumber": "R-001",
            "class": "5",
            "section": "A",
            "parentId": parent_id
        }),
    );
    let student_id = student["student"]["id"].as_str().expect("student id").to_string();

    let login = |stdin: &mut ChildStdin,
                 reader: &mut BufReader<ChildStdout>,
                 email: &str,
                 user_type: &str| {
        request_ok(
            stdin,
            reader,
            "login",
            "auth.login",
            json!({ "email": email, "password": "secret99", "userType": user_type }),
        )["token"]
            .as_str()
            .expect("token")
            .to_string()
    };

    Fixture {
        student_id,
        teacher_token: login(stdin, reader, "tess@example.com", "teacher"),
        student_token: login(stdin, reader, "sam@example.com", "student"),
        parent_token: login(stdin, reader, "pat@example.com", "parent"),
    }
}

fn types_of(feed: &serde_json::Value) -> Vec<String> {
    feed["notifications"]
        .as_array()
        .expect("notifications array")
        .iter()
        .map(|n| n["type"].as_str().expect("type").to_string())
        .collect()
}

#[test]
fn absence_surfaces_in_parent_and_student_feeds() {
    let workspace = temp_dir("schoold-feed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let take = request_ok(
        &mut stdin,
        &mut reader,
        "take",
        "attendance.take",
        json!({
            "token": fx.teacher_token,
            "classInfo": {
                "class": "5", "section": "A", "subject": "Math", "date": today, "period": 1
            },
            "entries": [{ "studentId": fx.student_id, "status": "absent" }]
        }),
    );
    assert_eq!(take["processed"], json!(1));

    // Parent: a leading weekly summary plus one alert per absence.
    let parent_feed = request_ok(
        &mut stdin,
        &mut reader,
        "pf",
        "notifications.list",
        json!({ "token": fx.parent_token }),
    );
    let parent_types = types_of(&parent_feed);
    assert!(parent_types.contains(&"attendance_summary".to_string()));
    assert!(parent_types.contains(&"attendance_alert".to_string()));
    let alert = parent_feed["notifications"]
        .as_array()
        .expect("array")
        .iter()
        .find(|n| n["type"] == json!("attendance_alert"))
        .expect("alert present");
    assert!(alert["message"]
        .as_str()
        .expect("message")
        .contains("Sam Student"));
    assert_eq!(alert["data"]["subject"], json!("Math"));
    assert_eq!(alert["read"], json!(false));

    // Student: summary carries the computed percentage.
    let student_feed = request_ok(
        &mut stdin,
        &mut reader,
        "sf",
        "notifications.list",
        json!({ "token": fx.student_token }),
    );
    let summary = student_feed["notifications"]
        .as_array()
        .expect("array")
        .iter()
        .find(|n| n["type"] == json!("attendance_summary"))
        .expect("summary present");
    assert_eq!(summary["data"]["attendancePercentage"], json!(0));
    assert_eq!(summary["priority"], json!("high"));

    // Teacher: class digest for the absence plus no reminder (attendance
    // was recorded today).
    let teacher_feed = request_ok(
        &mut stdin,
        &mut reader,
        "tf",
        "notifications.list",
        json!({ "token": fx.teacher_token }),
    );
    let teacher_types = types_of(&teacher_feed);
    assert!(teacher_types.contains(&"class_update".to_string()));
    assert!(teacher_types.contains(&"info".to_string()));
    assert!(!teacher_types.contains(&"reminder".to_string()));

    // The feed summary never reports reads: everything stays unread.
    assert_eq!(
        parent_feed["summary"]["total"],
        parent_feed["summary"]["unread"]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn mark_read_acknowledges_without_persisting() {
    let workspace = temp_dir("schoold-feed-ack");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let today = Utc::now().format("%Y-%m-%d").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "take",
        "attendance.take",
        json!({
            "token": fx.teacher_token,
            "classInfo": {
                "class": "5", "section": "A", "subject": "Math", "date": today, "period": 1
            },
            "entries": [{ "studentId": fx.student_id, "status": "absent" }]
        }),
    );

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "b",
        "notifications.list",
        json!({ "token": fx.parent_token }),
    );
    let first_id = before["notifications"][0]["id"].as_str().expect("id").to_string();

    let ack = request_ok(
        &mut stdin,
        &mut reader,
        "ack",
        "notifications.markRead",
        json!({ "token": fx.parent_token, "notificationId": first_id }),
    );
    assert_eq!(ack["notificationId"].as_str(), Some(first_id.as_str()));

    // Derived feed: the acknowledged entry still appears, still unread.
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "a",
        "notifications.list",
        json!({ "token": fx.parent_token }),
    );
    assert_eq!(
        before["notifications"].as_array().map(|a| a.len()),
        after["notifications"].as_array().map(|a| a.len())
    );
    assert_eq!(after["notifications"][0]["read"], json!(false));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "notifications.summary",
        json!({ "token": fx.parent_token }),
    );
    assert!(summary["summary"]["total"].as_u64().expect("total") >= 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_without_todays_records_gets_a_reminder() {
    let workspace = temp_dir("schoold-reminder");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let feed = request_ok(
        &mut stdin,
        &mut reader,
        "tf",
        "notifications.list",
        json!({ "token": fx.teacher_token }),
    );
    let types = types_of(&feed);
    assert!(types.contains(&"reminder".to_string()));
    assert!(types.contains(&"info".to_string()));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
