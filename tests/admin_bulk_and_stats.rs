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

fn bootstrap_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
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
    request_ok(
        stdin,
        reader,
        "al",
        "admin.login",
        json!({ "email": "ada@example.com", "password": "secret99" }),
    )["token"]
        .as_str()
        .expect("admin token")
        .to_string()
}

#[test]
fn first_admin_bootstraps_then_creation_is_gated() {
    let workspace = temp_dir("schoold-bootstrap");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First create needs no token.
    let admin_token = bootstrap_admin(&mut stdin, &mut reader);

    // Second create without a token is refused.
    let unauth = request_raw(
        &mut stdin,
        &mut reader,
        "a2",
        "admin.create",
        json!({
            "name": "Bo Admin",
            "email": "bo@example.com",
            "password": "secret99",
            "employeeId": "ADM-2"
        }),
    );
    assert_eq!(unauth["error"]["code"], json!("missing_token"));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "a3",
        "admin.create",
        json!({
            "token": admin_token,
            "name": "Bo Admin",
            "email": "bo@example.com",
            "password": "secret99",
            "employeeId": "ADM-2",
            "permissions": ["view_reports"]
        }),
    );
    assert_eq!(second["admin"]["permissions"], json!(["view_reports"]));

    let dup = request_raw(
        &mut stdin,
        &mut reader,
        "a4",
        "admin.create",
        json!({
            "token": admin_token,
            "name": "Bo Again",
            "email": "bo@example.com",
            "password": "secret99",
            "employeeId": "ADM-3"
        }),
    );
    assert_eq!(dup["error"]["code"], json!("duplicate_identity"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_ingestion_isolates_bad_entries() {
    let workspace = temp_dir("schoold-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_token = bootstrap_admin(&mut stdin, &mut reader);

    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "auth.registerParent",
        json!({
            "name": "Pat Parent",
            "email": "pat@example.com",
            "password": "secret99",
            "phone": "555-0100",
            "address": "1 Main St",
            "occupation": "engineer",
            "relation": "father"
        }),
    );
    let parent_id = parent["parent"]["id"].as_str().expect("parent id").to_string();

    // Entry 2 reuses entry 1's roll number.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "admin.bulkCreateStudents",
        json!({
            "token": admin_token,
            "students": [
                {
                    "name": "One", "email": "one@example.com", "password": "secret99",
                    "rollNumber": "R-001", "class": "5", "section": "A", "parentId": parent_id
                },
                {
                    "name": "Two", "email": "two@example.com", "password": "secret99",
                    "rollNumber": "R-001", "class": "5", "section": "A", "parentId": parent_id
                },
                {
                    "name": "Three", "email": "three@example.com", "password": "secret99",
                    "rollNumber": "R-003", "class": "5", "section": "A", "parentId": parent_id
                }
            ]
        }),
    );

    let created = result["created"].as_array().expect("created");
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(created.len(), 2);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["data"]["email"], json!("two@example.com"));
    assert!(errors[0]["error"]
        .as_str()
        .expect("error message")
        .contains("roll number"));

    // Both successes are linked to the parent.
    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "pl",
        "auth.login",
        json!({ "email": "pat@example.com", "password": "secret99", "userType": "parent" }),
    );
    let parent_token = profile["token"].as_str().expect("token").to_string();
    let me = request_ok(
        &mut stdin,
        &mut reader,
        "pg",
        "auth.profileGet",
        json!({ "token": parent_token }),
    );
    assert_eq!(me["user"]["children"].as_array().map(|a| a.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn dashboard_counts_follow_registrations() {
    let workspace = temp_dir("schoold-dashboard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_token = bootstrap_admin(&mut stdin, &mut reader);

    let parent = request_ok(
        &mut stdin,
        &mut reader,
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
    for (rid, email, roll, section) in [
        ("s1", "one@example.com", "R-001", "A"),
        ("s2", "two@example.com", "R-002", "A"),
        ("s3", "three@example.com", "R-003", "B"),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            rid,
            "auth.registerStudent",
            json!({
                "name": "Kid",
                "email": email,
                "password": "secret99",
                "rollNumber": roll,
                "class": "5",
                "section": section,
                "parentId": parent_id
            }),
        );
    }

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "ds",
        "admin.dashboardStats",
        json!({ "token": admin_token }),
    );
    let overview = &stats["stats"]["overview"];
    assert_eq!(overview["totalStudents"], json!(3));
    assert_eq!(overview["activeStudents"], json!(3));
    assert_eq!(overview["totalParents"], json!(1));
    assert_eq!(
        stats["stats"]["classStats"],
        json!([
            { "class": "5", "section": "A", "count": 2 },
            { "class": "5", "section": "B", "count": 1 }
        ])
    );
    assert_eq!(stats["stats"]["recentRegistrations"]["students"], json!(3));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn settings_store_merges_validated_patches() {
    let workspace = temp_dir("schoold-settings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_token = bootstrap_admin(&mut stdin, &mut reader);

    // Defaults are seeded on a fresh workspace.
    let initial = request_ok(
        &mut stdin,
        &mut reader,
        "sg",
        "admin.settingsGet",
        json!({ "token": admin_token }),
    );
    assert_eq!(
        initial["settings"]["general"]["attendanceRequirement"],
        json!(75)
    );
    assert_eq!(
        initial["settings"]["notifications"]["emailEnabled"],
        json!(true)
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "su",
        "admin.settingsUpdate",
        json!({
            "token": admin_token,
            "section": "general",
            "patch": { "schoolName": "Northside", "attendanceRequirement": 80 }
        }),
    );
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "sg2",
        "admin.settingsGet",
        json!({ "token": admin_token }),
    );
    assert_eq!(after["settings"]["general"]["schoolName"], json!("Northside"));
    assert_eq!(after["settings"]["general"]["attendanceRequirement"], json!(80));
    // Untouched fields survive the merge.
    assert_eq!(after["settings"]["general"]["academicYear"], json!("2024-25"));

    let bad = request_raw(
        &mut stdin,
        &mut reader,
        "su2",
        "admin.settingsUpdate",
        json!({
            "token": admin_token,
            "section": "general",
            "patch": { "mascot": "owl" }
        }),
    );
    assert_eq!(bad["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
