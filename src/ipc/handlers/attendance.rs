use chrono::NaiveDate;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, AbsenceAlert};
use crate::principal::Role;

const TAKE_MAX_ENTRIES: usize = 500;
const DEFAULT_PERIOD: i64 = 1;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

struct ClassInfo {
    class: String,
    section: String,
    subject: String,
    date: NaiveDate,
    period: i64,
}

fn parse_class_info(params: &serde_json::Value) -> Result<ClassInfo, HandlerErr> {
    let Some(info) = params.get("classInfo") else {
        return Err(HandlerErr::bad_params(
            "class information (class, section, subject, date) is required",
        ));
    };
    let class = get_required_str(info, "class")?;
    let section = get_required_str(info, "section")?;
    let subject = get_required_str(info, "subject")?;
    let date_raw = get_required_str(info, "date")?;
    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    let period = match info.get("period") {
        None | Some(serde_json::Value::Null) => DEFAULT_PERIOD,
        Some(v) => {
            let p = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params("period must be a number"))?;
            if p < 1 {
                return Err(HandlerErr::bad_params("period must be >= 1"));
            }
            p
        }
    };
    Ok(ClassInfo {
        class,
        section,
        subject,
        date,
        period,
    })
}

struct EntryOutcome {
    student_id: String,
    status: String,
}

// Upsert on the natural key (student, date, period, subject). The UNIQUE
// index makes concurrent duplicate recordings serialize into one winner.
fn upsert_record(
    conn: &Connection,
    teacher_id: &str,
    info: &ClassInfo,
    student_id: &str,
    status: &str,
    remarks: &str,
) -> Result<(), HandlerErr> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO attendance(id, student_id, teacher_id, class, section, subject,
                                date, period, status, remarks, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date, period, subject) DO UPDATE SET
           status = excluded.status,
           remarks = excluded.remarks,
           teacher_id = excluded.teacher_id,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            teacher_id,
            &info.class,
            &info.section,
            &info.subject,
            info.date.format("%Y-%m-%d").to_string(),
            info.period,
            status,
            remarks,
            &now,
            &now,
        ),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(())
}

fn process_entry(
    conn: &Connection,
    teacher_id: &str,
    info: &ClassInfo,
    entry: &serde_json::Value,
) -> Result<EntryOutcome, String> {
    let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
        return Err("student ID and status are required".to_string());
    };
    let Some(status) = entry.get("status").and_then(|v| v.as_str()) else {
        return Err("student ID and status are required".to_string());
    };
    if status != "present" && status != "absent" {
        return Err("status must be present or absent".to_string());
    }
    let remarks = entry
        .get("remarks")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let student_exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| e.to_string())?
        .is_some();
    if !student_exists {
        return Err("student not found".to_string());
    }

    upsert_record(conn, teacher_id, info, student_id, status, remarks)
        .map_err(|e| e.message)?;

    Ok(EntryOutcome {
        student_id: student_id.to_string(),
        status: status.to_string(),
    })
}

// Delivery failures are logged and swallowed; the attendance write has
// already succeeded and must stay that way.
fn dispatch_absence_alert(conn: &Connection, info: &ClassInfo, student_id: &str) {
    let student = conn
        .query_row(
            "SELECT s.name, s.roll_number, p.name, p.email, p.phone
             FROM students s JOIN parents p ON p.id = s.parent_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional();
    match student {
        Ok(Some((student_name, roll, parent_name, parent_email, parent_phone))) => {
            let alert = AbsenceAlert {
                student_name: &student_name,
                student_roll: &roll,
                parent_name: &parent_name,
                parent_email: &parent_email,
                parent_phone: parent_phone.as_deref(),
                class: &info.class,
                section: &info.section,
                subject: &info.subject,
                date: info.date,
                period: info.period,
            };
            if let Err(e) = notify::send_absence_alert(conn, &alert) {
                warn!(student = student_id, error = %e, "absence alert delivery failed");
            }
        }
        Ok(None) => warn!(student = student_id, "absence alert skipped: no parent link"),
        Err(e) => warn!(student = student_id, error = %e, "absence alert lookup failed"),
    }
}

fn take(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = gate::authenticate(conn, params)?;
    gate::require_role(&teacher, &[Role::Teacher])?;

    let info = parse_class_info(params)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(
            "attendance entries are required and must be a non-empty array",
        ));
    };
    if entries.is_empty() {
        return Err(HandlerErr::bad_params(
            "attendance entries are required and must be a non-empty array",
        ));
    }
    if entries.len() > TAKE_MAX_ENTRIES {
        return Err(HandlerErr::with_details(
            "bad_params",
            format!("too many entries (max {})", TAKE_MAX_ENTRIES),
            json!({ "max": TAKE_MAX_ENTRIES }),
        ));
    }

    // Per-entry isolation: one bad entry never aborts the batch, and
    // failures keep input order.
    let mut processed: Vec<serde_json::Value> = Vec::new();
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for entry in entries {
        match process_entry(conn, &teacher.id, &info, entry) {
            Ok(outcome) => {
                if outcome.status == "absent" {
                    dispatch_absence_alert(conn, &info, &outcome.student_id);
                }
                processed.push(json!({
                    "studentId": outcome.student_id,
                    "status": outcome.status,
                }));
            }
            Err(message) => {
                warn!(error = %message, "attendance entry rejected");
                failures.push(json!({
                    "studentId": entry.get("studentId").cloned().unwrap_or(serde_json::Value::Null),
                    "error": message,
                }));
            }
        }
    }

    if processed.is_empty() && !failures.is_empty() {
        return Err(HandlerErr::with_details(
            "validation_failed",
            "failed to record any attendance",
            json!({ "failures": failures }),
        ));
    }

    Ok(json!({
        "processed": processed.len(),
        "records": processed,
        "failures": failures,
    }))
}

fn students_by_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = gate::authenticate(conn, params)?;
    gate::require_role(&teacher, &[Role::Teacher])?;

    let class = get_required_str(params, "class")?;
    let section = get_required_str(params, "section")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, roll_number, email, class, section
             FROM students
             WHERE class = ? AND section = ? AND active = 1
             ORDER BY roll_number",
        )
        .map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map((&class, &section), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rollNumber": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "class": r.get::<_, String>(4)?,
                "section": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "students": students, "count": students.len() }))
}

fn month_range(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

fn record_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "teacherId": r.get::<_, String>(2)?,
        "class": r.get::<_, String>(3)?,
        "section": r.get::<_, String>(4)?,
        "subject": r.get::<_, String>(5)?,
        "date": r.get::<_, String>(6)?,
        "period": r.get::<_, i64>(7)?,
        "status": r.get::<_, String>(8)?,
        "remarks": r.get::<_, String>(9)?,
        "teacherName": r.get::<_, Option<String>>(10)?,
    }))
}

fn student_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;

    // Readers: the student themselves, a parent of the student, any
    // teacher or admin.
    match requester.role {
        Role::Student => {
            if requester.id != student_id {
                return Err(HandlerErr::forbidden("students may only view their own attendance"));
            }
        }
        Role::Parent => {
            let owns: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM students WHERE id = ? AND parent_id = ?",
                    (&student_id, &requester.id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            if owns.is_none() {
                return Err(HandlerErr::forbidden("parents may only view their own children"));
            }
        }
        Role::Teacher | Role::Admin => {}
    }

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    let month = params.get("month").and_then(|v| v.as_u64());
    let year = params.get("year").and_then(|v| v.as_i64());
    let range = match (month, year) {
        (Some(m), Some(y)) => {
            let m = u32::try_from(m)
                .ok()
                .filter(|m| (1..=12).contains(m))
                .ok_or_else(|| HandlerErr::bad_params("month must be between 1 and 12"))?;
            Some(
                month_range(y as i32, m)
                    .ok_or_else(|| HandlerErr::bad_params("invalid month/year"))?,
            )
        }
        _ => None,
    };

    let base = "SELECT a.id, a.student_id, a.teacher_id, a.class, a.section, a.subject,
                       a.date, a.period, a.status, a.remarks, t.name
                FROM attendance a LEFT JOIN teachers t ON t.id = a.teacher_id
                WHERE a.student_id = ?";
    let records = match &range {
        Some((start, end)) => {
            let sql = format!("{} AND a.date >= ? AND a.date <= ? ORDER BY a.date DESC, a.period", base);
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
            stmt.query_map(
                (
                    &student_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ),
                |r| record_json(r),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?
        }
        None => {
            let sql = format!("{} ORDER BY a.date DESC, a.period", base);
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
            stmt.query_map([&student_id], |r| record_json(r))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?
        }
    };

    let total = records.len() as i64;
    let present = records
        .iter()
        .filter(|r| r.get("status").and_then(|v| v.as_str()) == Some("present"))
        .count() as i64;
    let absent = total - present;
    let percentage = if total > 0 {
        ((present as f64 / total as f64) * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };

    Ok(json!({
        "attendance": records,
        "statistics": {
            "totalClasses": total,
            "presentClasses": present,
            "absentClasses": absent,
            "attendancePercentage": percentage,
        }
    }))
}

fn report(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = gate::authenticate(conn, params)?;
    gate::require_role(&teacher, &[Role::Teacher])?;

    let mut sql = String::from(
        "SELECT a.id, a.student_id, a.teacher_id, a.class, a.section, a.subject,
                a.date, a.period, a.status, a.remarks, s.name
         FROM attendance a LEFT JOIN students s ON s.id = a.student_id
         WHERE a.teacher_id = ?",
    );
    let mut binds: Vec<String> = vec![teacher.id.clone()];

    for (key, column) in [("class", "a.class"), ("section", "a.section"), ("subject", "a.subject")] {
        if let Some(v) = params.get(key).and_then(|v| v.as_str()) {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(v.to_string());
        }
    }
    if let Some(date_raw) = params.get("date").and_then(|v| v.as_str()) {
        let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d")
            .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
        sql.push_str(" AND a.date = ?");
        binds.push(date.format("%Y-%m-%d").to_string());
    }
    sql.push_str(" ORDER BY a.date DESC, a.period");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, String>(2)?,
                "class": r.get::<_, String>(3)?,
                "section": r.get::<_, String>(4)?,
                "subject": r.get::<_, String>(5)?,
                "date": r.get::<_, String>(6)?,
                "period": r.get::<_, i64>(7)?,
                "status": r.get::<_, String>(8)?,
                "remarks": r.get::<_, String>(9)?,
                "studentName": r.get::<_, Option<String>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "records": records, "totalRecords": records.len() }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.take" => Some(with_db(state, req, take)),
        "attendance.studentsByClass" => Some(with_db(state, req, students_by_class)),
        "attendance.studentHistory" => Some(with_db(state, req, student_history)),
        "attendance.report" => Some(with_db(state, req, report)),
        _ => None,
    }
}
