use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::types::{AppState, Request};
use crate::principal::{Principal, Role};

const PARENT_WINDOW_DAYS: i64 = 7;
const STUDENT_WINDOW_DAYS: i64 = 7;
const TEACHER_WINDOW_DAYS: i64 = 3;
const ALERTS_PER_CHILD: usize = 5;
const STUDENT_RECENT_LIMIT: usize = 10;
const DEFAULT_PAGE_LIMIT: u64 = 10;

fn priority_rank(priority: &str) -> i64 {
    match priority {
        "high" => 3,
        "medium" => 2,
        _ => 1,
    }
}

fn day_cutoff(days_back: i64) -> String {
    (Utc::now() - Duration::days(days_back))
        .format("%Y-%m-%d")
        .to_string()
}

struct AbsentRecord {
    id: String,
    subject: String,
    class: String,
    section: String,
    date: String,
    period: i64,
    status: String,
    teacher_name: Option<String>,
}

fn recent_records(
    conn: &Connection,
    student_id: &str,
    cutoff: &str,
    absent_only: bool,
    limit: usize,
) -> Result<Vec<AbsentRecord>, HandlerErr> {
    let sql = format!(
        "SELECT a.id, a.subject, a.class, a.section, a.date, a.period, a.status, t.name
         FROM attendance a LEFT JOIN teachers t ON t.id = a.teacher_id
         WHERE a.student_id = ? AND a.date >= ?{}
         ORDER BY a.date DESC, a.period
         LIMIT {}",
        if absent_only { " AND a.status = 'absent'" } else { "" },
        limit
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    stmt.query_map((student_id, cutoff), |r| {
        Ok(AbsentRecord {
            id: r.get(0)?,
            subject: r.get(1)?,
            class: r.get(2)?,
            section: r.get(3)?,
            date: r.get(4)?,
            period: r.get(5)?,
            status: r.get(6)?,
            teacher_name: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn parent_feed(conn: &Connection, parent: &Principal) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let cutoff = day_cutoff(PARENT_WINDOW_DAYS);
    let mut stmt = conn
        .prepare("SELECT id, name FROM students WHERE parent_id = ?")
        .map_err(HandlerErr::db_query)?;
    let children = stmt
        .query_map([&parent.id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut notifications = Vec::new();
    for (child_id, child_name) in &children {
        for rec in recent_records(conn, child_id, &cutoff, true, ALERTS_PER_CHILD)? {
            notifications.push(json!({
                "id": rec.id,
                "type": "attendance_alert",
                "title": "Attendance Alert",
                "message": format!(
                    "{} was absent in {} class on {}",
                    child_name, rec.subject, rec.date
                ),
                "data": {
                    "studentName": child_name,
                    "subject": rec.subject,
                    "date": rec.date,
                    "teacher": rec.teacher_name,
                    "class": rec.class,
                    "section": rec.section,
                },
                "date": rec.date,
                "read": false,
                "priority": "medium",
            }));
        }
    }

    let total_absences = notifications.len();
    if total_absences > 0 {
        notifications.insert(
            0,
            json!({
                "id": format!("parent_summary_{}", parent.id),
                "type": "attendance_summary",
                "title": "Weekly Attendance Summary",
                "message": format!("Your children have {} absence(s) this week", total_absences),
                "data": {
                    "totalAbsences": total_absences,
                    "childrenCount": children.len(),
                    "weekPeriod": format!("{} days", PARENT_WINDOW_DAYS),
                },
                "date": Utc::now().to_rfc3339(),
                "read": false,
                "priority": if total_absences > 3 { "high" } else { "medium" },
            }),
        );
    }
    Ok(notifications)
}

fn student_feed(
    conn: &Connection,
    student: &Principal,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let cutoff = day_cutoff(STUDENT_WINDOW_DAYS);
    let recent = recent_records(conn, &student.id, &cutoff, false, STUDENT_RECENT_LIMIT)?;

    let mut notifications = Vec::new();
    let absent: Vec<&AbsentRecord> = recent.iter().filter(|r| r.status == "absent").collect();
    let present_count = recent.len() - absent.len();

    if !recent.is_empty() {
        let percentage =
            ((present_count as f64 / recent.len() as f64) * 100.0).round() as i64;
        let priority = if percentage < 75 {
            "high"
        } else if !absent.is_empty() {
            "medium"
        } else {
            "low"
        };
        notifications.push(json!({
            "id": format!("student_summary_{}", student.id),
            "type": "attendance_summary",
            "title": "Weekly Attendance Summary",
            "message": format!(
                "Your attendance: {}% ({} present, {} absent)",
                percentage, present_count, absent.len()
            ),
            "data": {
                "absentCount": absent.len(),
                "presentCount": present_count,
                "totalClasses": recent.len(),
                "attendancePercentage": percentage,
            },
            "date": Utc::now().to_rfc3339(),
            "read": false,
            "priority": priority,
        }));
    }

    for rec in absent {
        notifications.push(json!({
            "id": rec.id,
            "type": "attendance_alert",
            "title": "Absence Recorded",
            "message": format!("You were absent in {} class on {}", rec.subject, rec.date),
            "data": {
                "subject": rec.subject,
                "date": rec.date,
                "teacher": rec.teacher_name,
                "class": rec.class,
                "section": rec.section,
                "period": rec.period,
            },
            "date": rec.date,
            "read": false,
            "priority": "medium",
        }));
    }
    Ok(notifications)
}

fn teacher_feed(
    conn: &Connection,
    teacher: &Principal,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let (assigned_raw, subjects_raw): (String, String) = conn
        .query_row(
            "SELECT assigned_classes, subjects FROM teachers WHERE id = ?",
            [&teacher.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db_query)?;
    let assigned: Vec<serde_json::Value> =
        serde_json::from_str(&assigned_raw).unwrap_or_default();
    let subjects: serde_json::Value =
        serde_json::from_str(&subjects_raw).unwrap_or_else(|_| json!([]));

    let mut notifications = Vec::new();
    if !assigned.is_empty() {
        notifications.push(json!({
            "id": format!("teacher_welcome_{}", teacher.id),
            "type": "info",
            "title": "Welcome Teacher",
            "message": format!("You have {} assigned classes", assigned.len()),
            "data": {
                "assignedClasses": assigned.len(),
                "subjects": subjects,
            },
            "date": Utc::now().to_rfc3339(),
            "read": false,
            "priority": "low",
        }));

        let cutoff = day_cutoff(TEACHER_WINDOW_DAYS);
        for entry in &assigned {
            let class = entry.get("class").and_then(|v| v.as_str()).unwrap_or_default();
            let section = entry.get("section").and_then(|v| v.as_str()).unwrap_or_default();
            let subject = entry.get("subject").and_then(|v| v.as_str()).unwrap_or_default();

            let (total, absent_count): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(status = 'absent'), 0)
                     FROM attendance
                     WHERE teacher_id = ? AND class = ? AND section = ? AND subject = ?
                       AND date >= ?",
                    (&teacher.id, class, section, subject, &cutoff),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .map_err(HandlerErr::db_query)?;

            if total > 0 && absent_count > 0 {
                let rate = (((total - absent_count) as f64 / total as f64) * 100.0).round();
                notifications.push(json!({
                    "id": format!("class_attendance_{}_{}_{}", class, section, subject),
                    "type": "class_update",
                    "title": "Class Attendance Update",
                    "message": format!(
                        "{}-{} {}: {} absences in last {} days",
                        class, section, subject, absent_count, TEACHER_WINDOW_DAYS
                    ),
                    "data": {
                        "class": class,
                        "section": section,
                        "subject": subject,
                        "absentCount": absent_count,
                        "totalRecords": total,
                        "attendanceRate": rate,
                        "period": format!("{} days", TEACHER_WINDOW_DAYS),
                    },
                    "date": Utc::now().to_rfc3339(),
                    "read": false,
                    "priority": if absent_count > 5 { "high" } else { "medium" },
                }));
            }
        }
    }

    // Reminder when nothing has been recorded today.
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let today_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance WHERE teacher_id = ? AND date = ?",
            (&teacher.id, &today),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if today_count == 0 && !assigned.is_empty() {
        notifications.push(json!({
            "id": format!("attendance_reminder_{}", teacher.id),
            "type": "reminder",
            "title": "Attendance Reminder",
            "message": "Don't forget to take attendance for your classes today",
            "data": {
                "assignedClasses": assigned,
                "reminderType": "daily_attendance",
            },
            "date": Utc::now().to_rfc3339(),
            "read": false,
            "priority": "medium",
        }));
    }
    Ok(notifications)
}

fn admin_feed(conn: &Connection, admin: &Principal) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
    let mut notifications = Vec::new();

    let count_since = |table: &str| -> Result<i64, HandlerErr> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE created_at >= ?", table);
        conn.query_row(&sql, [&cutoff], |r| r.get(0))
            .map_err(HandlerErr::db_query)
    };
    let new_students = count_since("students")?;
    let new_teachers = count_since("teachers")?;
    let new_parents = count_since("parents")?;
    let total_new = new_students + new_teachers + new_parents;
    if total_new > 0 {
        notifications.push(json!({
            "id": format!("admin_new_users_{}", admin.id),
            "type": "system_update",
            "title": "New User Registrations",
            "message": format!("{} new users registered in the last 24 hours", total_new),
            "data": {
                "newStudents": new_students,
                "newTeachers": new_teachers,
                "newParents": new_parents,
                "totalNewUsers": total_new,
                "period": "24 hours",
            },
            "date": Utc::now().to_rfc3339(),
            "read": false,
            "priority": "low",
        }));
    }

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let today_attendance: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?",
            [&today],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if today_attendance > 0 {
        notifications.push(json!({
            "id": format!("admin_attendance_stats_{}", admin.id),
            "type": "daily_stats",
            "title": "Daily Attendance Statistics",
            "message": format!("{} attendance records created today", today_attendance),
            "data": {
                "totalAttendanceRecords": today_attendance,
                "date": today,
            },
            "date": Utc::now().to_rfc3339(),
            "read": false,
            "priority": "low",
        }));
    }
    Ok(notifications)
}

fn assemble_feed(
    conn: &Connection,
    principal: &Principal,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut notifications = match principal.role {
        Role::Parent => parent_feed(conn, principal)?,
        Role::Student => student_feed(conn, principal)?,
        Role::Teacher => teacher_feed(conn, principal)?,
        Role::Admin => admin_feed(conn, principal)?,
    };

    notifications.sort_by(|a, b| {
        let pa = priority_rank(a.get("priority").and_then(|v| v.as_str()).unwrap_or("low"));
        let pb = priority_rank(b.get("priority").and_then(|v| v.as_str()).unwrap_or("low"));
        pb.cmp(&pa).then_with(|| {
            let da = a.get("date").and_then(|v| v.as_str()).unwrap_or_default();
            let db = b.get("date").and_then(|v| v.as_str()).unwrap_or_default();
            db.cmp(da)
        })
    });
    Ok(notifications)
}

fn summary_block(notifications: &[serde_json::Value]) -> serde_json::Value {
    let mut by_type = serde_json::Map::new();
    let mut high = 0u64;
    let mut medium = 0u64;
    let mut low = 0u64;
    for n in notifications {
        match n.get("priority").and_then(|v| v.as_str()).unwrap_or("low") {
            "high" => high += 1,
            "medium" => medium += 1,
            _ => low += 1,
        }
        let kind = n.get("type").and_then(|v| v.as_str()).unwrap_or("info");
        let counter = by_type.entry(kind.to_string()).or_insert(json!(0));
        *counter = json!(counter.as_u64().unwrap_or(0) + 1);
    }
    json!({
        "total": notifications.len(),
        // The feed is derived fresh each read; nothing is ever persisted
        // as read, so every entry counts as unread.
        "unread": notifications.len(),
        "byPriority": { "high": high, "medium": medium, "low": low },
        "byType": by_type,
    })
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    let page = params.get("page").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, 100);

    let notifications = assemble_feed(conn, &principal)?;
    let total = notifications.len() as u64;
    let total_pages = total.div_ceil(limit);
    let start = ((page - 1) * limit) as usize;
    let pageful: Vec<serde_json::Value> = notifications
        .iter()
        .skip(start)
        .take(limit as usize)
        .cloned()
        .collect();

    Ok(json!({
        "notifications": pageful,
        "pagination": {
            "currentPage": page,
            "totalPages": total_pages,
            "total": total,
            "hasNext": page < total_pages,
            "hasPrev": page > 1,
        },
        "summary": summary_block(&notifications),
    }))
}

// The feed has no backing store, so there is nothing to mark; the ack is
// kept for client parity.
fn mark_read(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    let Some(notification_id) = params.get("notificationId").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing notificationId"));
    };
    tracing::debug!(
        notification = notification_id,
        principal = %principal.id,
        "notification read acknowledged (derived feed, not persisted)"
    );
    Ok(json!({
        "notificationId": notification_id,
        "readAt": Utc::now().to_rfc3339(),
    }))
}

fn summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    let notifications = assemble_feed(conn, &principal)?;
    Ok(json!({ "summary": summary_block(&notifications) }))
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
        "notifications.list" => Some(with_db(state, req, list)),
        "notifications.markRead" => Some(with_db(state, req, mark_read)),
        "notifications.summary" => Some(with_db(state, req, summary)),
        _ => None,
    }
}
