use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::types::{AppState, Request};
use crate::principal::Role;

const WEEK_DAYS: [&str; 6] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn validate_schedule(v: &serde_json::Value) -> Result<(), HandlerErr> {
    let Some(days) = v.as_array() else {
        return Err(HandlerErr::bad_params("schedule must be an array"));
    };
    for day in days {
        let Some(name) = day.get("day").and_then(|x| x.as_str()) else {
            return Err(HandlerErr::bad_params("schedule entries need a day"));
        };
        if !WEEK_DAYS.contains(&name) {
            return Err(HandlerErr::with_details(
                "bad_params",
                "day must be Monday through Saturday",
                json!({ "day": name }),
            ));
        }
        let Some(periods) = day.get("periods").and_then(|x| x.as_array()) else {
            return Err(HandlerErr::bad_params("schedule entries need a periods array"));
        };
        for p in periods {
            if p.get("period").and_then(|x| x.as_i64()).is_none() {
                return Err(HandlerErr::bad_params("periods need a numeric period"));
            }
            if p.get("subject").and_then(|x| x.as_str()).is_none() {
                return Err(HandlerErr::bad_params("periods need a subject"));
            }
        }
    }
    Ok(())
}

fn validate_holidays(v: &serde_json::Value) -> Result<(), HandlerErr> {
    let Some(entries) = v.as_array() else {
        return Err(HandlerErr::bad_params("holidays must be an array"));
    };
    for h in entries {
        let Some(date) = h.get("date").and_then(|x| x.as_str()) else {
            return Err(HandlerErr::bad_params("holidays need a date"));
        };
        if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::bad_params("holiday date must be YYYY-MM-DD"));
        }
    }
    Ok(())
}

fn timetable_json(
    conn: &Connection,
    class: &str,
    section: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT schedule, holidays, updated_at FROM timetables WHERE class = ? AND section = ?",
        (class, section),
        |r| {
            let schedule: String = r.get(0)?;
            let holidays: String = r.get(1)?;
            Ok(json!({
                "class": class,
                "section": section,
                "schedule": serde_json::from_str::<serde_json::Value>(&schedule)
                    .unwrap_or_else(|_| json!([])),
                "holidays": serde_json::from_str::<serde_json::Value>(&holidays)
                    .unwrap_or_else(|_| json!([])),
                "updatedAt": r.get::<_, String>(2)?,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    gate::authenticate(conn, params)?;
    let class = get_required_str(params, "class")?;
    let section = get_required_str(params, "section")?;
    let timetable = timetable_json(conn, &class, &section)?
        .ok_or_else(|| HandlerErr::not_found("timetable not found"))?;
    Ok(json!({ "timetable": timetable }))
}

// Merge-or-replace: only the supplied fields change; an absent field
// keeps whatever the stored row has.
fn upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin = gate::authenticate(conn, params)?;
    gate::require_role(&admin, &[Role::Admin])?;

    let class = get_required_str(params, "class")?;
    let section = get_required_str(params, "section")?;

    let schedule = match params.get("schedule") {
        Some(v) if !v.is_null() => {
            validate_schedule(v)?;
            Some(v.to_string())
        }
        _ => None,
    };
    let holidays = match params.get("holidays") {
        Some(v) if !v.is_null() => {
            validate_holidays(v)?;
            Some(v.to_string())
        }
        _ => None,
    };

    let now = Utc::now().to_rfc3339();
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM timetables WHERE class = ? AND section = ?",
            (&class, &section),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    if exists.is_some() {
        // NULL binds leave the stored field untouched.
        conn.execute(
            "UPDATE timetables SET
               schedule = COALESCE(?, schedule),
               holidays = COALESCE(?, holidays),
               updated_at = ?
             WHERE class = ? AND section = ?",
            (&schedule, &holidays, &now, &class, &section),
        )
        .map_err(HandlerErr::db_update)?;
    } else {
        conn.execute(
            "INSERT INTO timetables(class, section, schedule, holidays, updated_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                &class,
                &section,
                schedule.as_deref().unwrap_or("[]"),
                holidays.as_deref().unwrap_or("[]"),
                &now,
            ),
        )
        .map_err(HandlerErr::db_update)?;
    }

    let timetable = timetable_json(conn, &class, &section)?
        .ok_or_else(|| HandlerErr::db_update("timetable upsert did not persist"))?;
    Ok(json!({ "timetable": timetable }))
}

fn holidays(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    gate::authenticate(conn, params)?;
    let class = get_required_str(params, "class")?;
    let section = get_required_str(params, "section")?;

    // Missing timetable means no holidays, never an error.
    let holidays = timetable_json(conn, &class, &section)?
        .and_then(|t| t.get("holidays").cloned())
        .unwrap_or_else(|| json!([]));
    Ok(json!({ "holidays": holidays }))
}

fn teacher_classes(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = gate::authenticate(conn, params)?;
    gate::require_role(&teacher, &[Role::Teacher])?;

    let (assigned, subjects, employee_id): (String, String, String) = conn
        .query_row(
            "SELECT assigned_classes, subjects, employee_id FROM teachers WHERE id = ?",
            [&teacher.id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "assignedClasses": serde_json::from_str::<serde_json::Value>(&assigned)
            .unwrap_or_else(|_| json!([])),
        "teacherInfo": {
            "name": teacher.name,
            "employeeId": employee_id,
            "subjects": serde_json::from_str::<serde_json::Value>(&subjects)
                .unwrap_or_else(|_| json!([])),
        }
    }))
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
        "timetable.get" => Some(with_db(state, req, get)),
        "timetable.upsert" => Some(with_db(state, req, upsert)),
        "timetable.holidays" => Some(with_db(state, req, holidays)),
        "timetable.teacherClasses" => Some(with_db(state, req, teacher_classes)),
        _ => None,
    }
}
