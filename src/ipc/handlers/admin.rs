use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::handlers::auth;
use crate::ipc::types::{AppState, Request};
use crate::principal::{self, Role};
use crate::session;

const DEFAULT_PERMISSIONS: [&str; 3] = ["manage_users", "manage_timetables", "view_reports"];
const BULK_MAX_ENTRIES: usize = 1000;
const DEFAULT_PAGE_LIMIT: u64 = 10;
const RECENT_REGISTRATION_DAYS: i64 = 30;

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = auth::get_required_str(params, "email")?.to_lowercase();
    let password = auth::raw_password(params)?;

    let cred = principal::find_credential_by_email(conn, Role::Admin, &email)
        .map_err(HandlerErr::db_query)?;
    let Some(cred) = cred else {
        return Err(HandlerErr::new("invalid_credentials", "invalid credentials"));
    };
    if !session::check_password(&password, &cred.password_hash) {
        return Err(HandlerErr::new("invalid_credentials", "invalid credentials"));
    }
    if !cred.active {
        return Err(HandlerErr::new(
            "account_deactivated",
            "account is deactivated",
        ));
    }

    conn.execute(
        "UPDATE admins SET last_login = ? WHERE id = ?",
        (Utc::now().to_rfc3339(), &cred.id),
    )
    .map_err(HandlerErr::db_update)?;

    let secret = db::token_secret(conn).map_err(HandlerErr::db_query)?;
    let token = session::issue_token(&secret, &cred.id, Role::Admin);

    let user = conn
        .query_row(
            "SELECT id, name, email, employee_id, permissions FROM admins WHERE id = ?",
            [&cred.id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "employeeId": r.get::<_, String>(3)?,
                    "permissions": auth::json_column(&r.get::<_, String>(4)?),
                    "userType": "admin",
                }))
            },
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "token": token, "user": user }))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM admins", [], |r| r.get(0))
        .map_err(HandlerErr::db_query)?;
    // The very first admin bootstraps without credentials; afterwards
    // creation is admin-only.
    if admin_count > 0 {
        let requester = gate::authenticate(conn, params)?;
        gate::require_role(&requester, &[Role::Admin])?;
    }

    let name = auth::get_required_str(params, "name")?;
    let email = auth::get_required_str(params, "email")?.to_lowercase();
    let password = auth::required_password(params)?;
    let employee_id = auth::get_required_str(params, "employeeId")?;
    let phone = auth::get_opt_str(params, "phone");
    let address = auth::get_opt_str(params, "address");
    let permissions: Vec<String> = match params.get("permissions").and_then(|v| v.as_array()) {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        None => DEFAULT_PERMISSIONS.iter().map(|s| s.to_string()).collect(),
    };

    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM admins WHERE email = ? OR employee_id = ?",
            (&email, &employee_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "duplicate_identity",
            "admin already exists with this email or employee ID",
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO admins(id, name, email, password_hash, employee_id, phone, address,
                            permissions, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &name,
            &email,
            session::hash_password(&password),
            &employee_id,
            &phone,
            &address,
            serde_json::to_string(&permissions).unwrap_or_else(|_| "[]".into()),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new(
                "duplicate_identity",
                "admin already exists with this email or employee ID",
            )
        } else {
            HandlerErr::db_update(e)
        }
    })?;

    Ok(json!({
        "admin": {
            "id": id,
            "name": name,
            "email": email,
            "employeeId": employee_id,
            "permissions": permissions,
        }
    }))
}

fn dashboard_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;

    let count = |sql: &str| -> Result<i64, HandlerErr> {
        conn.query_row(sql, [], |r| r.get(0))
            .map_err(HandlerErr::db_query)
    };
    let overview = json!({
        "totalStudents": count("SELECT COUNT(*) FROM students")?,
        "totalTeachers": count("SELECT COUNT(*) FROM teachers")?,
        "totalParents": count("SELECT COUNT(*) FROM parents")?,
        "activeStudents": count("SELECT COUNT(*) FROM students WHERE active = 1")?,
        "activeTeachers": count("SELECT COUNT(*) FROM teachers WHERE active = 1")?,
        "activeParents": count("SELECT COUNT(*) FROM parents WHERE active = 1")?,
    });

    let mut stmt = conn
        .prepare(
            "SELECT class, section, COUNT(*) FROM students
             WHERE active = 1
             GROUP BY class, section
             ORDER BY class, section",
        )
        .map_err(HandlerErr::db_query)?;
    let class_stats = stmt
        .query_map([], |r| {
            Ok(json!({
                "class": r.get::<_, String>(0)?,
                "section": r.get::<_, String>(1)?,
                "count": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let cutoff = (Utc::now() - Duration::days(RECENT_REGISTRATION_DAYS)).to_rfc3339();
    let recent = |table: &str| -> Result<i64, HandlerErr> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE created_at >= ?", table);
        conn.query_row(&sql, [&cutoff], |r| r.get(0))
            .map_err(HandlerErr::db_query)
    };

    Ok(json!({
        "stats": {
            "overview": overview,
            "classStats": class_stats,
            "recentRegistrations": {
                "students": recent("students")?,
                "teachers": recent("teachers")?,
                "parents": recent("parents")?,
            }
        }
    }))
}

// Same accumulator shape as attendance.take: one bad entry never aborts
// the batch, and errors keep input order.
fn bulk_create_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;

    let Some(entries) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("students must be an array"));
    };
    if entries.len() > BULK_MAX_ENTRIES {
        return Err(HandlerErr::with_details(
            "bad_params",
            format!("too many entries (max {})", BULK_MAX_ENTRIES),
            json!({ "max": BULK_MAX_ENTRIES }),
        ));
    }

    let mut created: Vec<serde_json::Value> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for entry in entries {
        let outcome = auth::parse_new_student(entry)
            .and_then(|new| auth::create_student(conn, &new).map(|id| (id, new)));
        match outcome {
            Ok((id, new)) => created.push(json!({
                "id": id,
                "name": new.name,
                "rollNumber": new.roll_number,
            })),
            Err(e) => {
                warn!(error = %e.message, "bulk student entry rejected");
                errors.push(json!({ "data": entry, "error": e.message }));
            }
        }
    }

    Ok(json!({ "created": created, "errors": errors }))
}

fn page_params(params: &serde_json::Value) -> (u64, u64) {
    let page = params.get("page").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, 100);
    (page, limit)
}

fn list_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;
    let (page, limit) = page_params(params);

    let mut where_clause = String::from("WHERE active = 1");
    let mut binds: Vec<String> = Vec::new();
    if let Some(class) = params.get("class").and_then(|v| v.as_str()) {
        where_clause.push_str(" AND class = ?");
        binds.push(class.to_string());
    }
    if let Some(section) = params.get("section").and_then(|v| v.as_str()) {
        where_clause.push_str(" AND section = ?");
        binds.push(section.to_string());
    }

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM students {}", where_clause),
            rusqlite::params_from_iter(binds.iter()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let sql = format!(
        "SELECT id, name, email, roll_number, class, section, parent_id, active
         FROM students {} ORDER BY name LIMIT {} OFFSET {}",
        where_clause,
        limit,
        (page - 1) * limit
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "rollNumber": r.get::<_, String>(3)?,
                "class": r.get::<_, String>(4)?,
                "section": r.get::<_, String>(5)?,
                "parentId": r.get::<_, String>(6)?,
                "isActive": r.get::<_, i64>(7)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "students": students,
        "totalPages": (total as u64).div_ceil(limit),
        "currentPage": page,
        "total": total,
    }))
}

fn list_teachers(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;
    let (page, limit) = page_params(params);

    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM teachers WHERE active = 1", [], |r| {
            r.get(0)
        })
        .map_err(HandlerErr::db_query)?;

    let sql = format!(
        "SELECT id, name, email, employee_id, subjects, assigned_classes, active
         FROM teachers WHERE active = 1 ORDER BY name LIMIT {} OFFSET {}",
        limit,
        (page - 1) * limit
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "employeeId": r.get::<_, String>(3)?,
                "subjects": auth::json_column(&r.get::<_, String>(4)?),
                "assignedClasses": auth::json_column(&r.get::<_, String>(5)?),
                "isActive": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "teachers": teachers,
        "totalPages": (total as u64).div_ceil(limit),
        "currentPage": page,
        "total": total,
    }))
}

fn list_parents(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;
    let (page, limit) = page_params(params);

    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM parents WHERE active = 1", [], |r| {
            r.get(0)
        })
        .map_err(HandlerErr::db_query)?;

    let sql = format!(
        "SELECT id, name, email, phone, relation, children, active
         FROM parents WHERE active = 1 ORDER BY name LIMIT {} OFFSET {}",
        limit,
        (page - 1) * limit
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let parents = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "phone": r.get::<_, String>(3)?,
                "relation": r.get::<_, String>(4)?,
                "childrenIds": auth::json_column(&r.get::<_, String>(5)?),
                "isActive": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "parents": parents,
        "totalPages": (total as u64).div_ceil(limit),
        "currentPage": page,
        "total": total,
    }))
}

const WEEK_DAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

// Known settings sections and their field validation; unknown fields are
// rejected so the enumerated-keys contract holds.
fn merge_settings_patch(
    section: &str,
    current: &mut serde_json::Value,
    patch: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), String> {
    let Some(obj) = current.as_object_mut() else {
        return Err("stored settings are not an object".to_string());
    };
    for (key, value) in patch {
        match (section, key.as_str()) {
            ("general", "schoolName") | ("general", "academicYear") => {
                let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(format!("{} must be a non-empty string", key));
                };
                obj.insert(key.clone(), json!(s));
            }
            ("general", "workingDays") => {
                let Some(days) = value.as_array() else {
                    return Err("workingDays must be an array".to_string());
                };
                for day in days {
                    let Some(name) = day.as_str() else {
                        return Err("workingDays entries must be strings".to_string());
                    };
                    if !WEEK_DAYS.contains(&name) {
                        return Err(format!("unknown working day: {}", name));
                    }
                }
                obj.insert(key.clone(), value.clone());
            }
            ("general", "attendanceRequirement") => {
                let Some(n) = value.as_u64().filter(|n| *n <= 100) else {
                    return Err("attendanceRequirement must be 0-100".to_string());
                };
                obj.insert(key.clone(), json!(n));
            }
            ("general", "maxAbsences") => {
                let Some(n) = value.as_u64() else {
                    return Err("maxAbsences must be a non-negative number".to_string());
                };
                obj.insert(key.clone(), json!(n));
            }
            (
                "notifications",
                "emailEnabled" | "smsEnabled" | "parentNotifications" | "teacherNotifications",
            ) => {
                let Some(flag) = value.as_bool() else {
                    return Err(format!("{} must be a boolean", key));
                };
                obj.insert(key.clone(), json!(flag));
            }
            _ => return Err(format!("unknown {} field: {}", section, key)),
        }
    }
    Ok(())
}

fn settings_key(section: &str) -> Option<&'static str> {
    match section {
        "general" => Some("school.general"),
        "notifications" => Some("school.notifications"),
        _ => None,
    }
}

fn settings_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;

    let general = db::settings_get_json(conn, "school.general")
        .map_err(HandlerErr::db_query)?
        .unwrap_or_else(|| json!({}));
    let notifications = db::settings_get_json(conn, "school.notifications")
        .map_err(HandlerErr::db_query)?
        .unwrap_or_else(|| json!({}));

    Ok(json!({
        "settings": {
            "general": general,
            "notifications": notifications,
        }
    }))
}

fn settings_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Admin])?;

    let section = auth::get_required_str(params, "section")?;
    let Some(key) = settings_key(&section) else {
        return Err(HandlerErr::bad_params("unknown settings section"));
    };
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = db::settings_get_json(conn, key)
        .map_err(HandlerErr::db_query)?
        .unwrap_or_else(|| json!({}));
    if let Err(msg) = merge_settings_patch(&section, &mut current, patch) {
        return Err(HandlerErr::bad_params(msg));
    }
    db::settings_set_json(conn, key, &current).map_err(HandlerErr::db_update)?;

    let mut settings = serde_json::Map::new();
    settings.insert(section, current);
    Ok(json!({ "settings": settings }))
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
        "admin.login" => Some(with_db(state, req, login)),
        "admin.create" => Some(with_db(state, req, create)),
        "admin.dashboardStats" => Some(with_db(state, req, dashboard_stats)),
        "admin.bulkCreateStudents" => Some(with_db(state, req, bulk_create_students)),
        "admin.listStudents" => Some(with_db(state, req, list_students)),
        "admin.listTeachers" => Some(with_db(state, req, list_teachers)),
        "admin.listParents" => Some(with_db(state, req, list_parents)),
        "admin.settingsGet" => Some(with_db(state, req, settings_get)),
        "admin.settingsUpdate" => Some(with_db(state, req, settings_update)),
        _ => None,
    }
}
