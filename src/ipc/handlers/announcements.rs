use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::types::{AppState, Request};
use crate::principal::{self, Principal, Role};

const PRIORITIES: [&str; 3] = ["low", "medium", "high"];
const AUDIENCES: [&str; 4] = ["all", "students", "parents", "teachers"];
const DEFAULT_PAGE_LIMIT: u64 = 10;
const MAX_PAGE_LIMIT: u64 = 100;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn validate_priority(raw: &str) -> Result<(), HandlerErr> {
    if PRIORITIES.contains(&raw) {
        Ok(())
    } else {
        Err(HandlerErr::bad_params(
            "priority must be low, medium, or high",
        ))
    }
}

fn validate_audience(raw: &str) -> Result<(), HandlerErr> {
    if AUDIENCES.contains(&raw) {
        Ok(())
    } else {
        Err(HandlerErr::bad_params(
            "target audience must be all, students, parents, or teachers",
        ))
    }
}

// Accepts a calendar day or a full timestamp; stored as RFC 3339 UTC so
// expiry comparisons are plain string comparisons.
fn parse_expiry(raw: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).to_rfc3339());
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let end = day.and_hms_opt(23, 59, 59)?;
    Some(Utc.from_utc_datetime(&end).to_rfc3339())
}

fn parse_target_classes(v: &serde_json::Value) -> Result<Vec<(String, String)>, HandlerErr> {
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("targetClasses must be an array"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let class = entry.get("class").and_then(|x| x.as_str());
        let section = entry.get("section").and_then(|x| x.as_str());
        let (Some(class), Some(section)) = (class, section) else {
            return Err(HandlerErr::bad_params(
                "targetClasses entries need class and section",
            ));
        };
        out.push((class.to_string(), section.to_string()));
    }
    Ok(out)
}

fn replace_targets(
    conn: &Connection,
    announcement_id: &str,
    targets: &[(String, String)],
) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM announcement_targets WHERE announcement_id = ?",
        [announcement_id],
    )
    .map_err(HandlerErr::db_update)?;
    for (class, section) in targets {
        conn.execute(
            "INSERT OR IGNORE INTO announcement_targets(announcement_id, class, section)
             VALUES(?, ?, ?)",
            (announcement_id, class, section),
        )
        .map_err(HandlerErr::db_update)?;
    }
    Ok(())
}

fn announcement_json(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, title, content, author_id, author_role, priority, target_audience,
                    publish_date, expiry_date, active, created_at, updated_at
             FROM announcements WHERE id = ?",
            [id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "content": r.get::<_, String>(2)?,
                    "authorId": r.get::<_, String>(3)?,
                    "authorRole": r.get::<_, String>(4)?,
                    "priority": r.get::<_, String>(5)?,
                    "targetAudience": r.get::<_, String>(6)?,
                    "publishDate": r.get::<_, String>(7)?,
                    "expiryDate": r.get::<_, Option<String>>(8)?,
                    "isActive": r.get::<_, i64>(9)? != 0,
                    "createdAt": r.get::<_, String>(10)?,
                    "updatedAt": r.get::<_, Option<String>>(11)?,
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let mut announcement = row.ok_or_else(|| HandlerErr::not_found("announcement not found"))?;

    let mut stmt = conn
        .prepare(
            "SELECT class, section FROM announcement_targets
             WHERE announcement_id = ? ORDER BY class, section",
        )
        .map_err(HandlerErr::db_query)?;
    let targets = stmt
        .query_map([id], |r| {
            Ok(json!({
                "class": r.get::<_, String>(0)?,
                "section": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    announcement["targetClasses"] = serde_json::Value::Array(targets);

    let author_role = announcement["authorRole"].as_str().unwrap_or_default();
    let author_id = announcement["authorId"].as_str().unwrap_or_default().to_string();
    if let Some(role) = Role::parse(author_role) {
        if let Some(name) =
            principal::display_name(conn, role, &author_id).map_err(HandlerErr::db_query)?
        {
            announcement["authorName"] = json!(name);
        }
    }

    Ok(announcement)
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let author = gate::authenticate(conn, params)?;
    gate::require_role(&author, &[Role::Teacher, Role::Admin])?;

    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;
    let priority = params
        .get("priority")
        .and_then(|v| v.as_str())
        .unwrap_or("medium")
        .to_string();
    validate_priority(&priority)?;
    let audience = params
        .get("targetAudience")
        .and_then(|v| v.as_str())
        .unwrap_or("all")
        .to_string();
    validate_audience(&audience)?;
    let targets = match params.get("targetClasses") {
        Some(v) if !v.is_null() => parse_target_classes(v)?,
        _ => Vec::new(),
    };
    let expiry = match params.get("expiryDate").and_then(|v| v.as_str()) {
        Some(raw) => Some(
            parse_expiry(raw)
                .ok_or_else(|| HandlerErr::bad_params("expiryDate must be a date"))?,
        ),
        None => None,
    };

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO announcements(id, title, content, author_id, author_role, priority,
                                   target_audience, publish_date, expiry_date, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &title,
            &content,
            &author.id,
            author.role.as_str(),
            &priority,
            &audience,
            &now,
            &expiry,
            &now,
        ),
    )
    .map_err(HandlerErr::db_update)?;
    replace_targets(conn, &id, &targets)?;

    Ok(json!({ "announcement": announcement_json(conn, &id)? }))
}

// Visibility: active/expiry window, audience matches the requester role
// (or "all"), and class-targeted announcements are limited to students of
// a listed (class, section).
fn visibility_clause(requester: &Principal, binds: &mut Vec<String>) -> String {
    let mut clause = String::from(" AND (expiry_date IS NULL OR expiry_date >= ?)");
    binds.push(Utc::now().to_rfc3339());

    match requester.role.audience() {
        Some(audience) => {
            clause.push_str(" AND target_audience IN ('all', ?)");
            binds.push(audience.to_string());
        }
        None => {
            clause.push_str(" AND target_audience = 'all'");
        }
    }

    if requester.role == Role::Student {
        clause.push_str(
            " AND (NOT EXISTS(SELECT 1 FROM announcement_targets t
                              WHERE t.announcement_id = announcements.id)
                   OR EXISTS(SELECT 1 FROM announcement_targets t
                             WHERE t.announcement_id = announcements.id
                               AND t.class = ? AND t.section = ?))",
        );
        binds.push(requester.class.clone().unwrap_or_default());
        binds.push(requester.section.clone().unwrap_or_default());
    }

    clause
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;

    let page = params.get("page").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut binds: Vec<String> = Vec::new();
    let mut where_clause = format!("WHERE active = {}", if active_only { 1 } else { 0 });
    where_clause.push_str(&visibility_clause(&requester, &mut binds));
    if let Some(priority) = params.get("priority").and_then(|v| v.as_str()) {
        validate_priority(priority)?;
        where_clause.push_str(" AND priority = ?");
        binds.push(priority.to_string());
    }

    let count_sql = format!("SELECT COUNT(*) FROM announcements {}", where_clause);
    let total: i64 = conn
        .query_row(&count_sql, rusqlite::params_from_iter(binds.iter()), |r| {
            r.get(0)
        })
        .map_err(HandlerErr::db_query)?;

    let list_sql = format!(
        "SELECT id FROM announcements {}
         ORDER BY CASE priority WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC,
                  publish_date DESC
         LIMIT {} OFFSET {}",
        where_clause,
        limit,
        (page - 1) * limit
    );
    let mut stmt = conn.prepare(&list_sql).map_err(HandlerErr::db_query)?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            r.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut announcements = Vec::with_capacity(ids.len());
    for id in ids {
        announcements.push(announcement_json(conn, &id)?);
    }

    let total_pages = (total as u64).div_ceil(limit);
    Ok(json!({
        "announcements": announcements,
        "pagination": {
            "currentPage": page,
            "totalPages": total_pages,
            "total": total,
            "hasNext": page < total_pages,
            "hasPrev": page > 1,
        }
    }))
}

fn load_author(
    conn: &Connection,
    id: &str,
) -> Result<(String, String), HandlerErr> {
    conn.query_row(
        "SELECT author_id, author_role FROM announcements WHERE id = ?",
        [id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("announcement not found"))
}

fn require_author_or_admin(
    requester: &Principal,
    author_id: &str,
    author_role: &str,
) -> Result<(), HandlerErr> {
    let is_author =
        requester.id == author_id && requester.role.as_str() == author_role;
    if is_author || requester.role == Role::Admin {
        Ok(())
    } else {
        Err(HandlerErr::forbidden(
            "not authorized to modify this announcement",
        ))
    }
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Teacher, Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let (author_id, author_role) = load_author(conn, &id)?;
    require_author_or_admin(&requester, &author_id, &author_role)?;

    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let now = Utc::now().to_rfc3339();
    for (key, value) in patch {
        // Identity, authorship and timestamp fields are stripped silently.
        match key.as_str() {
            "title" | "content" => {
                let Some(text) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::bad_params(format!(
                        "{} must be a non-empty string",
                        key
                    )));
                };
                conn.execute(
                    &format!("UPDATE announcements SET {} = ?, updated_at = ? WHERE id = ?", key),
                    (text, &now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            "priority" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("priority must be a string"))?;
                validate_priority(raw)?;
                conn.execute(
                    "UPDATE announcements SET priority = ?, updated_at = ? WHERE id = ?",
                    (raw, &now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            "targetAudience" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("targetAudience must be a string"))?;
                validate_audience(raw)?;
                conn.execute(
                    "UPDATE announcements SET target_audience = ?, updated_at = ? WHERE id = ?",
                    (raw, &now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            "targetClasses" => {
                let targets = parse_target_classes(value)?;
                replace_targets(conn, &id, &targets)?;
                conn.execute(
                    "UPDATE announcements SET updated_at = ? WHERE id = ?",
                    (&now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            "expiryDate" => {
                let expiry = match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(raw) => Some(
                        parse_expiry(raw)
                            .ok_or_else(|| HandlerErr::bad_params("expiryDate must be a date"))?,
                    ),
                    _ => return Err(HandlerErr::bad_params("expiryDate must be a date or null")),
                };
                conn.execute(
                    "UPDATE announcements SET expiry_date = ?, updated_at = ? WHERE id = ?",
                    (&expiry, &now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            "isActive" => {
                let flag = value
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("isActive must be a boolean"))?;
                conn.execute(
                    "UPDATE announcements SET active = ?, updated_at = ? WHERE id = ?",
                    (flag as i64, &now, &id),
                )
                .map_err(HandlerErr::db_update)?;
            }
            _ => {}
        }
    }

    Ok(json!({ "announcement": announcement_json(conn, &id)? }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Teacher, Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let (author_id, author_role) = load_author(conn, &id)?;
    require_author_or_admin(&requester, &author_id, &author_role)?;

    conn.execute(
        "DELETE FROM announcement_reads WHERE announcement_id = ?",
        [&id],
    )
    .map_err(HandlerErr::db_update)?;
    conn.execute(
        "DELETE FROM announcement_targets WHERE announcement_id = ?",
        [&id],
    )
    .map_err(HandlerErr::db_update)?;
    conn.execute("DELETE FROM announcements WHERE id = ?", [&id])
        .map_err(HandlerErr::db_update)?;

    Ok(json!({ "message": "announcement deleted" }))
}

fn mark_read(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reader = gate::authenticate(conn, params)?;
    let id = get_required_str(params, "id")?;
    let _ = load_author(conn, &id)?;

    // Primary key (announcement, reader) makes the second call a no-op.
    conn.execute(
        "INSERT OR IGNORE INTO announcement_reads(announcement_id, reader_id, reader_role, read_at)
         VALUES(?, ?, ?, ?)",
        (&id, &reader.id, reader.role.as_str(), Utc::now().to_rfc3339()),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "message": "announcement marked as read" }))
}

fn potential_readers(
    conn: &Connection,
    audience: &str,
    targets: &[(String, String)],
) -> Result<i64, HandlerErr> {
    let count = match audience {
        "all" => {
            principal::count_active(conn, Role::Student).map_err(HandlerErr::db_query)?
                + principal::count_active(conn, Role::Teacher).map_err(HandlerErr::db_query)?
                + principal::count_active(conn, Role::Parent).map_err(HandlerErr::db_query)?
        }
        "students" if !targets.is_empty() => {
            let mut sum = 0i64;
            for (class, section) in targets {
                let n: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM students
                         WHERE class = ? AND section = ? AND active = 1",
                        (class, section),
                        |r| r.get(0),
                    )
                    .map_err(HandlerErr::db_query)?;
                sum += n;
            }
            sum
        }
        "students" => principal::count_active(conn, Role::Student).map_err(HandlerErr::db_query)?,
        "parents" => principal::count_active(conn, Role::Parent).map_err(HandlerErr::db_query)?,
        "teachers" => principal::count_active(conn, Role::Teacher).map_err(HandlerErr::db_query)?,
        _ => 0,
    };
    Ok(count)
}

fn stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = gate::authenticate(conn, params)?;
    gate::require_role(&requester, &[Role::Teacher, Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let announcement = announcement_json(conn, &id)?;

    let mut stmt = conn
        .prepare(
            "SELECT reader_id, reader_role, read_at FROM announcement_reads
             WHERE announcement_id = ? ORDER BY read_at",
        )
        .map_err(HandlerErr::db_query)?;
    let raw_readers = stmt
        .query_map([&id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut readers = Vec::with_capacity(raw_readers.len());
    for (reader_id, reader_role, read_at) in &raw_readers {
        let name = Role::parse(reader_role)
            .and_then(|role| principal::display_name(conn, role, reader_id).ok().flatten());
        readers.push(json!({
            "readerId": reader_id,
            "readerRole": reader_role,
            "readAt": read_at,
            "name": name,
        }));
    }

    let audience = announcement["targetAudience"].as_str().unwrap_or("all").to_string();
    let targets: Vec<(String, String)> = announcement["targetClasses"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    Some((
                        t.get("class")?.as_str()?.to_string(),
                        t.get("section")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    let potential = potential_readers(conn, &audience, &targets)?;

    let total_reads = raw_readers.len() as i64;
    let read_percentage = if potential > 0 {
        ((total_reads as f64 / potential as f64) * 100.0).round() as i64
    } else {
        0
    };

    Ok(json!({
        "announcement": announcement,
        "stats": {
            "totalReads": total_reads,
            "readers": readers,
            "totalPotentialReaders": potential,
            "readPercentage": read_percentage,
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
        "announcements.create" => Some(with_db(state, req, create)),
        "announcements.list" => Some(with_db(state, req, list)),
        "announcements.update" => Some(with_db(state, req, update)),
        "announcements.delete" => Some(with_db(state, req, delete)),
        "announcements.markRead" => Some(with_db(state, req, mark_read)),
        "announcements.stats" => Some(with_db(state, req, stats)),
        _ => None,
    }
}
