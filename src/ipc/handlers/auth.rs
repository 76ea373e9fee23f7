use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::gate;
use crate::ipc::types::{AppState, Request};
use crate::principal::{self, Role};
use crate::session;

const MIN_PASSWORD_LEN: usize = 6;
pub const PARENT_RELATIONS: [&str; 3] = ["father", "mother", "guardian"];

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required_email(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, "email")?;
    if !raw.contains('@') {
        return Err(HandlerErr::bad_params("email must contain @"));
    }
    Ok(raw.to_lowercase())
}

// Passwords are taken verbatim, never trimmed.
pub fn raw_password(params: &serde_json::Value) -> Result<String, HandlerErr> {
    params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))
}

pub fn required_password(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let pw = params
        .get("password")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    if pw.len() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(pw)
}

fn string_array(v: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = v.get(key).and_then(|x| x.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "{} entries must be strings",
                key
            )));
        };
        let t = s.trim();
        if t.is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "{} entries must be non-empty",
                key
            )));
        }
        out.push(t.to_string());
    }
    Ok(out)
}

// assignedClasses entries are {class, section, subject}, all required.
pub fn parse_assigned_classes(v: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("assignedClasses must be an array"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let class = entry.get("class").and_then(|x| x.as_str());
        let section = entry.get("section").and_then(|x| x.as_str());
        let subject = entry.get("subject").and_then(|x| x.as_str());
        let (Some(class), Some(section), Some(subject)) = (class, section, subject) else {
            return Err(HandlerErr::bad_params(
                "assignedClasses entries need class, section and subject",
            ));
        };
        out.push(json!({ "class": class, "section": section, "subject": subject }));
    }
    Ok(serde_json::Value::Array(out))
}

pub fn json_column(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!([]))
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = required_email(params)?;
    let password = raw_password(params)?;
    let user_type = get_required_str(params, "userType")?;

    let role = match Role::parse(&user_type) {
        Some(r) if r != Role::Admin => r,
        // Admins authenticate through admin.login.
        _ => return Err(HandlerErr::bad_params("please select a valid user type")),
    };

    let cred = principal::find_credential_by_email(conn, role, &email)
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

    let secret = db::token_secret(conn).map_err(HandlerErr::db_query)?;
    let token = session::issue_token(&secret, &cred.id, role);
    let user = login_user_json(conn, role, &cred.id)?;

    Ok(json!({ "token": token, "user": user }))
}

fn login_user_json(
    conn: &Connection,
    role: Role,
    id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    match role {
        Role::Student => conn
            .query_row(
                "SELECT id, name, email, roll_number, class, section FROM students WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "email": r.get::<_, String>(2)?,
                        "userType": "student",
                        "rollNumber": r.get::<_, String>(3)?,
                        "class": r.get::<_, String>(4)?,
                        "section": r.get::<_, String>(5)?,
                    }))
                },
            )
            .map_err(HandlerErr::db_query),
        Role::Teacher => conn
            .query_row(
                "SELECT id, name, email, employee_id, subjects, assigned_classes
                 FROM teachers WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "email": r.get::<_, String>(2)?,
                        "userType": "teacher",
                        "employeeId": r.get::<_, String>(3)?,
                        "subjects": json_column(&r.get::<_, String>(4)?),
                        "assignedClasses": json_column(&r.get::<_, String>(5)?),
                    }))
                },
            )
            .map_err(HandlerErr::db_query),
        Role::Parent => conn
            .query_row(
                "SELECT id, name, email FROM parents WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "email": r.get::<_, String>(2)?,
                        "userType": "parent",
                    }))
                },
            )
            .map_err(HandlerErr::db_query),
        Role::Admin => Err(HandlerErr::bad_params("please select a valid user type")),
    }
}

fn register_parent(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = required_email(params)?;
    let password = required_password(params)?;
    let phone = get_required_str(params, "phone")?;
    let address = get_required_str(params, "address")?;
    let occupation = get_required_str(params, "occupation")?;
    let relation = get_required_str(params, "relation")?;
    if !PARENT_RELATIONS.contains(&relation.as_str()) {
        return Err(HandlerErr::bad_params(
            "relation must be father, mother, or guardian",
        ));
    }
    let alternate_phone = get_opt_str(params, "alternatePhone");

    let exists: Option<String> = conn
        .query_row("SELECT id FROM parents WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "duplicate_identity",
            "parent already exists with this email",
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO parents(id, name, email, password_hash, phone, alternate_phone,
                             address, occupation, relation, children, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', 1, ?)",
        (
            &id,
            &name,
            &email,
            session::hash_password(&password),
            &phone,
            &alternate_phone,
            &address,
            &occupation,
            &relation,
            &now,
        ),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new("duplicate_identity", "parent already exists with this email")
        } else {
            HandlerErr::db_update(e)
        }
    })?;

    Ok(json!({
        "parent": { "id": id, "name": name, "email": email, "phone": phone }
    }))
}

fn register_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = required_email(params)?;
    let password = required_password(params)?;
    let employee_id = get_required_str(params, "employeeId")?;
    let phone = get_required_str(params, "phone")?;
    let address = get_required_str(params, "address")?;
    let qualification = get_required_str(params, "qualification")?;
    let subjects = string_array(params, "subjects")?;
    if subjects.is_empty() {
        return Err(HandlerErr::bad_params("subjects must be non-empty"));
    }
    let assigned_classes = match params.get("assignedClasses") {
        Some(v) if !v.is_null() => parse_assigned_classes(v)?,
        _ => json!([]),
    };
    let experience = params
        .get("experience")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM teachers WHERE email = ? OR employee_id = ?",
            (&email, &employee_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "duplicate_identity",
            "teacher already exists with this email or employee ID",
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO teachers(id, name, email, password_hash, employee_id, phone, address,
                              qualification, experience, subjects, assigned_classes,
                              joining_date, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &name,
            &email,
            session::hash_password(&password),
            &employee_id,
            &phone,
            &address,
            &qualification,
            experience,
            serde_json::to_string(&subjects).unwrap_or_else(|_| "[]".into()),
            assigned_classes.to_string(),
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new(
                "duplicate_identity",
                "teacher already exists with this email or employee ID",
            )
        } else {
            HandlerErr::db_update(e)
        }
    })?;

    Ok(json!({
        "teacher": {
            "id": id,
            "name": name,
            "email": email,
            "employeeId": employee_id,
            "subjects": subjects,
        }
    }))
}

pub struct NewStudent {
    pub name: String,
    pub email: String,
    pub password: String,
    pub roll_number: String,
    pub class: String,
    pub section: String,
    pub parent_id: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<String>,
}

pub fn parse_new_student(params: &serde_json::Value) -> Result<NewStudent, HandlerErr> {
    let date_of_birth = get_opt_str(params, "dateOfBirth");
    if let Some(dob) = &date_of_birth {
        if NaiveDate::parse_from_str(dob, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::bad_params("dateOfBirth must be YYYY-MM-DD"));
        }
    }
    Ok(NewStudent {
        name: get_required_str(params, "name")?,
        email: required_email(params)?,
        password: required_password(params)?,
        roll_number: get_required_str(params, "rollNumber")?,
        class: get_required_str(params, "class")?,
        section: get_required_str(params, "section")?,
        parent_id: get_required_str(params, "parentId")?,
        phone: get_opt_str(params, "phone"),
        address: get_opt_str(params, "address"),
        date_of_birth,
    })
}

// Shared by auth.registerStudent and admin.bulkCreateStudents. The child
// row is the source of truth; the parent's children list is an idempotent
// secondary index appended after the insert.
pub fn create_student(conn: &Connection, new: &NewStudent) -> Result<String, HandlerErr> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE email = ? OR roll_number = ?",
            (&new.email, &new.roll_number),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "duplicate_identity",
            "student already exists with this email or roll number",
        ));
    }

    let parent_children: Option<String> = conn
        .query_row(
            "SELECT children FROM parents WHERE id = ?",
            [&new.parent_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(parent_children) = parent_children else {
        return Err(HandlerErr::new("parent_not_found", "parent not found"));
    };

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, name, email, password_hash, roll_number, class, section,
                              parent_id, phone, address, date_of_birth, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &new.name,
            &new.email,
            session::hash_password(&new.password),
            &new.roll_number,
            &new.class,
            &new.section,
            &new.parent_id,
            &new.phone,
            &new.address,
            &new.date_of_birth,
            &now,
        ),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new(
                "duplicate_identity",
                "student already exists with this email or roll number",
            )
        } else {
            HandlerErr::db_update(e)
        }
    })?;

    let mut children: Vec<String> =
        serde_json::from_str(&parent_children).unwrap_or_default();
    if !children.iter().any(|c| c == &id) {
        children.push(id.clone());
        conn.execute(
            "UPDATE parents SET children = ?, updated_at = ? WHERE id = ?",
            (
                serde_json::to_string(&children).unwrap_or_else(|_| "[]".into()),
                &now,
                &new.parent_id,
            ),
        )
        .map_err(HandlerErr::db_update)?;
    }

    Ok(id)
}

fn register_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let new = parse_new_student(params)?;
    let id = create_student(conn, &new)?;
    Ok(json!({
        "student": {
            "id": id,
            "name": new.name,
            "email": new.email,
            "rollNumber": new.roll_number,
            "class": new.class,
            "section": new.section,
        }
    }))
}

pub fn profile_json(
    conn: &Connection,
    role: Role,
    id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    match role {
        Role::Student => {
            let row = conn
                .query_row(
                    "SELECT id, name, email, roll_number, class, section, parent_id,
                            phone, address, date_of_birth, active, created_at
                     FROM students WHERE id = ?",
                    [id],
                    |r| {
                        Ok(json!({
                            "id": r.get::<_, String>(0)?,
                            "name": r.get::<_, String>(1)?,
                            "email": r.get::<_, String>(2)?,
                            "rollNumber": r.get::<_, String>(3)?,
                            "class": r.get::<_, String>(4)?,
                            "section": r.get::<_, String>(5)?,
                            "parentId": r.get::<_, String>(6)?,
                            "phone": r.get::<_, Option<String>>(7)?,
                            "address": r.get::<_, Option<String>>(8)?,
                            "dateOfBirth": r.get::<_, Option<String>>(9)?,
                            "isActive": r.get::<_, i64>(10)? != 0,
                            "createdAt": r.get::<_, String>(11)?,
                        }))
                    },
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            let mut user = row.ok_or_else(|| HandlerErr::not_found("user not found"))?;
            let parent_id = user["parentId"].as_str().unwrap_or_default().to_string();
            let parent = conn
                .query_row(
                    "SELECT name, email, phone FROM parents WHERE id = ?",
                    [&parent_id],
                    |r| {
                        Ok(json!({
                            "id": parent_id.clone(),
                            "name": r.get::<_, String>(0)?,
                            "email": r.get::<_, String>(1)?,
                            "phone": r.get::<_, String>(2)?,
                        }))
                    },
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            if let Some(parent) = parent {
                user["parent"] = parent;
            }
            Ok(user)
        }
        Role::Teacher => conn
            .query_row(
                "SELECT id, name, email, employee_id, phone, address, qualification,
                        experience, subjects, assigned_classes, joining_date, active, created_at
                 FROM teachers WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "email": r.get::<_, String>(2)?,
                        "employeeId": r.get::<_, String>(3)?,
                        "phone": r.get::<_, String>(4)?,
                        "address": r.get::<_, String>(5)?,
                        "qualification": r.get::<_, String>(6)?,
                        "experience": r.get::<_, f64>(7)?,
                        "subjects": json_column(&r.get::<_, String>(8)?),
                        "assignedClasses": json_column(&r.get::<_, String>(9)?),
                        "joiningDate": r.get::<_, String>(10)?,
                        "isActive": r.get::<_, i64>(11)? != 0,
                        "createdAt": r.get::<_, String>(12)?,
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::db_query)?
            .ok_or_else(|| HandlerErr::not_found("user not found")),
        Role::Parent => {
            let row = conn
                .query_row(
                    "SELECT id, name, email, phone, alternate_phone, address, occupation,
                            relation, children, active, created_at
                     FROM parents WHERE id = ?",
                    [id],
                    |r| {
                        Ok(json!({
                            "id": r.get::<_, String>(0)?,
                            "name": r.get::<_, String>(1)?,
                            "email": r.get::<_, String>(2)?,
                            "phone": r.get::<_, String>(3)?,
                            "alternatePhone": r.get::<_, Option<String>>(4)?,
                            "address": r.get::<_, String>(5)?,
                            "occupation": r.get::<_, String>(6)?,
                            "relation": r.get::<_, String>(7)?,
                            "childrenIds": json_column(&r.get::<_, String>(8)?),
                            "isActive": r.get::<_, i64>(9)? != 0,
                            "createdAt": r.get::<_, String>(10)?,
                        }))
                    },
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            let mut user = row.ok_or_else(|| HandlerErr::not_found("user not found"))?;
            let mut children = Vec::new();
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, roll_number, class, section
                     FROM students WHERE parent_id = ? ORDER BY roll_number",
                )
                .map_err(HandlerErr::db_query)?;
            let rows = stmt
                .query_map([id], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "rollNumber": r.get::<_, String>(2)?,
                        "class": r.get::<_, String>(3)?,
                        "section": r.get::<_, String>(4)?,
                    }))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            children.extend(rows);
            user["children"] = serde_json::Value::Array(children);
            Ok(user)
        }
        Role::Admin => conn
            .query_row(
                "SELECT id, name, email, employee_id, phone, address, permissions,
                        last_login, active, created_at
                 FROM admins WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "email": r.get::<_, String>(2)?,
                        "employeeId": r.get::<_, String>(3)?,
                        "phone": r.get::<_, Option<String>>(4)?,
                        "address": r.get::<_, Option<String>>(5)?,
                        "permissions": json_column(&r.get::<_, String>(6)?),
                        "lastLogin": r.get::<_, Option<String>>(7)?,
                        "isActive": r.get::<_, i64>(8)? != 0,
                        "createdAt": r.get::<_, String>(9)?,
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::db_query)?
            .ok_or_else(|| HandlerErr::not_found("user not found")),
    }
}

fn profile_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    let user = profile_json(conn, principal.role, &principal.id)?;
    Ok(json!({ "user": user, "userType": principal.role.as_str() }))
}

// Field -> column map per role; email and password never change here,
// identity fields are stripped silently.
fn updatable_column(role: Role, key: &str) -> Option<&'static str> {
    match (role, key) {
        (_, "name") => Some("name"),
        (_, "phone") => Some("phone"),
        (_, "address") => Some("address"),
        (Role::Student, "dateOfBirth") => Some("date_of_birth"),
        (Role::Student, "class") => Some("class"),
        (Role::Student, "section") => Some("section"),
        (Role::Teacher, "qualification") => Some("qualification"),
        (Role::Teacher, "experience") => Some("experience"),
        (Role::Teacher, "subjects") => Some("subjects"),
        (Role::Teacher, "assignedClasses") => Some("assigned_classes"),
        (Role::Parent, "alternatePhone") => Some("alternate_phone"),
        (Role::Parent, "occupation") => Some("occupation"),
        (Role::Parent, "relation") => Some("relation"),
        _ => None,
    }
}

fn profile_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    for (key, value) in patch {
        let Some(column) = updatable_column(principal.role, key) else {
            continue;
        };
        let stored: String = match (principal.role, key.as_str()) {
            (Role::Teacher, "subjects") => {
                let subjects = string_array(&json!({ "subjects": value }), "subjects")?;
                serde_json::to_string(&subjects).unwrap_or_else(|_| "[]".into())
            }
            (Role::Teacher, "assignedClasses") => parse_assigned_classes(value)?.to_string(),
            (Role::Teacher, "experience") => value
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params("experience must be a number"))?
                .to_string(),
            (Role::Parent, "relation") => {
                let relation = value
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("relation must be a string"))?;
                if !PARENT_RELATIONS.contains(&relation) {
                    return Err(HandlerErr::bad_params(
                        "relation must be father, mother, or guardian",
                    ));
                }
                relation.to_string()
            }
            _ => value
                .as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    HandlerErr::bad_params(format!("{} must be a non-empty string", key))
                })?,
        };
        let sql = format!(
            "UPDATE {} SET {} = ?, updated_at = ? WHERE id = ?",
            principal.role.table(),
            column
        );
        conn.execute(&sql, (&stored, Utc::now().to_rfc3339(), &principal.id))
            .map_err(HandlerErr::db_update)?;
    }

    let user = profile_json(conn, principal.role, &principal.id)?;
    Ok(json!({ "user": user }))
}

fn profile_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let principal = gate::authenticate(conn, params)?;
    conn.execute(
        &format!("UPDATE {} SET active = 0 WHERE id = ?", principal.role.table()),
        [&principal.id],
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({ "message": "account deactivated" }))
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
        "auth.login" => Some(with_db(state, req, login)),
        "auth.registerParent" => Some(with_db(state, req, register_parent)),
        "auth.registerTeacher" => Some(with_db(state, req, register_teacher)),
        "auth.registerStudent" => Some(with_db(state, req, register_student)),
        "auth.profileGet" => Some(with_db(state, req, profile_get)),
        "auth.profileUpdate" => Some(with_db(state, req, profile_update)),
        "auth.profileDelete" => Some(with_db(state, req, profile_delete)),
        _ => None,
    }
}
