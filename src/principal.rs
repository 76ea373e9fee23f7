use rusqlite::{Connection, OptionalExtension, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Parent,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "parent" => Some(Role::Parent),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
            Role::Admin => "admin",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Role::Student => "students",
            Role::Teacher => "teachers",
            Role::Parent => "parents",
            Role::Admin => "admins",
        }
    }

    // Announcement audience value this role matches, besides "all".
    // Admins have no dedicated audience.
    pub fn audience(self) -> Option<&'static str> {
        match self {
            Role::Student => Some("students"),
            Role::Teacher => Some("teachers"),
            Role::Parent => Some("parents"),
            Role::Admin => None,
        }
    }
}

// The live principal record attached to a request after the gate
// re-fetches it. class/section are populated for students only.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub name: String,
    pub email: String,
    pub active: bool,
    pub class: Option<String>,
    pub section: Option<String>,
}

pub struct CredentialRow {
    pub id: String,
    pub password_hash: String,
    pub active: bool,
}

pub fn find_credential_by_email(
    conn: &Connection,
    role: Role,
    email: &str,
) -> rusqlite::Result<Option<CredentialRow>> {
    let sql = format!(
        "SELECT id, password_hash, active FROM {} WHERE email = ?",
        role.table()
    );
    conn.query_row(&sql, [email], |r| {
        Ok(CredentialRow {
            id: r.get(0)?,
            password_hash: r.get(1)?,
            active: r.get::<_, i64>(2)? != 0,
        })
    })
    .optional()
}

pub fn find_by_id(
    conn: &Connection,
    role: Role,
    id: &str,
) -> rusqlite::Result<Option<Principal>> {
    let sql = match role {
        Role::Student => {
            "SELECT id, name, email, active, class, section FROM students WHERE id = ?"
        }
        Role::Teacher => {
            "SELECT id, name, email, active, NULL, NULL FROM teachers WHERE id = ?"
        }
        Role::Parent => "SELECT id, name, email, active, NULL, NULL FROM parents WHERE id = ?",
        Role::Admin => "SELECT id, name, email, active, NULL, NULL FROM admins WHERE id = ?",
    };
    conn.query_row(sql, [id], |r| row_to_principal(r, role))
        .optional()
}

fn row_to_principal(r: &Row<'_>, role: Role) -> rusqlite::Result<Principal> {
    Ok(Principal {
        id: r.get(0)?,
        role,
        name: r.get(1)?,
        email: r.get(2)?,
        active: r.get::<_, i64>(3)? != 0,
        class: r.get(4)?,
        section: r.get(5)?,
    })
}

pub fn display_name(conn: &Connection, role: Role, id: &str) -> rusqlite::Result<Option<String>> {
    let sql = format!("SELECT name FROM {} WHERE id = ?", role.table());
    conn.query_row(&sql, [id], |r| r.get(0)).optional()
}

pub fn count_active(conn: &Connection, role: Role) -> rusqlite::Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE active = 1", role.table());
    conn.query_row(&sql, [], |r| r.get(0))
}
