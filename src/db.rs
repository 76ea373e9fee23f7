use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("school.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parents(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            phone TEXT NOT NULL,
            alternate_phone TEXT,
            address TEXT NOT NULL,
            occupation TEXT NOT NULL,
            relation TEXT NOT NULL,
            children TEXT NOT NULL DEFAULT '[]',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            roll_number TEXT NOT NULL UNIQUE,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            phone TEXT,
            address TEXT,
            date_of_birth TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(parent_id) REFERENCES parents(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_section ON students(class, section)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_parent ON students(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            employee_id TEXT NOT NULL UNIQUE,
            phone TEXT NOT NULL,
            address TEXT NOT NULL,
            qualification TEXT NOT NULL,
            experience REAL NOT NULL DEFAULT 0,
            subjects TEXT NOT NULL DEFAULT '[]',
            assigned_classes TEXT NOT NULL DEFAULT '[]',
            joining_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admins(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            employee_id TEXT NOT NULL UNIQUE,
            phone TEXT,
            address TEXT,
            permissions TEXT NOT NULL DEFAULT '[]',
            last_login TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    // One row per (student, date, period, subject); recording the same
    // tuple again must update in place, never duplicate.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            date TEXT NOT NULL,
            period INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present', 'absent')),
            remarks TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(student_id, date, period, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student_date ON attendance(student_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_teacher_date ON attendance(teacher_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            schedule TEXT NOT NULL DEFAULT '[]',
            holidays TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL,
            PRIMARY KEY(class, section)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcements(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            author_id TEXT NOT NULL,
            author_role TEXT NOT NULL CHECK(author_role IN ('teacher', 'admin')),
            priority TEXT NOT NULL DEFAULT 'medium'
                CHECK(priority IN ('low', 'medium', 'high')),
            target_audience TEXT NOT NULL DEFAULT 'all'
                CHECK(target_audience IN ('all', 'students', 'parents', 'teachers')),
            publish_date TEXT NOT NULL,
            expiry_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_announcements_audience ON announcements(target_audience, active)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcement_targets(
            announcement_id TEXT NOT NULL,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            PRIMARY KEY(announcement_id, class, section),
            FOREIGN KEY(announcement_id) REFERENCES announcements(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcement_reads(
            announcement_id TEXT NOT NULL,
            reader_id TEXT NOT NULL,
            reader_role TEXT NOT NULL,
            read_at TEXT NOT NULL,
            PRIMARY KEY(announcement_id, reader_id),
            FOREIGN KEY(announcement_id) REFERENCES announcements(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    seed_settings(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

// Seed enumerated settings keys so handlers never fall back to
// hardcoded defaults. Existing values are left untouched.
fn seed_settings(conn: &Connection) -> anyhow::Result<()> {
    let defaults: [(&str, serde_json::Value); 3] = [
        (
            "auth.token_secret",
            serde_json::Value::String(Uuid::new_v4().simple().to_string()),
        ),
        (
            "school.general",
            serde_json::json!({
                "schoolName": "Astra Pre-School",
                "academicYear": "2024-25",
                "workingDays": ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday"],
                "attendanceRequirement": 75,
                "maxAbsences": 20
            }),
        ),
        (
            "school.notifications",
            serde_json::json!({
                "emailEnabled": true,
                "smsEnabled": false,
                "parentNotifications": true,
                "teacherNotifications": true
            }),
        ),
    ];
    for (key, value) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO settings(key, value) VALUES(?, ?)",
            (key, serde_json::to_string(&value)?),
        )?;
    }
    Ok(())
}

pub fn token_secret(conn: &Connection) -> anyhow::Result<String> {
    match settings_get_json(conn, "auth.token_secret")? {
        Some(serde_json::Value::String(s)) => Ok(s),
        _ => anyhow::bail!("token secret missing from settings"),
    }
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
