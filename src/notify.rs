use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::info;

use crate::db;

pub struct AbsenceAlert<'a> {
    pub student_name: &'a str,
    pub student_roll: &'a str,
    pub parent_name: &'a str,
    pub parent_email: &'a str,
    pub parent_phone: Option<&'a str>,
    pub class: &'a str,
    pub section: &'a str,
    pub subject: &'a str,
    pub date: NaiveDate,
    pub period: i64,
}

// Best-effort absence delivery. The caller logs and swallows errors;
// attendance persistence must never depend on the outcome here.
pub fn send_absence_alert(conn: &Connection, alert: &AbsenceAlert<'_>) -> anyhow::Result<()> {
    let settings = db::settings_get_json(conn, "school.notifications")?
        .ok_or_else(|| anyhow::anyhow!("notification settings missing"))?;

    let parent_enabled = settings
        .get("parentNotifications")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if !parent_enabled {
        info!(
            student = alert.student_name,
            "parent notifications disabled; skipping absence alert"
        );
        return Ok(());
    }

    let email_enabled = settings
        .get("emailEnabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let sms_enabled = settings
        .get("smsEnabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let date = alert.date.format("%Y-%m-%d");
    let message = format!(
        "Dear Parent, your child {} (roll {}) was marked absent in {} on {}. \
         Class {}-{}, period {}. Please contact the school with any questions.",
        alert.student_name,
        alert.student_roll,
        alert.subject,
        date,
        alert.class,
        alert.section,
        alert.period
    );

    if email_enabled {
        info!(
            channel = "email",
            to = alert.parent_email,
            subject = format!("Attendance Alert - {}", alert.student_name).as_str(),
            %message,
            "absence alert dispatched"
        );
    }
    if sms_enabled {
        if let Some(phone) = alert.parent_phone {
            info!(
                channel = "sms",
                to = phone,
                student = alert.student_name,
                "absence alert dispatched"
            );
        }
    }
    if !email_enabled && !sms_enabled {
        info!(
            to = alert.parent_email,
            recipient = alert.parent_name,
            %message,
            "absence alert recorded (no delivery channel enabled)"
        );
    }

    Ok(())
}
