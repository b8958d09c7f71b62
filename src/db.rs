use anyhow::Context;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use crate::grade;

pub const DB_FILE_NAME: &str = "correctord.sqlite3";
pub const UPLOADS_DIR_NAME: &str = "uploads";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            school_year TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_user ON classes(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            class_id TEXT,
            title TEXT NOT NULL,
            subject TEXT,
            date TEXT,
            points TEXT NOT NULL,
            parts_names TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_class ON activities(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS corrections(
            id TEXT PRIMARY KEY,
            activity_id TEXT NOT NULL,
            student_id TEXT,
            points_earned TEXT,
            penalty REAL NOT NULL DEFAULT 0,
            bonus REAL,
            disabled_parts TEXT,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            grade REAL,
            final_grade REAL,
            percentage_grade REAL,
            comment TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(activity_id) REFERENCES activities(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_corrections_activity ON corrections(activity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_corrections_student ON corrections(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_corrections_activity_student
         ON corrections(activity_id, student_id) WHERE student_id IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fragments(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fragments_user ON fragments(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS share_codes(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            revoked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_share_codes_user ON share_codes(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS uploads(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            activity_id TEXT,
            correction_id TEXT,
            file_name TEXT NOT NULL,
            stored_name TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(activity_id) REFERENCES activities(id),
            FOREIGN KEY(correction_id) REFERENCES corrections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uploads_user ON uploads(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uploads_activity ON uploads(activity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uploads_correction ON uploads(correction_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_log_user ON activity_log(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_log_entity ON activity_log(entity_type, entity_id)",
        [],
    )?;

    // Workspaces created before bonus/expiry support lack these columns.
    ensure_corrections_bonus(&conn)?;
    ensure_share_codes_expiry(&conn)?;

    Ok(conn)
}

fn ensure_corrections_bonus(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "corrections", "bonus")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE corrections ADD COLUMN bonus REAL", [])?;
    Ok(())
}

fn ensure_share_codes_expiry(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "share_codes", "expires_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE share_codes ADD COLUMN expires_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn encode_f64_array(values: &[f64]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub fn encode_bool_array(values: &[bool]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub fn encode_string_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_f64_array(raw: &str) -> anyhow::Result<Vec<f64>> {
    serde_json::from_str(raw).with_context(|| format!("malformed number array: {}", raw))
}

pub fn decode_bool_array(raw: &str) -> anyhow::Result<Vec<bool>> {
    serde_json::from_str(raw).with_context(|| format!("malformed bool array: {}", raw))
}

pub fn decode_string_array(raw: &str) -> anyhow::Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("malformed string array: {}", raw))
}

/// Correction columns that feed the grade computation.
#[derive(Debug, Clone)]
pub struct CorrectionInputs {
    pub points_earned: Option<Vec<f64>>,
    pub penalty: f64,
    pub bonus: Option<f64>,
    pub disabled_parts: Option<Vec<bool>>,
    pub status: grade::GradeStatus,
}

pub fn load_correction_inputs(
    conn: &Connection,
    correction_id: &str,
) -> anyhow::Result<Option<CorrectionInputs>> {
    let row: Option<(Option<String>, f64, Option<f64>, Option<String>, String)> = conn
        .query_row(
            "SELECT points_earned, penalty, bonus, disabled_parts, status
             FROM corrections WHERE id = ?",
            [correction_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((earned_raw, penalty, bonus, disabled_raw, status_raw)) = row else {
        return Ok(None);
    };

    let points_earned = match earned_raw {
        Some(raw) => Some(decode_f64_array(&raw)?),
        None => None,
    };
    let disabled_parts = match disabled_raw {
        Some(raw) => Some(decode_bool_array(&raw)?),
        None => None,
    };
    let status = grade::GradeStatus::parse(&status_raw)
        .with_context(|| format!("unknown correction status: {}", status_raw))?;

    Ok(Some(CorrectionInputs {
        points_earned,
        penalty,
        bonus,
        disabled_parts,
        status,
    }))
}

pub fn activity_max_points(
    conn: &Connection,
    activity_id: &str,
) -> anyhow::Result<Option<Vec<f64>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT points FROM activities WHERE id = ?",
            [activity_id],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(decode_f64_array(&raw)?)),
        None => Ok(None),
    }
}

/// Recompute the derived grade columns of one correction from its current
/// inputs and its activity's part layout. Statuses outside the two computing
/// branches clear the columns to NULL.
pub fn recompute_correction(conn: &Connection, correction_id: &str) -> anyhow::Result<()> {
    let activity_id: String = conn.query_row(
        "SELECT activity_id FROM corrections WHERE id = ?",
        [correction_id],
        |r| r.get(0),
    )?;
    let max_points = activity_max_points(conn, &activity_id)?
        .with_context(|| format!("activity {} missing for correction", activity_id))?;
    let inputs = load_correction_inputs(conn, correction_id)?
        .with_context(|| format!("correction {} vanished mid-recompute", correction_id))?;

    let result = grade::grade_for_status(
        inputs.status,
        &max_points,
        inputs.points_earned.as_deref(),
        inputs.penalty,
        inputs.bonus,
        inputs.disabled_parts.as_deref(),
    );

    let (grade_v, final_v, pct_v) = match result {
        Some(r) => {
            let pct = grade::percentage_grade(
                r.final_grade,
                &max_points,
                inputs.disabled_parts.as_deref(),
            );
            (Some(r.grade), Some(r.final_grade), Some(pct))
        }
        None => (None, None, None),
    };

    conn.execute(
        "UPDATE corrections
         SET grade = ?, final_grade = ?, percentage_grade = ?, updated_at = ?
         WHERE id = ?",
        (grade_v, final_v, pct_v, now_rfc3339(), correction_id),
    )?;
    Ok(())
}

/// Reconcile every correction of an activity to its current part count, then
/// recompute the derived columns. Runs after the activity's `points` or
/// `parts_names` layout changed.
pub fn reconcile_activity_corrections(conn: &Connection, activity_id: &str) -> anyhow::Result<()> {
    let max_points = activity_max_points(conn, activity_id)?
        .with_context(|| format!("activity not found: {}", activity_id))?;
    let target_len = max_points.len();

    let mut stmt = conn.prepare(
        "SELECT id, points_earned, disabled_parts FROM corrections WHERE activity_id = ?",
    )?;
    let rows: Vec<(String, Option<String>, Option<String>)> = stmt
        .query_map([activity_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, earned_raw, disabled_raw) in rows {
        let earned = match earned_raw {
            Some(raw) => Some(grade::reconcile_points_earned(
                &decode_f64_array(&raw)?,
                target_len,
            )),
            None => None,
        };
        // The mask is positional too; newly added parts start enabled.
        let disabled = match disabled_raw {
            Some(raw) => {
                let mut mask = decode_bool_array(&raw)?;
                mask.resize(target_len, false);
                Some(mask)
            }
            None => None,
        };

        conn.execute(
            "UPDATE corrections SET points_earned = ?, disabled_parts = ? WHERE id = ?",
            (
                earned.as_deref().map(encode_f64_array),
                disabled.as_deref().map(encode_bool_array),
                &id,
            ),
        )?;
        recompute_correction(conn, &id)?;
    }
    Ok(())
}

/// Append one activity-log row. Mutating handlers call this after their write
/// lands; most treat a log failure as best-effort.
pub fn log_event(
    conn: &Connection,
    user_id: &str,
    entity_type: &str,
    entity_id: &str,
    action: &str,
    details: Option<&serde_json::Value>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO activity_log(id, user_id, entity_type, entity_id, action, details, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            user_id,
            entity_type,
            entity_id,
            action,
            details.map(|d| d.to_string()),
            now_rfc3339(),
        ),
    )?;
    Ok(())
}
