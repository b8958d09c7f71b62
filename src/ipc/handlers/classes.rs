use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    class_owned, get_opt_str, get_required_str, require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn classes_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;

    // Correlated subqueries to avoid double-counting from joins.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.school_year,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM activities a WHERE a.class_id = c.id) AS activity_count
         FROM classes c
         WHERE c.user_id = ?
         ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([&user_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let school_year: Option<String> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let activity_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "schoolYear": school_year,
                "studentCount": student_count,
                "activityCount": activity_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;

    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let school_year = get_opt_str(params, "schoolYear");

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, user_id, name, school_year) VALUES(?, ?, ?, ?)",
        (&class_id, &user_id, &name, &school_year),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "classes" }))
    })?;

    let _ = db::log_event(
        conn,
        &user_id,
        "class",
        &class_id,
        "create",
        Some(&json!({ "name": name })),
    );

    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let class_id = get_required_str(params, "classId")?;

    if !class_owned(conn, &class_id, &user_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    if let Some(name) = get_opt_str(params, "name") {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(year) = get_opt_str(params, "schoolYear") {
        conn.execute(
            "UPDATE classes SET school_year = ? WHERE id = ?",
            (&year, &class_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    let _ = db::log_event(conn, &user_id, "class", &class_id, "update", None);
    Ok(json!({ "ok": true }))
}

fn classes_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let class_id = get_required_str(params, "classId")?;

    if !class_owned(conn, &class_id, &user_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicit dependency-order deletes (no ON DELETE CASCADE). Activities of
    // this class go too; their corrections, uploads and share codes first.
    let steps: &[(&str, &str)] = &[
        (
            "uploads",
            "DELETE FROM uploads
             WHERE correction_id IN (
               SELECT c.id FROM corrections c
               JOIN activities a ON a.id = c.activity_id
               WHERE a.class_id = ?1
             )
             OR activity_id IN (SELECT id FROM activities WHERE class_id = ?1)",
        ),
        (
            "share_codes",
            "DELETE FROM share_codes
             WHERE (resource_type = 'activity'
                    AND resource_id IN (SELECT id FROM activities WHERE class_id = ?1))
                OR (resource_type = 'correction'
                    AND resource_id IN (
                      SELECT c.id FROM corrections c
                      JOIN activities a ON a.id = c.activity_id
                      WHERE a.class_id = ?1
                    ))",
        ),
        (
            "corrections",
            "DELETE FROM corrections
             WHERE activity_id IN (SELECT id FROM activities WHERE class_id = ?1)",
        ),
        ("activities", "DELETE FROM activities WHERE class_id = ?1"),
        ("students", "DELETE FROM students WHERE class_id = ?1"),
        ("classes", "DELETE FROM classes WHERE id = ?1"),
    ];

    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": table }),
            ));
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let _ = db::log_event(conn, &user_id, "class", &class_id, "delete", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => classes_list(state),
        "classes.create" => classes_create(state, &req.params),
        "classes.update" => classes_update(state, &req.params),
        "classes.delete" => classes_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
