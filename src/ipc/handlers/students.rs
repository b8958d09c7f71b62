use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    class_owned, get_opt_str, get_required_str, require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn student_class(
    conn: &rusqlite::Connection,
    student_id: &str,
    user_id: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT s.class_id FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.id = ? AND c.user_id = ?",
        (student_id, user_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn students_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let class_id = get_required_str(params, "classId")?;

    if !class_owned(conn, &class_id, &user_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, sort_order, active
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    )?;
    let students = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            let active: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "sortOrder": sort_order,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "students": students }))
}

fn students_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() && first_name.is_empty() {
        return Err(HandlerErr::bad_params("student name must not be empty"));
    }

    if !class_owned(conn, &class_id, &user_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    // Append at the end of the class roster.
    let next_sort: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, sort_order, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&student_id, &class_id, &last_name, &first_name, next_sort),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    let _ = db::log_event(
        conn,
        &user_id,
        "student",
        &student_id,
        "create",
        Some(&json!({ "classId": class_id })),
    );

    Ok(json!({ "studentId": student_id }))
}

fn students_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let student_id = get_required_str(params, "studentId")?;

    if student_class(conn, &student_id, &user_id)?.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    if let Some(last) = get_opt_str(params, "lastName") {
        conn.execute(
            "UPDATE students SET last_name = ? WHERE id = ?",
            (last.trim(), &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(first) = get_opt_str(params, "firstName") {
        conn.execute(
            "UPDATE students SET first_name = ? WHERE id = ?",
            (first.trim(), &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(active) = params.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    let _ = db::log_event(conn, &user_id, "student", &student_id, "update", None);
    Ok(json!({ "ok": true }))
}

fn students_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let student_id = get_required_str(params, "studentId")?;

    if student_class(conn, &student_id, &user_id)?.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    // Corrections survive the student; they become anonymous.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "UPDATE corrections SET student_id = NULL WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_update_failed", e.to_string()));
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "students" }),
        ));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let _ = db::log_event(conn, &user_id, "student", &student_id, "delete", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
