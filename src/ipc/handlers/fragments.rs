use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{get_opt_str, get_required_str, require_db, require_user};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn fragment_owned(
    conn: &rusqlite::Connection,
    fragment_id: &str,
    user_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM fragments WHERE id = ? AND user_id = ?",
        (fragment_id, user_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn fragments_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let category = get_opt_str(params, "category");

    let (sql, binds): (&str, Vec<String>) = match category {
        Some(cat) => (
            "SELECT id, category, content, sort_order, usage_count
             FROM fragments
             WHERE user_id = ? AND category = ?
             ORDER BY sort_order, usage_count DESC",
            vec![user_id, cat],
        ),
        None => (
            "SELECT id, category, content, sort_order, usage_count
             FROM fragments
             WHERE user_id = ?
             ORDER BY category, sort_order, usage_count DESC",
            vec![user_id],
        ),
    };

    let mut stmt = conn.prepare(sql)?;
    let fragments = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let category: String = row.get(1)?;
            let content: String = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            let usage_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "category": category,
                "content": content,
                "sortOrder": sort_order,
                "usageCount": usage_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "fragments": fragments }))
}

fn fragments_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let content = get_required_str(params, "content")?;
    if content.trim().is_empty() {
        return Err(HandlerErr::bad_params("content must not be empty"));
    }
    let category = get_opt_str(params, "category").unwrap_or_default();

    let next_sort: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM fragments WHERE user_id = ? AND category = ?",
        (&user_id, &category),
        |r| r.get(0),
    )?;

    let fragment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fragments(id, user_id, category, content, sort_order, usage_count)
         VALUES(?, ?, ?, ?, ?, 0)",
        (&fragment_id, &user_id, &category, &content, next_sort),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "fragments" }))
    })?;

    let _ = db::log_event(conn, &user_id, "fragment", &fragment_id, "create", None);
    Ok(json!({ "fragmentId": fragment_id }))
}

fn fragments_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let fragment_id = get_required_str(params, "fragmentId")?;

    if !fragment_owned(conn, &fragment_id, &user_id)? {
        return Err(HandlerErr::not_found("fragment not found"));
    }

    if let Some(content) = get_opt_str(params, "content") {
        if content.trim().is_empty() {
            return Err(HandlerErr::bad_params("content must not be empty"));
        }
        conn.execute(
            "UPDATE fragments SET content = ? WHERE id = ?",
            (&content, &fragment_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(category) = get_opt_str(params, "category") {
        conn.execute(
            "UPDATE fragments SET category = ? WHERE id = ?",
            (&category, &fragment_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    let _ = db::log_event(conn, &user_id, "fragment", &fragment_id, "update", None);
    Ok(json!({ "ok": true }))
}

/// Bumps the usage counter so frequently pasted fragments float up in lists.
fn fragments_mark_used(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let fragment_id = get_required_str(params, "fragmentId")?;

    if !fragment_owned(conn, &fragment_id, &user_id)? {
        return Err(HandlerErr::not_found("fragment not found"));
    }

    conn.execute(
        "UPDATE fragments SET usage_count = usage_count + 1 WHERE id = ?",
        [&fragment_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let usage_count: i64 = conn.query_row(
        "SELECT usage_count FROM fragments WHERE id = ?",
        [&fragment_id],
        |r| r.get(0),
    )?;
    Ok(json!({ "usageCount": usage_count }))
}

fn fragments_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let fragment_id = get_required_str(params, "fragmentId")?;

    if !fragment_owned(conn, &fragment_id, &user_id)? {
        return Err(HandlerErr::not_found("fragment not found"));
    }

    conn.execute("DELETE FROM fragments WHERE id = ?", [&fragment_id])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "fragments" }),
            )
        })?;

    let _ = db::log_event(conn, &user_id, "fragment", &fragment_id, "delete", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "fragments.list" => fragments_list(state, &req.params),
        "fragments.create" => fragments_create(state, &req.params),
        "fragments.update" => fragments_update(state, &req.params),
        "fragments.markUsed" => fragments_mark_used(state, &req.params),
        "fragments.delete" => fragments_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
