use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Resolve the authenticated user for this request, or refuse it.
pub fn require_user(state: &AppState) -> Result<String, HandlerErr> {
    state
        .auth
        .current_user_id()
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("unauthorized", "sign in first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// A `number[]` param. Distinguishes absent (`Ok(None)`) from present-but-wrong.
pub fn get_f64_array(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<f64>>, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(arr) = raw.as_array() else {
        return Err(HandlerErr::bad_params(format!(
            "{} must be an array of numbers",
            key
        )));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!("{} must contain only numbers", key),
                json!({ "index": i }),
            ));
        };
        out.push(n);
    }
    Ok(Some(out))
}

pub fn get_bool_array(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<bool>>, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(arr) = raw.as_array() else {
        return Err(HandlerErr::bad_params(format!(
            "{} must be an array of booleans",
            key
        )));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!("{} must contain only booleans", key),
                json!({ "index": i }),
            ));
        };
        out.push(b);
    }
    Ok(Some(out))
}

pub fn get_string_array(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(arr) = raw.as_array() else {
        return Err(HandlerErr::bad_params(format!(
            "{} must be an array of strings",
            key
        )));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!("{} must contain only strings", key),
                json!({ "index": i }),
            ));
        };
        out.push(s.to_string());
    }
    Ok(Some(out))
}

/// Ownership check: the class must exist and belong to `user_id`.
pub fn class_owned(
    conn: &Connection,
    class_id: &str,
    user_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM classes WHERE id = ? AND user_id = ?",
        (class_id, user_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

/// Ownership check: the activity must exist and belong to `user_id`.
pub fn activity_owned(
    conn: &Connection,
    activity_id: &str,
    user_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM activities WHERE id = ? AND user_id = ?",
        (activity_id, user_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

/// Ownership check through the parent activity.
pub fn correction_owned(
    conn: &Connection,
    correction_id: &str,
    user_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM corrections c
         JOIN activities a ON a.id = c.activity_id
         WHERE c.id = ? AND a.user_id = ?",
        (correction_id, user_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}
