use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::common::{get_opt_str, get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.auth.current_user_id().is_some()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // A session never survives a workspace switch.
            state.auth.sign_out();
            tracing::info!(path = %path.to_string_lossy(), "workspace opened");
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn register(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let username = get_required_str(&req.params, "username")?.trim().to_string();
    let password = get_required_str(&req.params, "password")?;
    if username.is_empty() {
        return Err(HandlerErr::bad_params("username must not be empty"));
    }
    if password.len() < 4 {
        return Err(HandlerErr::bad_params("password too short"));
    }
    let display_name = get_opt_str(&req.params, "displayName").unwrap_or_else(|| username.clone());

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ?",
            [&username],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::new("conflict", "username already taken"));
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().simple().to_string();
    let password_hash = hash_password(&salt, &password);
    conn.execute(
        "INSERT INTO users(id, username, display_name, salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &username,
            &display_name,
            &salt,
            &password_hash,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "userId": user_id, "username": username }))
}

fn handle_auth_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    match register(state, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(&req.params, "username")?;
    let password = get_required_str(&req.params, "password")?;

    let conn = require_db(state)?;
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, salt, password_hash FROM users WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    // Same answer for unknown user and wrong password.
    let Some((user_id, salt, stored_hash)) = row else {
        return Err(HandlerErr::new("unauthorized", "invalid credentials"));
    };
    if hash_password(&salt, &password) != stored_hash {
        return Err(HandlerErr::new("unauthorized", "invalid credentials"));
    }

    state.auth.sign_in(user_id.clone(), username.clone());
    tracing::info!(%username, "user signed in");
    Ok(json!({ "userId": user_id, "username": username }))
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    match login(state, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.auth.sign_out();
    ok(&req.id, json!({ "ok": true }))
}

fn handle_auth_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.auth.current_user() {
        Some(user) => ok(
            &req.id,
            json!({ "userId": user.user_id, "username": user.username }),
        ),
        None => ok(&req.id, json!({ "userId": null, "username": null })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "auth.register" => Some(handle_auth_register(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        "auth.whoami" => Some(handle_auth_whoami(state, req)),
        _ => None,
    }
}
