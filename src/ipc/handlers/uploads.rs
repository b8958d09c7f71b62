use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    activity_owned, correction_owned, get_opt_str, get_required_str, require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

fn uploads_dir(workspace: &Path) -> PathBuf {
    workspace.join(db::UPLOADS_DIR_NAME)
}

fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Copy a file from `sourcePath` into the workspace uploads directory and
/// record it, optionally attached to an activity or a correction.
fn uploads_store(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let source = PathBuf::from(get_required_str(params, "sourcePath")?);
    if !source.is_file() {
        return Err(HandlerErr::with_details(
            "io_failed",
            "source file not found",
            json!({ "sourcePath": source.to_string_lossy() }),
        ));
    }

    let activity_id = get_opt_str(params, "activityId");
    let correction_id = get_opt_str(params, "correctionId");
    if activity_id.is_some() && correction_id.is_some() {
        return Err(HandlerErr::bad_params(
            "attach to either an activity or a correction, not both",
        ));
    }
    if let Some(ref aid) = activity_id {
        if !activity_owned(conn, aid, &user_id)? {
            return Err(HandlerErr::not_found("activity not found"));
        }
    }
    if let Some(ref cid) = correction_id {
        if !correction_owned(conn, cid, &user_id)? {
            return Err(HandlerErr::not_found("correction not found"));
        }
    }

    let file_name = source
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload.bin")
        .to_string();
    let meta = std::fs::metadata(&source)
        .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    if meta.len() > MAX_UPLOAD_BYTES {
        return Err(HandlerErr::with_details(
            "bad_params",
            "file too large",
            json!({ "sizeBytes": meta.len(), "maxBytes": MAX_UPLOAD_BYTES }),
        ));
    }

    let upload_id = Uuid::new_v4().to_string();
    let stored_name = format!("{}-{}", upload_id, file_name);
    let dir = uploads_dir(workspace);
    std::fs::create_dir_all(&dir).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    let dest = dir.join(&stored_name);
    std::fs::copy(&source, &dest).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;

    let (sha256, size_bytes) = match sha256_file(&dest) {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&dest);
            return Err(HandlerErr::new("io_failed", e.to_string()));
        }
    };

    if let Err(e) = conn.execute(
        "INSERT INTO uploads(id, user_id, activity_id, correction_id, file_name, stored_name, size_bytes, sha256, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &upload_id,
            &user_id,
            &activity_id,
            &correction_id,
            &file_name,
            &stored_name,
            size_bytes as i64,
            &sha256,
            db::now_rfc3339(),
        ),
    ) {
        let _ = std::fs::remove_file(&dest);
        return Err(HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "uploads" }),
        ));
    }

    let _ = db::log_event(
        conn,
        &user_id,
        "upload",
        &upload_id,
        "create",
        Some(&json!({ "fileName": file_name, "sizeBytes": size_bytes })),
    );

    Ok(json!({
        "uploadId": upload_id,
        "fileName": file_name,
        "sizeBytes": size_bytes,
        "sha256": sha256
    }))
}

fn uploads_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_opt_str(params, "activityId");
    let correction_id = get_opt_str(params, "correctionId");

    let (sql, binds): (&str, Vec<String>) = match (activity_id, correction_id) {
        (Some(aid), _) => (
            "SELECT id, activity_id, correction_id, file_name, size_bytes, sha256, created_at
             FROM uploads WHERE user_id = ? AND activity_id = ? ORDER BY created_at DESC",
            vec![user_id, aid],
        ),
        (None, Some(cid)) => (
            "SELECT id, activity_id, correction_id, file_name, size_bytes, sha256, created_at
             FROM uploads WHERE user_id = ? AND correction_id = ? ORDER BY created_at DESC",
            vec![user_id, cid],
        ),
        (None, None) => (
            "SELECT id, activity_id, correction_id, file_name, size_bytes, sha256, created_at
             FROM uploads WHERE user_id = ? ORDER BY created_at DESC",
            vec![user_id],
        ),
    };

    let mut stmt = conn.prepare(sql)?;
    let uploads = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let activity_id: Option<String> = row.get(1)?;
            let correction_id: Option<String> = row.get(2)?;
            let file_name: String = row.get(3)?;
            let size_bytes: i64 = row.get(4)?;
            let sha256: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "activityId": activity_id,
                "correctionId": correction_id,
                "fileName": file_name,
                "sizeBytes": size_bytes,
                "sha256": sha256,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "uploads": uploads }))
}

fn uploads_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let upload_id = get_required_str(params, "uploadId")?;

    let stored_name: Option<String> = conn
        .query_row(
            "SELECT stored_name FROM uploads WHERE id = ? AND user_id = ?",
            (&upload_id, &user_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(stored_name) = stored_name else {
        return Err(HandlerErr::not_found("upload not found"));
    };

    conn.execute("DELETE FROM uploads WHERE id = ?", [&upload_id])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "uploads" }),
            )
        })?;
    // The row is gone; a missing file on disk is not worth failing over.
    let _ = std::fs::remove_file(uploads_dir(workspace).join(&stored_name));

    let _ = db::log_event(conn, &user_id, "upload", &upload_id, "delete", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "uploads.store" => uploads_store(state, &req.params),
        "uploads.list" => uploads_list(state, &req.params),
        "uploads.delete" => uploads_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
