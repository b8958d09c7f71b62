use crate::backup;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{get_required_str, require_user};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn backup_export(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _user_id = require_user(state)?;
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);

    let summary = backup::export_workspace_bundle(workspace, &out_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;

    tracing::info!(path = %out_path.to_string_lossy(), "workspace bundle exported");
    Ok(json!({
        "bundleFormat": summary.bundle_format,
        "uploadCount": summary.upload_count,
        "outPath": out_path.to_string_lossy()
    }))
}

/// Restores a bundle into a fresh workspace directory. The caller selects the
/// restored workspace afterwards; the current session is untouched.
fn backup_import(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _user_id = require_user(state)?;
    let bundle_path = PathBuf::from(get_required_str(params, "bundlePath")?);
    let workspace_path = PathBuf::from(get_required_str(params, "workspacePath")?);

    let summary = backup::import_workspace_bundle(&bundle_path, &workspace_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;

    Ok(json!({
        "bundleFormatDetected": summary.bundle_format_detected,
        "uploadCount": summary.upload_count,
        "workspacePath": workspace_path.to_string_lossy()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.export" => backup_export(state, &req.params),
        "backup.import" => backup_import(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
