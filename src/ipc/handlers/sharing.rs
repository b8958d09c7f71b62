use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    activity_owned, correction_owned, get_opt_str, get_required_str, require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const CODE_LEN: usize = 8;
const CODE_ATTEMPTS: usize = 5;

/// Short uppercase code drawn from a fresh uuid. Retried on the rare unique
/// collision.
fn new_share_code() -> String {
    Uuid::new_v4().simple().to_string()[..CODE_LEN].to_ascii_uppercase()
}

fn share_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let resource_type = get_required_str(params, "resourceType")?;
    let resource_id = get_required_str(params, "resourceId")?;
    let expires_at = get_opt_str(params, "expiresAt");

    if let Some(ref raw) = expires_at {
        if DateTime::parse_from_rfc3339(raw).is_err() {
            return Err(HandlerErr::bad_params("expiresAt must be an RFC 3339 timestamp"));
        }
    }

    let owned = match resource_type.as_str() {
        "activity" => activity_owned(conn, &resource_id, &user_id)?,
        "correction" => correction_owned(conn, &resource_id, &user_id)?,
        _ => {
            return Err(HandlerErr::bad_params(
                "resourceType must be 'activity' or 'correction'",
            ));
        }
    };
    if !owned {
        return Err(HandlerErr::not_found("resource not found"));
    }

    for _ in 0..CODE_ATTEMPTS {
        let code = new_share_code();
        let res = conn.execute(
            "INSERT INTO share_codes(id, code, user_id, resource_type, resource_id, created_at, expires_at, revoked)
             VALUES(?, ?, ?, ?, ?, ?, ?, 0)",
            (
                Uuid::new_v4().to_string(),
                &code,
                &user_id,
                &resource_type,
                &resource_id,
                db::now_rfc3339(),
                &expires_at,
            ),
        );
        match res {
            Ok(_) => {
                let _ = db::log_event(
                    conn,
                    &user_id,
                    &resource_type,
                    &resource_id,
                    "share",
                    Some(&json!({ "code": code })),
                );
                return Ok(json!({ "code": code, "expiresAt": expires_at }));
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                continue;
            }
            Err(e) => return Err(HandlerErr::new("db_insert_failed", e.to_string())),
        }
    }
    Err(HandlerErr::new(
        "conflict",
        "could not allocate a unique share code",
    ))
}

fn share_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;

    let mut stmt = conn.prepare(
        "SELECT code, resource_type, resource_id, created_at, expires_at, revoked
         FROM share_codes
         WHERE user_id = ?
         ORDER BY created_at DESC",
    )?;
    let codes = stmt
        .query_map([&user_id], |row| {
            let code: String = row.get(0)?;
            let resource_type: String = row.get(1)?;
            let resource_id: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            let expires_at: Option<String> = row.get(4)?;
            let revoked: i64 = row.get(5)?;
            Ok(json!({
                "code": code,
                "resourceType": resource_type,
                "resourceId": resource_id,
                "createdAt": created_at,
                "expiresAt": expires_at,
                "revoked": revoked != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "codes": codes }))
}

fn share_revoke(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let code = get_required_str(params, "code")?;

    let n = conn
        .execute(
            "UPDATE share_codes SET revoked = 1 WHERE code = ? AND user_id = ?",
            (&code, &user_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::not_found("share code not found"));
    }
    Ok(json!({ "ok": true }))
}

fn activity_snapshot(conn: &Connection, activity_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row: Option<(String, Option<String>, Option<String>, String, String)> = conn
        .query_row(
            "SELECT title, subject, date, points, parts_names FROM activities WHERE id = ?",
            [activity_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((title, subject, date, points_raw, names_raw)) = row else {
        return Ok(None);
    };
    Ok(Some(json!({
        "title": title,
        "subject": subject,
        "date": date,
        "points": db::decode_f64_array(&points_raw)?,
        "partsNames": db::decode_string_array(&names_raw)?
    })))
}

/// Consultation endpoint: no sign-in required, only a live code.
fn share_resolve(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let code = get_required_str(params, "code")?;

    let row: Option<(String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT resource_type, resource_id, expires_at, revoked FROM share_codes WHERE code = ?",
            [&code],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((resource_type, resource_id, expires_at, revoked)) = row else {
        return Err(HandlerErr::not_found("unknown share code"));
    };
    if revoked != 0 {
        return Err(HandlerErr::not_found("share code revoked"));
    }
    if let Some(raw) = expires_at {
        if let Ok(exp) = DateTime::parse_from_rfc3339(&raw) {
            if exp < Utc::now() {
                return Err(HandlerErr::not_found("share code expired"));
            }
        }
    }

    match resource_type.as_str() {
        "activity" => {
            let activity = activity_snapshot(conn, &resource_id)?
                .ok_or_else(|| HandlerErr::not_found("shared activity no longer exists"))?;
            Ok(json!({ "resourceType": "activity", "activity": activity }))
        }
        "correction" => {
            let row: Option<(String, Option<String>, f64, Option<f64>, String, Option<f64>, Option<f64>, Option<f64>, Option<String>)> = conn
                .query_row(
                    "SELECT activity_id, points_earned, penalty, bonus, status,
                            grade, final_grade, percentage_grade, comment
                     FROM corrections WHERE id = ?",
                    [&resource_id],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                            r.get(7)?,
                            r.get(8)?,
                        ))
                    },
                )
                .optional()?;
            let Some((
                activity_id,
                earned_raw,
                penalty,
                bonus,
                status,
                grade_v,
                final_v,
                pct_v,
                comment,
            )) = row
            else {
                return Err(HandlerErr::not_found("shared correction no longer exists"));
            };
            let activity = activity_snapshot(conn, &activity_id)?
                .ok_or_else(|| HandlerErr::not_found("shared correction no longer exists"))?;
            let points_earned = match earned_raw {
                Some(raw) => Some(db::decode_f64_array(&raw)?),
                None => None,
            };
            Ok(json!({
                "resourceType": "correction",
                "activity": activity,
                "correction": {
                    "pointsEarned": points_earned,
                    "penalty": penalty,
                    "bonus": bonus,
                    "status": status,
                    "grade": grade_v,
                    "finalGrade": final_v,
                    "percentageGrade": pct_v,
                    "comment": comment
                }
            }))
        }
        other => Err(HandlerErr::with_details(
            "db_query_failed",
            "share code references unknown resource type",
            json!({ "resourceType": other }),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "share.create" => share_create(state, &req.params),
        "share.list" => share_list(state),
        "share.revoke" => share_revoke(state, &req.params),
        "share.resolve" => share_resolve(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
