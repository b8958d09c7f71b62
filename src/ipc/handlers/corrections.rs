use crate::db;
use crate::grade;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    activity_owned, correction_owned, get_bool_array, get_f64_array, get_opt_str,
    get_required_str, require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn correction_json(conn: &Connection, correction_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row: Option<(
        String,
        String,
        Option<String>,
        Option<String>,
        f64,
        Option<f64>,
        Option<String>,
        String,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<String>,
        String,
        String,
    )> = conn
        .query_row(
            "SELECT id, activity_id, student_id, points_earned, penalty, bonus, disabled_parts,
                    status, grade, final_grade, percentage_grade, comment, created_at, updated_at
             FROM corrections WHERE id = ?",
            [correction_id],
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
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                    r.get(12)?,
                    r.get(13)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        activity_id,
        student_id,
        earned_raw,
        penalty,
        bonus,
        disabled_raw,
        status,
        grade_v,
        final_v,
        pct_v,
        comment,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let points_earned = match earned_raw {
        Some(raw) => Some(db::decode_f64_array(&raw)?),
        None => None,
    };
    let disabled_parts = match disabled_raw {
        Some(raw) => Some(db::decode_bool_array(&raw)?),
        None => None,
    };

    Ok(Some(json!({
        "id": id,
        "activityId": activity_id,
        "studentId": student_id,
        "pointsEarned": points_earned,
        "penalty": penalty,
        "bonus": bonus,
        "disabledParts": disabled_parts,
        "status": status,
        "grade": grade_v,
        "finalGrade": final_v,
        "percentageGrade": pct_v,
        "comment": comment,
        "createdAt": created_at,
        "updatedAt": updated_at
    })))
}

fn corrections_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }

    let mut stmt = conn.prepare(
        "SELECT c.id, c.student_id, s.last_name, s.first_name, c.status,
                c.grade, c.final_grade, c.percentage_grade, c.updated_at
         FROM corrections c
         LEFT JOIN students s ON s.id = c.student_id
         WHERE c.activity_id = ?
         ORDER BY s.sort_order, c.created_at",
    )?;
    let corrections = stmt
        .query_map([&activity_id], |row| {
            let id: String = row.get(0)?;
            let student_id: Option<String> = row.get(1)?;
            let last_name: Option<String> = row.get(2)?;
            let first_name: Option<String> = row.get(3)?;
            let status: String = row.get(4)?;
            let grade_v: Option<f64> = row.get(5)?;
            let final_v: Option<f64> = row.get(6)?;
            let pct_v: Option<f64> = row.get(7)?;
            let updated_at: String = row.get(8)?;
            let display_name = match (&last_name, &first_name) {
                (Some(l), Some(f)) => Some(format!("{}, {}", l, f)),
                _ => None,
            };
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "displayName": display_name,
                "status": status,
                "grade": grade_v,
                "finalGrade": final_v,
                "percentageGrade": pct_v,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "corrections": corrections }))
}

fn corrections_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }
    let max_points = db::activity_max_points(conn, &activity_id)?
        .ok_or_else(|| HandlerErr::not_found("activity not found"))?;

    let student_id = get_opt_str(params, "studentId");
    if let Some(ref sid) = student_id {
        let belongs: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students s
                 JOIN classes c ON c.id = s.class_id
                 WHERE s.id = ? AND c.user_id = ?",
                (sid, &user_id),
                |r| r.get(0),
            )
            .optional()?;
        if belongs.is_none() {
            return Err(HandlerErr::not_found("student not found"));
        }
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM corrections WHERE activity_id = ? AND student_id = ?",
                (&activity_id, sid),
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(HandlerErr::new(
                "conflict",
                "student already has a correction for this activity",
            ));
        }
    }

    // New corrections start ACTIVE with zeroed earned points.
    let earned = vec![0.0_f64; max_points.len()];
    let correction_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO corrections(id, activity_id, student_id, points_earned, penalty, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, 0, 'ACTIVE', ?, ?)",
        (
            &correction_id,
            &activity_id,
            &student_id,
            db::encode_f64_array(&earned),
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "corrections" }))
    })?;
    db::recompute_correction(conn, &correction_id)?;

    let _ = db::log_event(
        conn,
        &user_id,
        "correction",
        &correction_id,
        "create",
        Some(&json!({ "activityId": activity_id })),
    );

    let correction = correction_json(conn, &correction_id)?
        .ok_or_else(|| HandlerErr::not_found("correction not found"))?;
    Ok(json!({ "correction": correction }))
}

fn corrections_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let correction_id = get_required_str(params, "correctionId")?;

    if !correction_owned(conn, &correction_id, &user_id)? {
        return Err(HandlerErr::not_found("correction not found"));
    }
    let correction = correction_json(conn, &correction_id)?
        .ok_or_else(|| HandlerErr::not_found("correction not found"))?;
    Ok(json!({ "correction": correction }))
}

/// Grading inputs: earned points, penalty, bonus, disabled-parts mask. Any
/// subset may be supplied. All supplied fields are validated before anything
/// is written; the writes and the recompute land in one transaction so the
/// stored inputs and the derived grade columns never diverge.
fn corrections_update_points(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let correction_id = get_required_str(params, "correctionId")?;

    if !correction_owned(conn, &correction_id, &user_id)? {
        return Err(HandlerErr::not_found("correction not found"));
    }

    let activity_id: String = conn.query_row(
        "SELECT activity_id FROM corrections WHERE id = ?",
        [&correction_id],
        |r| r.get(0),
    )?;
    let max_points = db::activity_max_points(conn, &activity_id)?
        .ok_or_else(|| HandlerErr::not_found("activity not found"))?;
    let part_count = max_points.len();

    let earned = get_f64_array(params, "pointsEarned")?;
    if let Some(ref earned) = earned {
        if earned.len() != part_count {
            return Err(HandlerErr::with_details(
                "bad_params",
                "pointsEarned length must match the activity's parts",
                json!({ "expected": part_count, "got": earned.len() }),
            ));
        }
        for (i, v) in earned.iter().enumerate() {
            if *v < 0.0 {
                return Err(HandlerErr::with_details(
                    "bad_params",
                    "earned points must not be negative",
                    json!({ "index": i, "value": v }),
                ));
            }
        }
    }

    let penalty = params.get("penalty").and_then(|v| v.as_f64());
    if let Some(p) = penalty {
        if p < 0.0 {
            return Err(HandlerErr::bad_params("penalty must not be negative"));
        }
    }

    // Outer None: absent. Inner None: explicit null, clears the bonus.
    let bonus: Option<Option<f64>> = match params.get("bonus") {
        None => None,
        Some(raw) if raw.is_null() => Some(None),
        Some(raw) => {
            let Some(b) = raw.as_f64() else {
                return Err(HandlerErr::bad_params("bonus must be a number or null"));
            };
            if b < 0.0 {
                return Err(HandlerErr::bad_params("bonus must not be negative"));
            }
            Some(Some(b))
        }
    };

    let disabled: Option<Option<Vec<bool>>> = match params.get("disabledParts") {
        None => None,
        Some(_) => {
            let mask = get_bool_array(params, "disabledParts")?;
            if let Some(ref m) = mask {
                if m.len() != part_count {
                    return Err(HandlerErr::with_details(
                        "bad_params",
                        "disabledParts length must match the activity's parts",
                        json!({ "expected": part_count, "got": m.len() }),
                    ));
                }
            }
            Some(mask)
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    if let Some(ref earned) = earned {
        tx.execute(
            "UPDATE corrections SET points_earned = ? WHERE id = ?",
            (db::encode_f64_array(earned), &correction_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(p) = penalty {
        tx.execute(
            "UPDATE corrections SET penalty = ? WHERE id = ?",
            (p, &correction_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(b) = bonus {
        tx.execute(
            "UPDATE corrections SET bonus = ? WHERE id = ?",
            (b, &correction_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(mask) = disabled {
        tx.execute(
            "UPDATE corrections SET disabled_parts = ? WHERE id = ?",
            (mask.as_deref().map(db::encode_bool_array), &correction_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    db::recompute_correction(&tx, &correction_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let _ = db::log_event(conn, &user_id, "correction", &correction_id, "grade", None);

    let correction = correction_json(conn, &correction_id)?
        .ok_or_else(|| HandlerErr::not_found("correction not found"))?;
    Ok(json!({ "correction": correction }))
}

/// Status transitions are unrestricted: any status may move to any other by
/// explicit user action, and re-asserting the current one is a no-op.
fn corrections_set_status(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let correction_id = get_required_str(params, "correctionId")?;
    let status_raw = get_required_str(params, "status")?;

    let Some(status) = grade::GradeStatus::parse(&status_raw) else {
        return Err(HandlerErr::with_details(
            "bad_params",
            "status must be one of: ACTIVE, DEACTIVATED, ABSENT, NON_RENDU, NON_NOTE",
            json!({ "status": status_raw }),
        ));
    };

    if !correction_owned(conn, &correction_id, &user_id)? {
        return Err(HandlerErr::not_found("correction not found"));
    }

    conn.execute(
        "UPDATE corrections SET status = ? WHERE id = ?",
        (status.as_str(), &correction_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    db::recompute_correction(conn, &correction_id)?;

    let _ = db::log_event(
        conn,
        &user_id,
        "correction",
        &correction_id,
        "status",
        Some(&json!({ "status": status.as_str() })),
    );

    let correction = correction_json(conn, &correction_id)?
        .ok_or_else(|| HandlerErr::not_found("correction not found"))?;
    Ok(json!({ "correction": correction }))
}

fn corrections_update_comment(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let correction_id = get_required_str(params, "correctionId")?;

    if !correction_owned(conn, &correction_id, &user_id)? {
        return Err(HandlerErr::not_found("correction not found"));
    }

    let comment = match params.get("comment") {
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| HandlerErr::bad_params("comment must be a string or null"))?
                .to_string(),
        ),
        None => return Err(HandlerErr::bad_params("missing comment")),
    };

    conn.execute(
        "UPDATE corrections SET comment = ?, updated_at = ? WHERE id = ?",
        (&comment, db::now_rfc3339(), &correction_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let _ = db::log_event(conn, &user_id, "correction", &correction_id, "comment", None);
    Ok(json!({ "ok": true }))
}

fn corrections_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let correction_id = get_required_str(params, "correctionId")?;

    if !correction_owned(conn, &correction_id, &user_id)? {
        return Err(HandlerErr::not_found("correction not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let steps: &[(&str, &str)] = &[
        ("uploads", "DELETE FROM uploads WHERE correction_id = ?1"),
        (
            "share_codes",
            "DELETE FROM share_codes WHERE resource_type = 'correction' AND resource_id = ?1",
        ),
        ("corrections", "DELETE FROM corrections WHERE id = ?1"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&correction_id]) {
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

    let _ = db::log_event(conn, &user_id, "correction", &correction_id, "delete", None);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "corrections.list" => corrections_list(state, &req.params),
        "corrections.create" => corrections_create(state, &req.params),
        "corrections.get" => corrections_get(state, &req.params),
        "corrections.updatePoints" => corrections_update_points(state, &req.params),
        "corrections.setStatus" => corrections_set_status(state, &req.params),
        "corrections.updateComment" => corrections_update_comment(state, &req.params),
        "corrections.delete" => corrections_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
