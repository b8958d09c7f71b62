use crate::db;
use crate::grade;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{
    activity_owned, class_owned, get_f64_array, get_opt_str, get_required_str, get_string_array,
    require_db, require_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// The points/parts layout invariant: parallel arrays of equal length, every
/// maximum strictly positive.
fn validate_parts(points: &[f64], parts_names: &[String]) -> Result<(), HandlerErr> {
    if points.len() != parts_names.len() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "points and partsNames must have the same length",
            json!({ "points": points.len(), "partsNames": parts_names.len() }),
        ));
    }
    if points.is_empty() {
        return Err(HandlerErr::bad_params("an activity needs at least one part"));
    }
    for (i, p) in points.iter().enumerate() {
        if !p.is_finite() || *p <= 0.0 {
            return Err(HandlerErr::with_details(
                "bad_params",
                "each part maximum must be a positive number",
                json!({ "index": i }),
            ));
        }
    }
    Ok(())
}

fn activity_row_json(conn: &Connection, activity_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row: Option<(
        String,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        String,
        String,
    )> = conn
        .query_row(
            "SELECT id, class_id, title, subject, date, points, parts_names, created_at, updated_at
             FROM activities WHERE id = ?",
            [activity_id],
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

    let Some((id, class_id, title, subject, date, points_raw, names_raw, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    let points = db::decode_f64_array(&points_raw)?;
    let parts_names = db::decode_string_array(&names_raw)?;
    Ok(Some(json!({
        "id": id,
        "classId": class_id,
        "title": title,
        "subject": subject,
        "date": date,
        "points": points,
        "partsNames": parts_names,
        "maxTotal": grade::enabled_max_total(&points, None),
        "createdAt": created_at,
        "updatedAt": updated_at
    })))
}

fn activities_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let class_filter = get_opt_str(params, "classId");

    if let Some(ref cid) = class_filter {
        if !class_owned(conn, cid, &user_id)? {
            return Err(HandlerErr::not_found("class not found"));
        }
    }

    let (sql, binds): (&str, Vec<String>) = match class_filter {
        Some(cid) => (
            "SELECT
               a.id, a.class_id, a.title, a.subject, a.date, a.points, a.updated_at,
               (SELECT COUNT(*) FROM corrections c WHERE c.activity_id = a.id) AS correction_count
             FROM activities a
             WHERE a.user_id = ? AND a.class_id = ?
             ORDER BY a.date IS NULL, a.date DESC, a.title",
            vec![user_id.clone(), cid],
        ),
        None => (
            "SELECT
               a.id, a.class_id, a.title, a.subject, a.date, a.points, a.updated_at,
               (SELECT COUNT(*) FROM corrections c WHERE c.activity_id = a.id) AS correction_count
             FROM activities a
             WHERE a.user_id = ?
             ORDER BY a.date IS NULL, a.date DESC, a.title",
            vec![user_id.clone()],
        ),
    };

    let mut stmt = conn.prepare(sql)?;
    let activities = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let class_id: Option<String> = row.get(1)?;
            let title: String = row.get(2)?;
            let subject: Option<String> = row.get(3)?;
            let date: Option<String> = row.get(4)?;
            let points_raw: String = row.get(5)?;
            let updated_at: String = row.get(6)?;
            let correction_count: i64 = row.get(7)?;
            Ok((id, class_id, title, subject, date, points_raw, updated_at, correction_count))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut out = Vec::with_capacity(activities.len());
    for (id, class_id, title, subject, date, points_raw, updated_at, correction_count) in activities
    {
        let points = db::decode_f64_array(&points_raw)?;
        out.push(json!({
            "id": id,
            "classId": class_id,
            "title": title,
            "subject": subject,
            "date": date,
            "partCount": points.len(),
            "maxTotal": grade::enabled_max_total(&points, None),
            "correctionCount": correction_count,
            "updatedAt": updated_at
        }));
    }

    Ok(json!({ "activities": out }))
}

fn activities_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;

    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let points = get_f64_array(params, "points")?
        .ok_or_else(|| HandlerErr::bad_params("missing points[]"))?;
    let parts_names = get_string_array(params, "partsNames")?
        .ok_or_else(|| HandlerErr::bad_params("missing partsNames[]"))?;
    validate_parts(&points, &parts_names)?;

    let class_id = get_opt_str(params, "classId");
    if let Some(ref cid) = class_id {
        if !class_owned(conn, cid, &user_id)? {
            return Err(HandlerErr::not_found("class not found"));
        }
    }
    let subject = get_opt_str(params, "subject");
    let date = get_opt_str(params, "date");

    let activity_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO activities(id, user_id, class_id, title, subject, date, points, parts_names, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &activity_id,
            &user_id,
            &class_id,
            &title,
            &subject,
            &date,
            db::encode_f64_array(&points),
            db::encode_string_array(&parts_names),
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "activities" }))
    })?;

    let _ = db::log_event(
        conn,
        &user_id,
        "activity",
        &activity_id,
        "create",
        Some(&json!({ "title": title, "partCount": points.len() })),
    );

    Ok(json!({ "activityId": activity_id }))
}

fn activities_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }
    let activity = activity_row_json(conn, &activity_id)?
        .ok_or_else(|| HandlerErr::not_found("activity not found"))?;
    Ok(json!({ "activity": activity }))
}

fn activities_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }

    let new_points = get_f64_array(params, "points")?;
    let new_names = get_string_array(params, "partsNames")?;

    // A part-layout change must land with both arrays so the length invariant
    // can be checked against the final state.
    let layout = match (new_points, new_names) {
        (None, None) => None,
        (Some(p), Some(n)) => {
            validate_parts(&p, &n)?;
            Some((p, n))
        }
        _ => {
            return Err(HandlerErr::bad_params(
                "points and partsNames must be updated together",
            ));
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let apply = |sql: &str, v: &dyn rusqlite::ToSql| -> Result<(), HandlerErr> {
        tx.execute(sql, rusqlite::params![v, &activity_id])
            .map(|_| ())
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
    };

    if let Some(title) = get_opt_str(params, "title") {
        let title = title.trim().to_string();
        if title.is_empty() {
            // Dropping the transaction rolls it back.
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        apply("UPDATE activities SET title = ? WHERE id = ?", &title)?;
    }
    if let Some(subject) = get_opt_str(params, "subject") {
        apply("UPDATE activities SET subject = ? WHERE id = ?", &subject)?;
    }
    if let Some(date) = get_opt_str(params, "date") {
        apply("UPDATE activities SET date = ? WHERE id = ?", &date)?;
    }

    let layout_changed = layout.is_some();
    if let Some((points, names)) = layout {
        apply(
            "UPDATE activities SET points = ? WHERE id = ?",
            &db::encode_f64_array(&points),
        )?;
        apply(
            "UPDATE activities SET parts_names = ? WHERE id = ?",
            &db::encode_string_array(&names),
        )?;
        // Existing corrections must follow the new part count before their
        // grades can mean anything.
        db::reconcile_activity_corrections(&tx, &activity_id)?;
    }

    tx.execute(
        "UPDATE activities SET updated_at = ? WHERE id = ?",
        (db::now_rfc3339(), &activity_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let _ = db::log_event(
        conn,
        &user_id,
        "activity",
        &activity_id,
        "update",
        Some(&json!({ "layoutChanged": layout_changed })),
    );

    Ok(json!({ "ok": true, "reconciled": layout_changed }))
}

fn activities_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let steps: &[(&str, &str)] = &[
        (
            "uploads",
            "DELETE FROM uploads
             WHERE activity_id = ?1
                OR correction_id IN (SELECT id FROM corrections WHERE activity_id = ?1)",
        ),
        (
            "share_codes",
            "DELETE FROM share_codes
             WHERE (resource_type = 'activity' AND resource_id = ?1)
                OR (resource_type = 'correction'
                    AND resource_id IN (SELECT id FROM corrections WHERE activity_id = ?1))",
        ),
        ("corrections", "DELETE FROM corrections WHERE activity_id = ?1"),
        ("activities", "DELETE FROM activities WHERE id = ?1"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&activity_id]) {
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

    let _ = db::log_event(conn, &user_id, "activity", &activity_id, "delete", None);
    Ok(json!({ "ok": true }))
}

/// Per-correction final grades plus a class average over graded ACTIVE
/// corrections, with counts per lifecycle status.
fn activities_summary(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;
    let activity_id = get_required_str(params, "activityId")?;

    if !activity_owned(conn, &activity_id, &user_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }
    let activity = activity_row_json(conn, &activity_id)?
        .ok_or_else(|| HandlerErr::not_found("activity not found"))?;

    let mut stmt = conn.prepare(
        "SELECT c.id, c.student_id, s.last_name, s.first_name, c.status,
                c.grade, c.final_grade, c.percentage_grade
         FROM corrections c
         LEFT JOIN students s ON s.id = c.student_id
         WHERE c.activity_id = ?
         ORDER BY s.sort_order, c.created_at",
    )?;
    let rows = stmt
        .query_map([&activity_id], |row| {
            let id: String = row.get(0)?;
            let student_id: Option<String> = row.get(1)?;
            let last_name: Option<String> = row.get(2)?;
            let first_name: Option<String> = row.get(3)?;
            let status: String = row.get(4)?;
            let grade: Option<f64> = row.get(5)?;
            let final_grade: Option<f64> = row.get(6)?;
            let percentage_grade: Option<f64> = row.get(7)?;
            Ok((
                id,
                student_id,
                last_name,
                first_name,
                status,
                grade,
                final_grade,
                percentage_grade,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut per_correction = Vec::with_capacity(rows.len());
    let mut status_counts = serde_json::Map::new();
    let mut graded_sum = 0.0_f64;
    let mut graded_count = 0_usize;

    for (id, student_id, last_name, first_name, status, grade_v, final_v, pct_v) in rows {
        let display_name = match (&last_name, &first_name) {
            (Some(l), Some(f)) => Some(format!("{}, {}", l, f)),
            _ => None,
        };
        if status == "ACTIVE" {
            if let Some(f) = final_v {
                graded_sum += f;
                graded_count += 1;
            }
        }
        let counter = status_counts.entry(status.clone()).or_insert(json!(0));
        *counter = json!(counter.as_i64().unwrap_or(0) + 1);

        per_correction.push(json!({
            "correctionId": id,
            "studentId": student_id,
            "displayName": display_name,
            "status": status,
            "grade": grade_v,
            "finalGrade": final_v,
            "percentageGrade": pct_v
        }));
    }

    let average_final = if graded_count > 0 {
        Some(graded_sum / graded_count as f64)
    } else {
        None
    };

    Ok(json!({
        "activity": activity,
        "perCorrection": per_correction,
        "statusCounts": status_counts,
        "gradedCount": graded_count,
        "averageFinalGrade": average_final
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "activities.list" => activities_list(state, &req.params),
        "activities.create" => activities_create(state, &req.params),
        "activities.get" => activities_get(state, &req.params),
        "activities.update" => activities_update(state, &req.params),
        "activities.delete" => activities_delete(state, &req.params),
        "activities.summary" => activities_summary(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
