use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::common::{get_opt_str, require_db, require_user};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const LOG_LIST_DEFAULT_LIMIT: i64 = 100;
const LOG_LIST_MAX_LIMIT: i64 = 1000;

fn log_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = require_user(state)?;

    let entity_type = get_opt_str(params, "entityType");
    let entity_id = get_opt_str(params, "entityId");
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(LOG_LIST_DEFAULT_LIMIT);
    if limit <= 0 || limit > LOG_LIST_MAX_LIMIT {
        return Err(HandlerErr::with_details(
            "bad_params",
            "limit out of range",
            json!({ "limit": limit, "maxLimit": LOG_LIST_MAX_LIMIT }),
        ));
    }

    let mut sql = String::from(
        "SELECT entity_type, entity_id, action, details, created_at
         FROM activity_log
         WHERE user_id = ?",
    );
    let mut binds: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Text(user_id)];
    if let Some(et) = entity_type {
        sql.push_str(" AND entity_type = ?");
        binds.push(rusqlite::types::Value::Text(et));
    }
    if let Some(eid) = entity_id {
        sql.push_str(" AND entity_id = ?");
        binds.push(rusqlite::types::Value::Text(eid));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    binds.push(rusqlite::types::Value::Integer(limit));

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let entity_type: String = row.get(0)?;
            let entity_id: String = row.get(1)?;
            let action: String = row.get(2)?;
            let details_raw: Option<String> = row.get(3)?;
            let created_at: String = row.get(4)?;
            Ok((entity_type, entity_id, action, details_raw, created_at))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let entries: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|(entity_type, entity_id, action, details_raw, created_at)| {
            let details = details_raw
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());
            json!({
                "entityType": entity_type,
                "entityId": entity_id,
                "action": action,
                "details": details,
                "createdAt": created_at
            })
        })
        .collect();

    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "log.list" => log_list(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
