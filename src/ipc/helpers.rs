use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::{ok, HandlerErr};

pub fn require_db(db: Option<&Connection>) -> Result<&Connection, HandlerErr> {
    db.ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    get_optional_str(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string param. Absent, null and blank are all `None`; any other
/// non-string type is rejected.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
        Some(serde_json::Value::Number(n)) if key.ends_with("Id") => Ok(Some(n.to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string", key))),
    }
}

pub fn get_optional_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_optional_str(params, key)? else {
        return Ok(None);
    };
    match crate::semester::parse_date(&raw) {
        Some(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        None => Err(HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key))),
    }
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(format!("{} not found", what)))
    }
}
