use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, require_db, respond};
use crate::ipc::types::{AppState, Request};
use crate::semester::{
    is_semester_expired, normalize_semester, parse_date_time, EnforcementPolicy,
};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

/// Semester id to store on a new grade or attendance row.
///
/// In strict mode (once active) the id is mandatory: the caller's candidate
/// or else the active semester, and it must not be past its end date. In
/// relaxed mode the candidate is stored as given.
pub(crate) fn semester_for_new_record(
    conn: &Connection,
    policy: &EnforcementPolicy,
    candidate: Option<String>,
) -> Result<Option<String>, HandlerErr> {
    if let Some(id) = candidate.as_deref() {
        crate::ipc::helpers::require_row(conn, "semesters", id, "semester")?;
    }

    if policy.should_attach_semester_id(candidate.as_deref()) {
        let Some(semester_id) = candidate.or_else(|| policy.active_semester_id().map(str::to_string))
        else {
            return Err(HandlerErr::new("semester_required", "no semester available"));
        };
        let Some(record) = db::semester_record(conn, &semester_id)? else {
            return Err(HandlerErr::not_found("active semester no longer exists")
                .with_details(json!({ "semesterId": semester_id })));
        };
        let metadata = normalize_semester(Some(&record)).unwrap_or_default();
        if is_semester_expired(&metadata) {
            tracing::warn!(semester = %semester_id, "rejecting record for expired semester");
            return Err(HandlerErr::new("semester_expired", "semester has ended").with_details(
                json!({
                    "semesterId": semester_id,
                    "tanggalSelesai": metadata.tanggal_selesai
                }),
            ));
        }
        return Ok(Some(semester_id));
    }

    if policy.is_strict_active() {
        tracing::warn!("rejecting record without semester in strict mode");
        return Err(HandlerErr::new(
            "semester_required",
            "strict mode requires a semester id and no semester is active",
        ));
    }
    Ok(candidate)
}

fn validate_settings_patch(current: &mut Map<String, Value>, params: &Value) -> Result<(), HandlerErr> {
    if let Some(mode) = params.get("mode") {
        let Some(raw) = mode.as_str() else {
            return Err(HandlerErr::bad_params("mode must be string"));
        };
        let raw = raw.trim().to_ascii_lowercase();
        if raw != "strict" && raw != "relaxed" {
            return Err(HandlerErr::bad_params("mode must be one of: strict, relaxed"));
        }
        current.insert("mode".into(), Value::String(raw));
    }
    if params.get("activationDate").is_some() {
        match get_optional_str(params, "activationDate")? {
            None => {
                current.insert("activationDate".into(), Value::Null);
            }
            Some(raw) => {
                if parse_date_time(&raw).is_none() {
                    return Err(HandlerErr::bad_params(
                        "activationDate must be a date or timestamp",
                    ));
                }
                current.insert("activationDate".into(), Value::String(raw));
            }
        }
    }
    Ok(())
}

/// Saved settings to patch. An unreadable row is replaced rather than
/// blocking the update, since the update is how it gets repaired.
fn stored_settings(conn: &Connection) -> Map<String, Value> {
    match db::settings_get_json(conn, db::ENFORCEMENT_SETTINGS_KEY) {
        Ok(saved) => saved.and_then(|v| v.as_object().cloned()).unwrap_or_default(),
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(
                key = db::ENFORCEMENT_SETTINGS_KEY,
                error = %message,
                "stored enforcement settings unreadable; starting from defaults"
            );
            Map::new()
        }
    }
}

fn handle_enforcement_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<Value, HandlerErr> {
        let conn = require_db(state.db.as_ref())?;
        let mut current = stored_settings(conn);
        validate_settings_patch(&mut current, &req.params)?;
        db::settings_set_json(conn, db::ENFORCEMENT_SETTINGS_KEY, &Value::Object(current))
            .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
        state
            .enforcement
            .refresh(&db::WorkspaceSettingsSource { conn });
        Ok(state.enforcement.to_json())
    })();
    respond(&req.id, result)
}

fn handle_enforcement_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    state
        .enforcement
        .refresh(&db::WorkspaceSettingsSource { conn });
    ok(&req.id, state.enforcement.to_json())
}

fn handle_enforcement_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = get_optional_str(&req.params, "semesterId").map(|candidate| {
        let policy = &state.enforcement;
        let attach = policy.should_attach_semester_id(candidate.as_deref());
        let semester_id = if attach {
            candidate.or_else(|| policy.active_semester_id().map(str::to_string))
        } else {
            candidate
        };
        json!({
            "attach": attach,
            "semesterId": semester_id,
            "required": policy.is_strict_active(),
        })
    });
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enforcement.get" => Some(ok(&req.id, state.enforcement.to_json())),
        "enforcement.update" => Some(handle_enforcement_update(state, req)),
        "enforcement.refresh" => Some(handle_enforcement_refresh(state, req)),
        "enforcement.check" => Some(handle_enforcement_check(state, req)),
        _ => None,
    }
}
