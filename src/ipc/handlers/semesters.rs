use crate::db;
use crate::ipc::error::{DbResultExt, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_db, respond};
use crate::ipc::types::{AppState, Request};
use crate::semester::{
    build_semester_date_range, build_semester_label, build_semester_title, explicit_label,
    format_study_days, is_semester_expired, normalize_semester, parse_date,
    resolve_effective_semester_id, resolve_semester_metadata, SemesterField, SemesterMetadata,
    SemesterSelection,
};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Derived values the UI shows next to a semester.
pub(crate) fn semester_view(record: Option<&Value>, metadata: Option<&SemesterMetadata>) -> Value {
    let label = record
        .and_then(|r| build_semester_label(Some(r)))
        .or_else(|| {
            metadata
                .and_then(|m| serde_json::to_value(m).ok())
                .and_then(|v| build_semester_label(Some(&v)))
        })
        .unwrap_or_else(|| "-".to_string());
    json!({
        "metadata": metadata,
        "title": build_semester_title(metadata, true),
        "label": label,
        "dateRange": build_semester_date_range(metadata),
        "studyDays": format_study_days(metadata.and_then(|m| m.jumlah_hari_belajar.as_ref())),
        "expired": metadata.map(is_semester_expired).unwrap_or(false),
    })
}

pub(crate) fn load_semesters(conn: &Connection) -> Result<Vec<(Value, SemesterMetadata)>, HandlerErr> {
    Ok(db::semester_records(conn)?
        .into_iter()
        .filter_map(|r| normalize_semester(Some(&r)).map(|m| (r, m)))
        .collect())
}

/// Columns as stored. Dates are kept as `YYYY-MM-DD`.
#[derive(Debug, Clone, Default)]
struct SemesterRow {
    tahun_ajaran: Option<String>,
    semester_number: Option<String>,
    tanggal_mulai: Option<String>,
    tanggal_selesai: Option<String>,
    jumlah_hari_belajar: Option<String>,
    catatan: String,
    label: Option<String>,
    is_active: bool,
}

fn canonical_date(raw: Option<&str>, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = raw else { return Ok(None) };
    parse_date(raw)
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a date", key)))
}

fn touches(patch: &Map<String, Value>, field: SemesterField) -> bool {
    field.aliases().iter().any(|k| patch.contains_key(*k))
}

impl SemesterRow {
    fn from_record(record: &Map<String, Value>) -> Result<Self, HandlerErr> {
        let mut row = Self::default();
        row.apply_patch(record)?;
        Ok(row)
    }

    /// Overwrites only the attributes the patch mentions under any alias. A
    /// mentioned attribute with an empty value clears it.
    fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), HandlerErr> {
        let patch_value = Value::Object(patch.clone());
        let m = normalize_semester(Some(&patch_value)).unwrap_or_default();
        if touches(patch, SemesterField::TahunAjaran) {
            self.tahun_ajaran = m.tahun_ajaran.map(|s| s.trim().to_string());
        }
        if touches(patch, SemesterField::SemesterNumber) {
            self.semester_number = m.semester_number.map(|n| n.to_string());
        }
        if touches(patch, SemesterField::TanggalMulai) {
            self.tanggal_mulai = canonical_date(m.tanggal_mulai.as_deref(), "tanggalMulai")?;
        }
        if touches(patch, SemesterField::TanggalSelesai) {
            self.tanggal_selesai = canonical_date(m.tanggal_selesai.as_deref(), "tanggalSelesai")?;
        }
        if touches(patch, SemesterField::JumlahHariBelajar) {
            self.jumlah_hari_belajar = m.jumlah_hari_belajar.map(|n| n.to_string());
        }
        if touches(patch, SemesterField::Catatan) {
            self.catatan = m.catatan;
        }
        if touches(patch, SemesterField::Label) {
            self.label = explicit_label(&patch_value);
        }
        if touches(patch, SemesterField::IsActive) {
            self.is_active = m.is_active;
        }
        Ok(())
    }

    fn from_stored(record: &Value) -> Self {
        let m = normalize_semester(Some(record)).unwrap_or_default();
        Self {
            tahun_ajaran: m.tahun_ajaran,
            semester_number: m.semester_number.map(|n| n.to_string()),
            tanggal_mulai: m.tanggal_mulai,
            tanggal_selesai: m.tanggal_selesai,
            jumlah_hari_belajar: m.jumlah_hari_belajar.map(|n| n.to_string()),
            catatan: m.catatan,
            label: record.get("label").and_then(|v| v.as_str()).map(str::to_string),
            is_active: m.is_active,
        }
    }

    fn validate(&self) -> Result<(), HandlerErr> {
        if self.tahun_ajaran.is_none() && self.semester_number.is_none() {
            return Err(HandlerErr::bad_params(
                "semester needs tahunAjaran or semesterNumber",
            ));
        }
        if let (Some(start), Some(end)) = (&self.tanggal_mulai, &self.tanggal_selesai) {
            // Both are canonical YYYY-MM-DD, so string order is date order.
            if start > end {
                return Err(HandlerErr::bad_params(
                    "tanggalMulai must not be after tanggalSelesai",
                ));
            }
        }
        Ok(())
    }
}

fn semesters_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let selected = get_optional_str(params, "selectedId")?;
    let rows = load_semesters(conn)?;
    let metas: Vec<SemesterMetadata> = rows.iter().map(|(_, m)| m.clone()).collect();
    let effective = resolve_effective_semester_id(
        SemesterSelection {
            explicit: None,
            selected: selected.as_deref(),
        },
        &metas,
    );
    let semesters: Vec<Value> = rows
        .iter()
        .map(|(record, meta)| {
            let mut view = semester_view(Some(record), Some(meta));
            view["id"] = json!(meta.id);
            view
        })
        .collect();
    Ok(json!({
        "semesters": semesters,
        "effectiveSemesterId": effective
    }))
}

fn set_only_active(conn: &Connection, semester_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE semesters SET is_active = CASE WHEN id = ? THEN 1 ELSE 0 END",
        [semester_id],
    )
    .db_err("db_update_failed", "semesters")?;
    Ok(())
}

fn semesters_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(record) = params.get("record").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("record must be an object"));
    };
    let row = SemesterRow::from_record(record)?;
    row.validate()?;

    let semester_id = normalize_semester(params.get("record"))
        .and_then(|m| m.usable_id().map(str::to_string))
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if crate::ipc::helpers::row_exists(conn, "semesters", &semester_id)? {
        return Err(HandlerErr::bad_params("semester id already exists")
            .with_details(json!({ "semesterId": semester_id })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO semesters(id, tahun_ajaran, semester_number, tanggal_mulai, tanggal_selesai,
           jumlah_hari_belajar, catatan, label, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0)",
        (
            &semester_id,
            &row.tahun_ajaran,
            &row.semester_number,
            &row.tanggal_mulai,
            &row.tanggal_selesai,
            &row.jumlah_hari_belajar,
            &row.catatan,
            &row.label,
        ),
    )
    .db_err("db_insert_failed", "semesters")?;
    if row.is_active {
        set_only_active(&tx, &semester_id)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "semesterId": semester_id,
        "isActive": row.is_active,
        "activeChanged": row.is_active
    }))
}

fn semesters_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let semester_id = get_required_str(params, "semesterId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let Some(stored) = db::semester_record(conn, &semester_id)? else {
        return Err(HandlerErr::not_found("semester not found"));
    };
    let mut row = SemesterRow::from_stored(&stored);
    let was_active = row.is_active;
    row.apply_patch(patch)?;
    row.validate()?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE semesters SET
           tahun_ajaran = ?, semester_number = ?, tanggal_mulai = ?, tanggal_selesai = ?,
           jumlah_hari_belajar = ?, catatan = ?, label = ?, is_active = ?
         WHERE id = ?",
        (
            &row.tahun_ajaran,
            &row.semester_number,
            &row.tanggal_mulai,
            &row.tanggal_selesai,
            &row.jumlah_hari_belajar,
            &row.catatan,
            &row.label,
            row.is_active as i64,
            &semester_id,
        ),
    )
    .db_err("db_update_failed", "semesters")?;
    if row.is_active && !was_active {
        set_only_active(&tx, &semester_id)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "activeChanged": row.is_active != was_active }))
}

fn semesters_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let semester_id = get_required_str(params, "semesterId")?;
    let Some(stored) = db::semester_record(conn, &semester_id)? else {
        return Err(HandlerErr::not_found("semester not found"));
    };
    let grades: i64 = conn.query_row(
        "SELECT COUNT(*) FROM grades WHERE semester_id = ?",
        [&semester_id],
        |r| r.get(0),
    )?;
    let attendance: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attendance WHERE semester_id = ?",
        [&semester_id],
        |r| r.get(0),
    )?;
    if grades > 0 || attendance > 0 {
        return Err(HandlerErr::new("in_use", "semester still has records")
            .with_details(json!({ "grades": grades, "attendance": attendance })));
    }
    conn.execute("DELETE FROM semesters WHERE id = ?", [&semester_id])
        .db_err("db_delete_failed", "semesters")?;
    let was_active = stored.get("isActive").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok(json!({ "ok": true, "activeChanged": was_active }))
}

fn semesters_set_active(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let semester_id = get_required_str(params, "semesterId")?;
    crate::ipc::helpers::require_row(conn, "semesters", &semester_id, "semester")?;
    set_only_active(conn, &semester_id)?;
    Ok(json!({ "ok": true, "activeChanged": true }))
}

fn semesters_resolve(conn: Option<&Connection>, params: &Value) -> Result<Value, HandlerErr> {
    let explicit = get_optional_str(params, "explicitId")?;
    let selected = get_optional_str(params, "selectedId")?;
    let fallback = params.get("fallback").filter(|v| !v.is_null());

    let records: Vec<Value> = match params.get("semesters") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => db::semester_records(require_db(conn)?)?,
        Some(_) => return Err(HandlerErr::bad_params("semesters must be an array")),
    };
    let rows: Vec<(Value, SemesterMetadata)> = records
        .into_iter()
        .filter_map(|r| normalize_semester(Some(&r)).map(|m| (r, m)))
        .collect();
    let metas: Vec<SemesterMetadata> = rows.iter().map(|(_, m)| m.clone()).collect();

    let selection = SemesterSelection {
        explicit: explicit.as_deref(),
        selected: selected.as_deref(),
    };
    let semester_id = resolve_effective_semester_id(selection, &metas);
    let metadata = resolve_semester_metadata(selection, &metas, fallback);
    let record = rows
        .iter()
        .find(|(_, m)| !semester_id.is_empty() && m.usable_id() == Some(semester_id.as_str()))
        .map(|(r, _)| r)
        .or(fallback);

    let mut view = semester_view(record, metadata.as_ref());
    view["semesterId"] = json!(semester_id);
    Ok(view)
}

fn refresh_enforcement(state: &mut AppState) {
    if let Some(conn) = state.db.as_ref() {
        state
            .enforcement
            .refresh(&db::WorkspaceSettingsSource { conn });
    }
}

/// True when the request targets the semester enforcement currently holds,
/// whose cached copy goes stale on any edit.
fn targets_active_semester(state: &AppState, req: &Request) -> bool {
    let Ok(Some(target)) = get_optional_str(&req.params, "semesterId") else {
        return false;
    };
    state.enforcement.active_semester_id() == Some(target.as_str())
}

/// Runs a mutating handler and re-syncs enforcement when the active semester
/// moved or was edited.
fn mutate(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    let edits_active = targets_active_semester(state, req);
    let result = require_db(state.db.as_ref()).and_then(|conn| f(conn, &req.params));
    if let Ok(v) = &result {
        let active_changed = v
            .get("activeChanged")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if active_changed || edits_active {
            refresh_enforcement(state);
        }
    }
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "semesters.list" => Some(respond(
            &req.id,
            require_db(state.db.as_ref()).and_then(|conn| semesters_list(conn, &req.params)),
        )),
        "semesters.create" => Some(mutate(state, req, semesters_create)),
        "semesters.update" => Some(mutate(state, req, semesters_update)),
        "semesters.delete" => Some(mutate(state, req, semesters_delete)),
        "semesters.setActive" => Some(mutate(state, req, semesters_set_active)),
        "semesters.resolve" => Some(respond(
            &req.id,
            semesters_resolve(state.db.as_ref(), &req.params),
        )),
        _ => None,
    }
}
