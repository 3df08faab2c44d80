use crate::calc::{self, AttendanceStatus, AttendanceTally};
use crate::ipc::error::{DbResultExt, HandlerErr};
use crate::ipc::handlers::enforcement::semester_for_new_record;
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_str, require_db, require_row, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::semester::EnforcementPolicy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

fn parse_status(params: &Value) -> Result<AttendanceStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    AttendanceStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("status must be one of: hadir, sakit, izin, alpa"))
}

fn attendance_record(
    conn: &Connection,
    policy: &EnforcementPolicy,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(date) = get_optional_date(params, "date")? else {
        return Err(HandlerErr::bad_params("missing date"));
    };
    let status = parse_status(params)?;
    let note = get_optional_str(params, "note")?;
    require_row(conn, "students", &student_id, "student")?;

    let semester_id =
        semester_for_new_record(conn, policy, get_optional_str(params, "semesterId")?)?;

    // One row per student per day; re-recording the day replaces it.
    conn.execute(
        "INSERT INTO attendance(id, student_id, semester_id, date, status, note)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           semester_id = excluded.semester_id,
           status = excluded.status,
           note = excluded.note",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &semester_id,
            &date,
            status.as_str(),
            &note,
        ),
    )
    .db_err("db_update_failed", "attendance")?;
    Ok(json!({ "ok": true, "date": date, "semesterId": semester_id }))
}

struct AttendanceFilter {
    class_id: Option<String>,
    student_id: Option<String>,
    semester_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

impl AttendanceFilter {
    fn from_params(params: &Value) -> Result<Self, HandlerErr> {
        let f = Self {
            class_id: get_optional_str(params, "classId")?,
            student_id: get_optional_str(params, "studentId")?,
            semester_id: get_optional_str(params, "semesterId")?,
            from: get_optional_date(params, "from")?,
            to: get_optional_date(params, "to")?,
        };
        if let (Some(from), Some(to)) = (&f.from, &f.to) {
            if from > to {
                return Err(HandlerErr::bad_params("from must not be after to"));
            }
        }
        Ok(f)
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<SqlValue> = Vec::new();
        let mut push = |clause: &'static str, v: &Option<String>| {
            if let Some(v) = v {
                clauses.push(clause);
                binds.push(SqlValue::Text(v.clone()));
            }
        };
        push("s.class_id = ?", &self.class_id);
        push("a.student_id = ?", &self.student_id);
        push("a.semester_id = ?", &self.semester_id);
        push("a.date >= ?", &self.from);
        push("a.date <= ?", &self.to);
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (sql, binds)
    }
}

fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = AttendanceFilter::from_params(params)?;
    let (where_sql, binds) = filter.where_clause();
    let sql = format!(
        "SELECT a.id, a.student_id, s.name, a.semester_id, a.date, a.status, a.note
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         {}
         ORDER BY a.date, s.class_id, s.sort_order",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "semesterId": r.get::<_, Option<String>>(3)?,
                "date": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "note": r.get::<_, Option<String>>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "attendance": rows }))
}

/// Per-student tallies for the filtered rows, keyed by student id.
pub(crate) fn tally_by_student(
    conn: &Connection,
    params: &Value,
) -> Result<BTreeMap<String, AttendanceTally>, HandlerErr> {
    let filter = AttendanceFilter::from_params(params)?;
    let (where_sql, binds) = filter.where_clause();
    let sql = format!(
        "SELECT a.student_id, a.status
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         {}",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_student: BTreeMap<String, Vec<AttendanceStatus>> = BTreeMap::new();
    for (student_id, status) in rows {
        // Rows are only ever written through parse_status; anything else is
        // skipped rather than failing the whole summary.
        if let Some(s) = AttendanceStatus::parse(&status) {
            by_student.entry(student_id).or_default().push(s);
        }
    }
    Ok(by_student
        .into_iter()
        .map(|(id, statuses)| (id, calc::tally_attendance(statuses)))
        .collect())
}

fn attendance_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tallies = tally_by_student(conn, params)?;
    let mut class_total = AttendanceTally::default();
    let students: Vec<Value> = tallies
        .iter()
        .map(|(student_id, t)| {
            class_total.hadir += t.hadir;
            class_total.sakit += t.sakit;
            class_total.izin += t.izin;
            class_total.alpa += t.alpa;
            json!({
                "studentId": student_id,
                "tally": t,
                "total": t.total(),
                "presencePercent": t.presence_percent(),
            })
        })
        .collect();
    Ok(json!({
        "students": students,
        "total": class_total,
        "presencePercent": class_total.presence_percent(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let conn = require_db(state.db.as_ref());
    let result = match req.method.as_str() {
        "attendance.record" => {
            conn.and_then(|c| attendance_record(c, &state.enforcement, &req.params))
        }
        "attendance.list" => conn.and_then(|c| attendance_list(c, &req.params)),
        "attendance.summary" => conn.and_then(|c| attendance_summary(c, &req.params)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
