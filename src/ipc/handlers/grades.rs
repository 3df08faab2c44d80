use crate::calc::{self, GradeRow};
use crate::ipc::error::{DbResultExt, HandlerErr};
use crate::ipc::handlers::enforcement::semester_for_new_record;
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_str, require_db, require_row, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::semester::EnforcementPolicy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

const GRADE_KINDS: [&str; 5] = ["tugas", "ulangan", "uts", "uas", "praktik"];

fn parse_kind(params: &Value) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, "kind")?.to_ascii_lowercase();
    if !GRADE_KINDS.contains(&raw.as_str()) {
        return Err(HandlerErr::bad_params(
            "kind must be one of: tugas, ulangan, uts, uas, praktik",
        ));
    }
    Ok(raw)
}

fn parse_score(v: Option<&Value>) -> Result<f64, HandlerErr> {
    let score = match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| HandlerErr::bad_params("score must be a number"))?;
    if !(0.0..=100.0).contains(&score) {
        return Err(HandlerErr::bad_params("score must be in 0..=100"));
    }
    Ok(score)
}

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn grades_create(
    conn: &Connection,
    policy: &EnforcementPolicy,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let kind = parse_kind(params)?;
    let score = parse_score(params.get("score"))?;
    let date = get_optional_date(params, "date")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    let semester_id =
        semester_for_new_record(conn, policy, get_optional_str(params, "semesterId")?)?;

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, semester_id, kind, score, date, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &subject_id,
            &semester_id,
            &kind,
            score,
            &date,
            now_stamp(),
        ),
    )
    .db_err("db_insert_failed", "grades")?;
    Ok(json!({ "gradeId": grade_id, "semesterId": semester_id }))
}

fn grades_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let existing: Option<(f64, String, Option<String>)> = conn
        .query_row(
            "SELECT score, kind, date FROM grades WHERE id = ?",
            [&grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((mut score, mut kind, mut date)) = existing else {
        return Err(HandlerErr::not_found("grade not found"));
    };

    for key in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match key.as_str() {
            "score" => score = parse_score(patch.get("score"))?,
            "kind" => kind = parse_kind(patch)?,
            "date" => date = get_optional_date(patch, "date")?,
            // Semester membership is fixed at creation so enforcement cannot be
            // sidestepped by editing.
            other => return Err(HandlerErr::bad_params(format!("unknown grade field: {}", other))),
        }
    }

    conn.execute(
        "UPDATE grades SET score = ?, kind = ?, date = ?, updated_at = ? WHERE id = ?",
        (score, &kind, &date, now_stamp(), &grade_id),
    )
    .db_err("db_update_failed", "grades")?;
    Ok(json!({ "ok": true }))
}

fn grades_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let n = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .db_err("db_delete_failed", "grades")?;
    if n == 0 {
        return Err(HandlerErr::not_found("grade not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Filters shared by list and summary. Every filter is optional.
struct GradeFilter {
    class_id: Option<String>,
    subject_id: Option<String>,
    student_id: Option<String>,
    semester_id: Option<String>,
}

impl GradeFilter {
    fn from_params(params: &Value) -> Result<Self, HandlerErr> {
        Ok(Self {
            class_id: get_optional_str(params, "classId")?,
            subject_id: get_optional_str(params, "subjectId")?,
            student_id: get_optional_str(params, "studentId")?,
            semester_id: get_optional_str(params, "semesterId")?,
        })
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<SqlValue> = Vec::new();
        if let Some(v) = &self.class_id {
            clauses.push("s.class_id = ?");
            binds.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &self.subject_id {
            clauses.push("g.subject_id = ?");
            binds.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &self.student_id {
            clauses.push("g.student_id = ?");
            binds.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &self.semester_id {
            clauses.push("g.semester_id = ?");
            binds.push(SqlValue::Text(v.clone()));
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (sql, binds)
    }
}

fn grades_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = GradeFilter::from_params(params)?;
    let (where_sql, binds) = filter.where_clause();
    let sql = format!(
        "SELECT g.id, g.student_id, s.name, g.subject_id, sub.name, g.semester_id,
                g.kind, g.score, g.date
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN subjects sub ON sub.id = g.subject_id
         {}
         ORDER BY s.class_id, s.sort_order, sub.name, g.date, g.rowid",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let grades = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
                "semesterId": r.get::<_, Option<String>>(5)?,
                "kind": r.get::<_, String>(6)?,
                "score": r.get::<_, f64>(7)?,
                "date": r.get::<_, Option<String>>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "grades": grades }))
}

pub(crate) fn load_grade_rows(
    conn: &Connection,
    params: &Value,
) -> Result<(Vec<GradeRow>, HashMap<String, String>), HandlerErr> {
    let filter = GradeFilter::from_params(params)?;
    let (where_sql, binds) = filter.where_clause();
    let sql = format!(
        "SELECT g.student_id, g.subject_id, g.score, sub.name
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN subjects sub ON sub.id = g.subject_id
         {}",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut subject_names = HashMap::new();
    let rows: Vec<GradeRow> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                GradeRow {
                    student_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    score: r.get(2)?,
                },
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(row, subject_name)| {
            subject_names.insert(row.subject_id.clone(), subject_name);
            row
        })
        .collect();
    Ok((rows, subject_names))
}

fn grades_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (rows, subject_names) = load_grade_rows(conn, params)?;
    let summaries = calc::summarize_grades(&rows);
    let students: Vec<Value> = summaries
        .iter()
        .map(|s| {
            let subjects: Vec<Value> = s
                .subjects
                .iter()
                .map(|a| {
                    json!({
                        "subjectId": a.subject_id,
                        "subjectName": subject_names.get(&a.subject_id),
                        "average": a.average,
                        "count": a.count,
                    })
                })
                .collect();
            json!({
                "studentId": s.student_id,
                "subjects": subjects,
                "overallAverage": s.overall_average,
            })
        })
        .collect();
    Ok(json!({ "students": students, "gradeCount": rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let conn = require_db(state.db.as_ref());
    let result = match req.method.as_str() {
        "grades.create" => conn.and_then(|c| grades_create(c, &state.enforcement, &req.params)),
        "grades.update" => conn.and_then(|c| grades_update(c, &req.params)),
        "grades.delete" => conn.and_then(|c| grades_delete(c, &req.params)),
        "grades.list" => conn.and_then(|c| grades_list(c, &req.params)),
        "grades.summary" => conn.and_then(|c| grades_summary(c, &req.params)),
        _ => return None,
    };
    if let Err(e) = &result {
        if e.code.starts_with("semester_") {
            tracing::info!(method = %req.method, code = e.code, "grade write blocked by enforcement");
        }
    }
    Some(respond(&req.id, result))
}
