use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attendance::tally_by_student;
use crate::ipc::handlers::grades::load_grade_rows;
use crate::ipc::handlers::semesters::{load_semesters, semester_view};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_db, respond};
use crate::ipc::types::{AppState, Request};
use crate::semester::{resolve_effective_semester_id, SemesterMetadata, SemesterSelection};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

struct StudentHeader {
    name: String,
    nis: Option<String>,
    class_name: String,
    homeroom_teacher: Option<String>,
}

fn student_header(conn: &Connection, student_id: &str) -> Result<StudentHeader, HandlerErr> {
    conn.query_row(
        "SELECT s.name, s.nis, c.name, t.name
         FROM students s
         JOIN classes c ON c.id = s.class_id
         LEFT JOIN teachers t ON t.id = c.homeroom_teacher_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            Ok(StudentHeader {
                name: r.get(0)?,
                nis: r.get(1)?,
                class_name: r.get(2)?,
                homeroom_teacher: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Data for one printable report card. The semester defaults to whichever
/// one resolves as effective for the workspace.
fn report_card_get(
    conn: &Connection,
    selected_semester: Option<&str>,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let explicit = get_optional_str(params, "semesterId")?;
    let header = student_header(conn, &student_id)?;

    let rows = load_semesters(conn)?;
    let metas: Vec<SemesterMetadata> = rows.iter().map(|(_, m)| m.clone()).collect();
    let semester_id = resolve_effective_semester_id(
        SemesterSelection {
            explicit: explicit.as_deref(),
            selected: selected_semester,
        },
        &metas,
    );
    if semester_id.is_empty() {
        return Err(HandlerErr::new("semester_required", "no semester to report on"));
    }
    let Some((record, meta)) = rows
        .iter()
        .find(|(_, m)| m.usable_id() == Some(semester_id.as_str()))
    else {
        return Err(HandlerErr::not_found("semester not found"));
    };

    let filter = json!({ "studentId": student_id, "semesterId": semester_id });
    let (grade_rows, subject_names) = load_grade_rows(conn, &filter)?;
    let summary = calc::summarize_grades(&grade_rows);
    let (subjects, overall) = match summary.first() {
        Some(s) => (
            s.subjects
                .iter()
                .map(|a| {
                    json!({
                        "subjectId": a.subject_id,
                        "subjectName": subject_names.get(&a.subject_id),
                        "average": a.average,
                        "count": a.count,
                    })
                })
                .collect::<Vec<_>>(),
            s.overall_average,
        ),
        None => (Vec::new(), None),
    };

    let tally = tally_by_student(conn, &filter)?
        .remove(&student_id)
        .unwrap_or_default();

    Ok(json!({
        "student": {
            "id": student_id,
            "name": header.name,
            "nis": header.nis.unwrap_or_else(|| "-".to_string()),
            "className": header.class_name,
        },
        "homeroomTeacher": header.homeroom_teacher.unwrap_or_else(|| "-".to_string()),
        "semester": semester_view(Some(record), Some(meta)),
        "semesterId": semester_id,
        "subjects": subjects,
        "overallAverage": overall,
        "attendance": {
            "tally": tally,
            "total": tally.total(),
            "presencePercent": tally.presence_percent(),
        },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reportCard.get" => {
            let selected = state.enforcement.active_semester_id();
            let result = require_db(state.db.as_ref())
                .and_then(|conn| report_card_get(conn, selected, &req.params));
            Some(respond(&req.id, result))
        }
        _ => None,
    }
}
