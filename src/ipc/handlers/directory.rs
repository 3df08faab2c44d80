use crate::ipc::error::{DbResultExt, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_db, require_row, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

const ROLES: [&str; 4] = ["admin", "guru", "wali_kelas", "siswa"];

fn parse_role(raw: &str) -> Option<&'static str> {
    let r = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let r = match r.as_str() {
        "teacher" => "guru",
        "homeroom" | "homeroom_teacher" | "walikelas" => "wali_kelas",
        "student" => "siswa",
        other => other,
    };
    ROLES.iter().copied().find(|known| *known == r)
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Merges a login account with its student or teacher profile. Profile
/// fields fill gaps; account fields win whenever they are non-empty. The
/// profile's own id is kept as `profileId`.
pub(crate) fn merge_user_record(user: &Map<String, Value>, profile: Option<(&str, &Map<String, Value>)>) -> Value {
    let mut merged = Map::new();
    if let Some((kind, p)) = profile {
        for (k, v) in p {
            if k == "id" {
                merged.insert("profileId".into(), v.clone());
            } else {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged.insert("profileType".into(), Value::String(kind.to_string()));
    }
    for (k, v) in user {
        if is_blank(v) && merged.get(k).is_some_and(|existing| !is_blank(existing)) {
            continue;
        }
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

fn users_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let name = get_required_str(params, "name")?;
    let role_raw = get_required_str(params, "role")?;
    let Some(role) = parse_role(&role_raw) else {
        return Err(HandlerErr::bad_params(
            "role must be one of: admin, guru, wali_kelas, siswa",
        ));
    };
    let email = get_optional_str(params, "email")?;

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, name, role, email) VALUES(?, ?, ?, ?, ?)",
        (&user_id, &username, &name, role, &email),
    )
    .db_err("db_insert_failed", "users")?;
    Ok(json!({ "userId": user_id, "role": role }))
}

fn profiles_by_user(conn: &Connection, sql: &str) -> Result<HashMap<String, Map<String, Value>>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt
        .query_map([], |r| {
            let mut obj = Map::new();
            for (i, name) in names.iter().enumerate().skip(1) {
                let v: Option<String> = r.get(i)?;
                obj.insert(name.clone(), v.map(Value::String).unwrap_or(Value::Null));
            }
            Ok((r.get::<_, String>(0)?, obj))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

fn users_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role = match get_optional_str(params, "role")? {
        Some(raw) => Some(
            parse_role(&raw).ok_or_else(|| HandlerErr::bad_params("unknown role"))?,
        ),
        None => None,
    };

    let students = profiles_by_user(
        conn,
        "SELECT s.user_id, s.id AS id, s.name AS name, s.nis AS nis,
                s.class_id AS classId, c.name AS className
         FROM students s JOIN classes c ON c.id = s.class_id
         WHERE s.user_id IS NOT NULL",
    )?;
    let teachers = profiles_by_user(
        conn,
        "SELECT user_id, id AS id, name AS name, nip AS nip
         FROM teachers WHERE user_id IS NOT NULL",
    )?;

    let mut stmt = conn.prepare(
        "SELECT id, username, name, role, email FROM users
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY name, username",
    )?;
    let users = stmt
        .query_map([role], |r| {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(r.get(0)?));
            obj.insert("username".into(), Value::String(r.get(1)?));
            obj.insert("name".into(), Value::String(r.get(2)?));
            obj.insert("role".into(), Value::String(r.get(3)?));
            obj.insert(
                "email".into(),
                r.get::<_, Option<String>>(4)?.map(Value::String).unwrap_or(Value::Null),
            );
            Ok(obj)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let merged: Vec<Value> = users
        .iter()
        .map(|u| {
            let id = u.get("id").and_then(|v| v.as_str()).unwrap_or("");
            let profile = students
                .get(id)
                .map(|p| ("student", p))
                .or_else(|| teachers.get(id).map(|p| ("teacher", p)));
            merge_user_record(u, profile)
        })
        .collect();
    Ok(json!({ "users": merged }))
}

fn optional_user(conn: &Connection, params: &Value) -> Result<Option<String>, HandlerErr> {
    let user_id = get_optional_str(params, "userId")?;
    if let Some(id) = user_id.as_deref() {
        require_row(conn, "users", id, "user")?;
    }
    Ok(user_id)
}

fn teachers_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let nip = get_optional_str(params, "nip")?;
    let user_id = optional_user(conn, params)?;
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, user_id, name, nip) VALUES(?, ?, ?, ?)",
        (&teacher_id, &user_id, &name, &nip),
    )
    .db_err("db_insert_failed", "teachers")?;
    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.nip, t.user_id,
           (SELECT COUNT(*) FROM classes c WHERE c.homeroom_teacher_id = t.id)
         FROM teachers t ORDER BY t.name",
    )?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "nip": r.get::<_, Option<String>>(2)?,
                "userId": r.get::<_, Option<String>>(3)?,
                "homeroomClassCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let homeroom = get_optional_str(params, "homeroomTeacherId")?;
    if let Some(t) = homeroom.as_deref() {
        require_row(conn, "teachers", t, "teacher")?;
    }
    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, homeroom_teacher_id) VALUES(?, ?, ?)",
        (&class_id, &name, &homeroom),
    )
    .db_err("db_insert_failed", "classes")?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.homeroom_teacher_id,
           t.name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         LEFT JOIN teachers t ON t.id = c.homeroom_teacher_id
         ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "homeroomTeacherId": r.get::<_, Option<String>>(2)?,
                "homeroomTeacherName": r.get::<_, Option<String>>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_optional_str(params, "code")?.map(|c| c.to_ascii_uppercase());
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)",
        (&subject_id, &name, &code),
    )
    .db_err("db_insert_failed", "subjects")?;
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id, name, code FROM subjects ORDER BY name")?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    let nis = get_optional_str(params, "nis")?;
    require_row(conn, "classes", &class_id, "class")?;
    let user_id = optional_user(conn, params)?;

    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, user_id, name, nis, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &class_id, &user_id, &name, &nis, sort_order),
    )
    .db_err("db_insert_failed", "students")?;
    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId")?;
    let mut stmt = conn.prepare(
        "SELECT id, class_id, user_id, name, nis, sort_order
         FROM students
         WHERE (?1 IS NULL OR class_id = ?1)
         ORDER BY class_id, sort_order",
    )?;
    let students = stmt
        .query_map([class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "userId": r.get::<_, Option<String>>(2)?,
                "name": r.get::<_, String>(3)?,
                "nis": r.get::<_, Option<String>>(4)?,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "users.create" => users_create,
        "users.list" => users_list,
        "teachers.create" => teachers_create,
        "teachers.list" => teachers_list,
        "classes.create" => classes_create,
        "classes.list" => classes_list,
        "subjects.create" => subjects_create,
        "subjects.list" => subjects_list,
        "students.create" => students_create,
        "students.list" => students_list,
        _ => return None,
    };
    Some(respond(
        &req.id,
        require_db(state.db.as_ref()).and_then(|conn| f(conn, &req.params)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn role_aliases() {
        assert_eq!(parse_role("Wali Kelas"), Some("wali_kelas"));
        assert_eq!(parse_role("teacher"), Some("guru"));
        assert_eq!(parse_role("SISWA"), Some("siswa"));
        assert_eq!(parse_role("kepala_sekolah"), None);
    }

    #[test]
    fn merge_prefers_non_empty_account_fields() {
        let user = obj(json!({ "id": "u1", "name": "Budi Santoso", "email": null, "role": "siswa" }));
        let profile = obj(json!({ "id": "st1", "name": "Budi", "email": "budi@sekolah.id", "nis": "1201" }));
        let merged = merge_user_record(&user, Some(("student", &profile)));
        assert_eq!(merged["id"], json!("u1"));
        assert_eq!(merged["profileId"], json!("st1"));
        assert_eq!(merged["profileType"], json!("student"));
        assert_eq!(merged["name"], json!("Budi Santoso"));
        assert_eq!(merged["email"], json!("budi@sekolah.id"));
        assert_eq!(merged["nis"], json!("1201"));
    }

    #[test]
    fn merge_without_profile_is_the_account() {
        let user = obj(json!({ "id": "u2", "role": "admin" }));
        assert_eq!(merge_user_record(&user, None), json!({ "id": "u2", "role": "admin" }));
    }
}
