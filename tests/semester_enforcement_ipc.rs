use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rapord");
    let mut child = Command::new(exe)
        .env_remove("RAPORD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rapord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn db_path(workspace: &std::path::Path) -> PathBuf {
    workspace.join("rapor.sqlite3")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

struct Roster {
    student_id: String,
    subject_id: String,
}

fn seed_roster(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Roster {
    let class = request_ok(stdin, reader, "r1", "classes.create", json!({ "name": "VII A" }));
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "r2",
        "students.create",
        json!({ "classId": class_id, "name": "Siti Aminah", "nis": "2401" }),
    );
    let subject = request_ok(
        stdin,
        reader,
        "r3",
        "subjects.create",
        json!({ "name": "Matematika", "code": "mtk" }),
    );
    Roster {
        student_id: student["studentId"].as_str().expect("studentId").to_string(),
        subject_id: subject["subjectId"].as_str().expect("subjectId").to_string(),
    }
}

#[test]
fn semesters_crud_labels_and_effective_selection() {
    let workspace = temp_dir("rapord-semesters");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let ganjil = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        json!({ "record": {
            "tahun_ajaran": "2024/2025",
            "semester": "1",
            "startDate": "2024-07-15",
            "end_date": "2024-12-20",
            "studyDays": 96
        }}),
    );
    let ganjil_id = ganjil["semesterId"].as_str().expect("id").to_string();

    let genap = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "semesters.create",
        json!({ "record": {
            "id": "genap-2425",
            "tahunAjaran": "2024/2025",
            "semesterNumber": 2,
            "label": "Genap 2024/2025",
            "isActive": true
        }}),
    );
    assert_eq!(genap["semesterId"], json!("genap-2425"));

    let dup = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "semesters.create",
        json!({ "record": { "id": "genap-2425", "tahunAjaran": "2024/2025" } }),
    );
    assert_eq!(dup, "bad_params");

    let reversed = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "semesters.create",
        json!({ "record": {
            "tahunAjaran": "2025/2026",
            "tanggalMulai": "2026-01-10",
            "tanggalSelesai": "2025-12-20"
        }}),
    );
    assert_eq!(reversed, "bad_params");

    let list = request_ok(&mut stdin, &mut reader, "6", "semesters.list", json!({}));
    let semesters = list["semesters"].as_array().expect("semesters");
    assert_eq!(semesters.len(), 2);
    assert_eq!(list["effectiveSemesterId"], json!("genap-2425"));

    let first = semesters
        .iter()
        .find(|s| s["id"] == json!(ganjil_id))
        .expect("ganjil listed");
    assert_eq!(first["title"], json!("2024/2025 - Semester Ganjil"));
    assert_eq!(first["label"], json!("2024/2025 - Semester Ganjil"));
    assert_eq!(first["dateRange"], json!("15 Juli 2024 - 20 Desember 2024"));
    assert_eq!(first["studyDays"], json!("96 hari"));
    assert_eq!(first["expired"], json!(true));
    assert_eq!(first["metadata"]["catatan"], json!(""));
    assert_eq!(first["metadata"]["semesterNumber"], json!(1));

    let second = semesters
        .iter()
        .find(|s| s["id"] == json!("genap-2425"))
        .expect("genap listed");
    assert_eq!(second["title"], json!("2024/2025 - Semester Genap (Aktif)"));
    assert_eq!(second["label"], json!("Genap 2024/2025"));
    assert_eq!(second["dateRange"], serde_json::Value::Null);
    assert_eq!(second["studyDays"], json!("-"));

    // A selected id that is not in the list is still honored.
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "semesters.list",
        json!({ "selectedId": "arsip-2019" }),
    );
    assert_eq!(list["effectiveSemesterId"], json!("arsip-2019"));

    // Activating the other semester leaves exactly one active.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "semesters.setActive",
        json!({ "semesterId": ganjil_id }),
    );
    let list = request_ok(&mut stdin, &mut reader, "9", "semesters.list", json!({}));
    let active: Vec<&serde_json::Value> = list["semesters"]
        .as_array()
        .expect("semesters")
        .iter()
        .filter(|s| s["metadata"]["isActive"] == json!(true))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(list["effectiveSemesterId"], json!(ganjil_id));

    let enforcement = request_ok(&mut stdin, &mut reader, "10", "enforcement.get", json!({}));
    assert_eq!(enforcement["activeSemester"]["id"], json!(ganjil_id));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "semesters.update",
        json!({ "semesterId": ganjil_id, "patch": { "catatan": "Rapor dibagikan 21 Desember" } }),
    );
    assert_eq!(updated["activeChanged"], json!(false));
    let enforcement = request_ok(&mut stdin, &mut reader, "11b", "enforcement.get", json!({}));
    assert_eq!(
        enforcement["activeSemester"]["catatan"],
        json!("Rapor dibagikan 21 Desember")
    );

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "semesters.resolve",
        json!({ "explicitId": "genap-2425" }),
    );
    assert_eq!(resolved["semesterId"], json!("genap-2425"));
    assert_eq!(resolved["label"], json!("Genap 2024/2025"));

    let resolved = request_ok(&mut stdin, &mut reader, "13", "semesters.resolve", json!({}));
    assert_eq!(resolved["semesterId"], json!(ganjil_id));
    assert_eq!(
        resolved["metadata"]["catatan"],
        json!("Rapor dibagikan 21 Desember")
    );

    let fallback = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "semesters.resolve",
        json!({
            "semesters": [],
            "fallback": { "tahunAjaran": "2023/2024", "semester": "Genap" }
        }),
    );
    assert_eq!(fallback["semesterId"], json!(""));
    assert_eq!(fallback["metadata"]["tahunAjaran"], json!("2023/2024"));
    assert_eq!(fallback["label"], json!("2023/2024 - Semester Genap"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "semesters.delete",
        json!({ "semesterId": "genap-2425" }),
    );
    let missing = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "semesters.delete",
        json!({ "semesterId": "genap-2425" }),
    );
    assert_eq!(missing, "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn strict_mode_attaches_and_rejects() {
    let workspace = temp_dir("rapord-enforcement");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["enforcement"]["mode"], json!("relaxed"));

    let roster = seed_roster(&mut stdin, &mut reader);

    let current = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        json!({ "record": {
            "id": "s-current",
            "tahunAjaran": "2024/2025",
            "semester": 1,
            "tanggalMulai": "2024-07-15",
            "tanggalSelesai": "2099-12-20",
            "isActive": true
        }}),
    );
    assert_eq!(current["isActive"], json!(true));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "semesters.create",
        json!({ "record": {
            "id": "s-old",
            "tahunAjaran": "2023/2024",
            "semester": 2,
            "tanggalSelesai": "2024-06-30"
        }}),
    );

    // Relaxed: nothing is attached and the old semester is accepted.
    let relaxed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "kind": "tugas",
            "score": 80
        }),
    );
    assert_eq!(relaxed["semesterId"], serde_json::Value::Null);
    let old = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "semesterId": "s-old",
            "kind": "uas",
            "score": 75
        }),
    );
    assert_eq!(old["semesterId"], json!("s-old"));

    let bad_mode = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "enforcement.update",
        json!({ "mode": "ketat" }),
    );
    assert_eq!(bad_mode, "bad_params");

    let strict = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "enforcement.update",
        json!({ "mode": "strict" }),
    );
    assert_eq!(strict["mode"], json!("strict"));
    assert_eq!(strict["strictActive"], json!(true));
    assert_eq!(strict["activeSemester"]["id"], json!("s-current"));

    let check = request_ok(&mut stdin, &mut reader, "8", "enforcement.check", json!({}));
    assert_eq!(check["attach"], json!(true));
    assert_eq!(check["semesterId"], json!("s-current"));

    let attached = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "kind": "ulangan",
            "score": "88,5"
        }),
    );
    assert_eq!(attached["semesterId"], json!("s-current"));

    let expired = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "semesterId": "s-old",
            "kind": "tugas",
            "score": 90
        }),
    );
    assert_eq!(expired, "semester_expired");

    let unknown = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.record",
        json!({
            "studentId": roster.student_id,
            "semesterId": "s-missing",
            "date": "2024-08-01",
            "status": "hadir"
        }),
    );
    assert_eq!(unknown, "not_found");

    let attendance = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.record",
        json!({ "studentId": roster.student_id, "date": "2024-08-01", "status": "S" }),
    );
    assert_eq!(attendance["semesterId"], json!("s-current"));

    // Deactivating the only active semester leaves strict mode with nothing
    // to attach.
    let deactivated = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "semesters.update",
        json!({ "semesterId": "s-current", "patch": { "isActive": false } }),
    );
    assert_eq!(deactivated["activeChanged"], json!(true));
    let enforcement = request_ok(&mut stdin, &mut reader, "14", "enforcement.get", json!({}));
    assert_eq!(enforcement["activeSemester"], serde_json::Value::Null);

    let required = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "kind": "tugas",
            "score": 70
        }),
    );
    assert_eq!(required, "semester_required");

    let explicit = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "semesterId": "s-current",
            "kind": "tugas",
            "score": 70
        }),
    );
    assert_eq!(explicit["semesterId"], json!("s-current"));

    // Strict mode scheduled in the future is not in force yet.
    let scheduled = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "enforcement.update",
        json!({ "activationDate": "2099-01-01" }),
    );
    assert_eq!(scheduled["mode"], json!("strict"));
    assert_eq!(scheduled["strictActive"], json!(false));
    assert_eq!(scheduled["activationDate"], json!("2099-01-01T00:00:00"));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "grades.create",
        json!({
            "studentId": roster.student_id,
            "subjectId": roster.subject_id,
            "kind": "tugas",
            "score": 65
        }),
    );

    // Settings survive reopening the workspace.
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(reopened["enforcement"]["mode"], json!("strict"));
    assert_eq!(
        reopened["enforcement"]["activationDate"],
        json!("2099-01-01T00:00:00")
    );

    let in_use = request_err(
        &mut stdin,
        &mut reader,
        "20",
        "semesters.delete",
        json!({ "semesterId": "s-current" }),
    );
    assert_eq!(in_use, "in_use");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn semester_numbers_sort_numerically() {
    let workspace = temp_dir("rapord-semester-order");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for (i, number) in ["10", "2", "1"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "semesters.create",
            json!({ "record": { "id": format!("s-{}", number), "tahunAjaran": "2024/2025", "semester": number } }),
        );
    }

    let list = request_ok(&mut stdin, &mut reader, "2", "semesters.list", json!({}));
    let ids: Vec<&str> = list["semesters"]
        .as_array()
        .expect("semesters")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["s-1", "s-2", "s-10"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn enforcement_update_replaces_unreadable_settings() {
    let workspace = temp_dir("rapord-enforcement-repair");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    {
        let conn = rusqlite::Connection::open(db_path(&workspace)).expect("open db");
        conn.execute(
            "INSERT INTO settings(key, value_json) VALUES('semester.enforcement', '{not json')",
            [],
        )
        .expect("seed corrupt settings");
    }

    let refreshed = request_ok(&mut stdin, &mut reader, "2", "enforcement.refresh", json!({}));
    assert_eq!(refreshed["mode"], json!("relaxed"));
    assert!(refreshed["error"].is_string());

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enforcement.update",
        json!({ "mode": "strict" }),
    );
    assert_eq!(updated["mode"], json!("strict"));
    assert_eq!(updated["error"], serde_json::Value::Null);

    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(reopened["enforcement"]["mode"], json!("strict"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
