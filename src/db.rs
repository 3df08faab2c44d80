use crate::semester::SemesterSettingsSource;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;

pub const ENFORCEMENT_SETTINGS_KEY: &str = "semester.enforcement";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rapor.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            tahun_ajaran TEXT,
            semester_number TEXT,
            tanggal_mulai TEXT,
            tanggal_selesai TEXT,
            jumlah_hari_belajar TEXT,
            catatan TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Older workspaces predate explicit labels.
    ensure_semesters_label(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            user_id TEXT,
            name TEXT NOT NULL,
            nip TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            homeroom_teacher_id TEXT,
            FOREIGN KEY(homeroom_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            user_id TEXT,
            name TEXT NOT NULL,
            nis TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester_id TEXT,
            kind TEXT NOT NULL,
            score REAL NOT NULL,
            date TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_semester ON grades(semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            semester_id TEXT,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_semester ON attendance(semester_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_semesters_label(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "semesters", "label")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE semesters ADD COLUMN label TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

const SEMESTER_COLUMNS: &str = "id, tahun_ajaran, semester_number, tanggal_mulai, tanggal_selesai,
     jumlah_hari_belajar, catatan, label, is_active";

/// Stored semester row as a raw record, in the same shape the UI posts, so it
/// goes through the normalizer like any other source.
fn semester_row_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "tahunAjaran": row.get::<_, Option<String>>(1)?,
        "semesterNumber": row.get::<_, Option<String>>(2)?,
        "tanggalMulai": row.get::<_, Option<String>>(3)?,
        "tanggalSelesai": row.get::<_, Option<String>>(4)?,
        "jumlahHariBelajar": row.get::<_, Option<String>>(5)?,
        "catatan": row.get::<_, String>(6)?,
        "label": row.get::<_, Option<String>>(7)?,
        "isActive": row.get::<_, i64>(8)? != 0,
    }))
}

pub fn semester_records(conn: &Connection) -> anyhow::Result<Vec<serde_json::Value>> {
    let sql = format!(
        "SELECT {} FROM semesters
         ORDER BY tahun_ajaran, CAST(semester_number AS INTEGER), semester_number, rowid",
        SEMESTER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], semester_row_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn semester_record(conn: &Connection, semester_id: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let sql = format!("SELECT {} FROM semesters WHERE id = ?", SEMESTER_COLUMNS);
    Ok(conn
        .query_row(&sql, [semester_id], semester_row_record)
        .optional()?)
}

fn active_semester_record(conn: &Connection) -> anyhow::Result<Option<serde_json::Value>> {
    let sql = format!(
        "SELECT {} FROM semesters WHERE is_active = 1 ORDER BY rowid LIMIT 1",
        SEMESTER_COLUMNS
    );
    Ok(conn.query_row(&sql, [], semester_row_record).optional()?)
}

/// Enforcement settings as stored in the workspace, in the payload shape the
/// policy expects from any settings source.
pub struct WorkspaceSettingsSource<'a> {
    pub conn: &'a Connection,
}

impl SemesterSettingsSource for WorkspaceSettingsSource<'_> {
    fn semester_enforcement_settings(&self) -> anyhow::Result<serde_json::Value> {
        let stored = settings_get_json(self.conn, ENFORCEMENT_SETTINGS_KEY)?
            .unwrap_or_else(|| json!({}));
        let active = active_semester_record(self.conn)?;
        Ok(json!({
            "data": {
                "mode": stored.get("mode").cloned().unwrap_or(serde_json::Value::Null),
                "activationDate": stored
                    .get("activationDate")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                "activeSemester": active,
            }
        }))
    }
}
