use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::normalize::{explicit_label, normalize_semester, LooseNumber, SemesterMetadata};

const DEFAULT_TITLE: &str = "Semester";
const ACTIVE_SUFFIX: &str = " (Aktif)";

const MONTHS_ID: [&str; 12] = [
    "Januari",
    "Februari",
    "Maret",
    "April",
    "Mei",
    "Juni",
    "Juli",
    "Agustus",
    "September",
    "Oktober",
    "November",
    "Desember",
];

/// Parses the date forms the front end sends: `YYYY-MM-DD`, naive
/// timestamps and RFC 3339 (converted to local time first).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_date_time(raw).map(|dt| dt.date())
}

pub fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
}

/// `1 Juli 2024`
pub fn format_date_long(d: NaiveDate) -> String {
    format!("{} {} {}", d.day(), MONTHS_ID[d.month0() as usize], d.year())
}

/// "Semester Ganjil" / "Semester Genap" / "Semester N".
pub fn semester_text_label(number: &LooseNumber) -> String {
    match number {
        LooseNumber::Number(1) => "Semester Ganjil".to_string(),
        LooseNumber::Number(2) => "Semester Genap".to_string(),
        LooseNumber::Number(n) => format!("Semester {}", n),
        LooseNumber::Float(x) => format!("Semester {}", x),
        LooseNumber::Text(t) => {
            let lower = t.trim().to_lowercase();
            match lower.as_str() {
                "ganjil" | "odd" => "Semester Ganjil".to_string(),
                "genap" | "even" => "Semester Genap".to_string(),
                _ if lower.starts_with("semester") => t.trim().to_string(),
                _ => format!("Semester {}", t.trim()),
            }
        }
    }
}

/// Academic year and semester label joined with `" - "`, or `None` when the
/// metadata has neither.
pub fn format_semester_period(metadata: &SemesterMetadata) -> Option<String> {
    let mut parts: Vec<String> = Vec::with_capacity(2);
    if let Some(year) = metadata.tahun_ajaran.as_deref() {
        parts.push(year.to_string());
    }
    if let Some(number) = metadata.semester_number.as_ref() {
        parts.push(semester_text_label(number));
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" - "))
}

pub fn build_semester_title(metadata: Option<&SemesterMetadata>, include_active_flag: bool) -> String {
    let Some(m) = metadata else {
        return DEFAULT_TITLE.to_string();
    };
    let mut title = format_semester_period(m).unwrap_or_else(|| DEFAULT_TITLE.to_string());
    if include_active_flag && m.is_active {
        title.push_str(ACTIVE_SUFFIX);
    }
    title
}

pub fn build_semester_date_range(metadata: Option<&SemesterMetadata>) -> Option<String> {
    let m = metadata?;
    let start = parse_date(m.tanggal_mulai.as_deref()?)?;
    let end = parse_date(m.tanggal_selesai.as_deref()?)?;
    Some(format!("{} - {}", format_date_long(start), format_date_long(end)))
}

/// Label for a raw semester record. An explicit label field is used as-is;
/// otherwise the combined period. `None` means the caller shows a
/// placeholder.
pub fn build_semester_label(record: Option<&Value>) -> Option<String> {
    let record = record?;
    if let Some(label) = explicit_label(record) {
        return Some(label);
    }
    normalize_semester(Some(record)).and_then(|m| format_semester_period(&m))
}

pub fn format_study_days(days: Option<&LooseNumber>) -> String {
    match days {
        Some(d) => format!("{} hari", d),
        None => "-".to_string(),
    }
}
