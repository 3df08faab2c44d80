use serde::Serialize;
use serde_json::{Map, Value};

/// Logical semester attributes and the record keys that may carry them.
///
/// Records arrive from several screens and import paths that never agreed on
/// naming, so each attribute is looked up through an ordered alias list. The
/// first key holding a non-empty value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemesterField {
    Id,
    TahunAjaran,
    SemesterNumber,
    TanggalMulai,
    TanggalSelesai,
    JumlahHariBelajar,
    Catatan,
    IsActive,
    Label,
}

impl SemesterField {
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id", "semesterId", "semester_id", "_id"],
            Self::TahunAjaran => &[
                "tahunAjaran",
                "tahun_ajaran",
                "academicYear",
                "academic_year",
                "tahun",
            ],
            Self::SemesterNumber => &[
                "semesterNumber",
                "semester_number",
                "semester",
                "nomorSemester",
                "semesterKe",
            ],
            Self::TanggalMulai => &[
                "tanggalMulai",
                "tanggal_mulai",
                "startDate",
                "start_date",
                "mulai",
            ],
            Self::TanggalSelesai => &[
                "tanggalSelesai",
                "tanggal_selesai",
                "endDate",
                "end_date",
                "selesai",
            ],
            Self::JumlahHariBelajar => &[
                "jumlahHariBelajar",
                "jumlah_hari_belajar",
                "studyDays",
                "learningDays",
                "hariBelajar",
            ],
            Self::Catatan => &["catatan", "notes", "note", "keterangan"],
            Self::IsActive => &["isActive", "is_active", "active", "aktif"],
            Self::Label => &["label", "semesterLabel", "nama", "name"],
        }
    }

    /// First non-empty value for this attribute. `null` and blank strings
    /// count as empty.
    pub fn lookup(self, record: &Map<String, Value>) -> Option<&Value> {
        self.aliases()
            .iter()
            .filter_map(|k| record.get(*k))
            .find(|v| !is_empty_value(v))
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// A value that is numeric when it can be, text otherwise. Whole numbers
/// that fit in an `i64` are `Number`; other finite numbers are `Float`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Number(i64),
    Float(f64),
    Text(String),
}

impl LooseNumber {
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Self::Number(i);
                }
                n.as_f64()
                    .and_then(Self::from_f64)
                    .unwrap_or_else(|| Self::Text(n.to_string()))
            }
            Value::String(s) => Self::from_text(s),
            other => Self::Text(value_to_text(other)),
        }
    }

    pub fn from_text(s: &str) -> Self {
        let t = s.trim();
        if let Ok(i) = t.parse::<i64>() {
            return Self::Number(i);
        }
        t.parse::<f64>()
            .ok()
            .and_then(Self::from_f64)
            .unwrap_or_else(|| Self::Text(s.to_string()))
    }

    /// `None` for NaN and infinities.
    fn from_f64(f: f64) -> Option<Self> {
        if !f.is_finite() {
            return None;
        }
        // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            return Some(Self::Number(f as i64));
        }
        Some(Self::Float(f))
    }
}

impl std::fmt::Display for LooseNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Canonical semester shape every screen and report works from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterMetadata {
    pub id: Option<String>,
    pub tahun_ajaran: Option<String>,
    pub semester_number: Option<LooseNumber>,
    pub tanggal_mulai: Option<String>,
    pub tanggal_selesai: Option<String>,
    pub jumlah_hari_belajar: Option<LooseNumber>,
    pub catatan: String,
    pub is_active: bool,
}

impl SemesterMetadata {
    /// Id if present and not blank.
    pub fn usable_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

pub fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn value_is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "ya" | "aktif" | "active"
        ),
        _ => false,
    }
}

/// Normalizes a loosely-typed semester record.
///
/// Returns `None` only when there is no record at all (absent or JSON null).
/// Non-object inputs normalize to an empty metadata value.
pub fn normalize_semester(record: Option<&Value>) -> Option<SemesterMetadata> {
    let record = match record {
        None | Some(Value::Null) => return None,
        Some(v) => v,
    };
    let Some(obj) = record.as_object() else {
        return Some(SemesterMetadata::default());
    };

    let text = |field: SemesterField| field.lookup(obj).map(value_to_text);

    Some(SemesterMetadata {
        id: text(SemesterField::Id),
        tahun_ajaran: text(SemesterField::TahunAjaran),
        semester_number: SemesterField::SemesterNumber
            .lookup(obj)
            .map(LooseNumber::from_value),
        tanggal_mulai: text(SemesterField::TanggalMulai),
        tanggal_selesai: text(SemesterField::TanggalSelesai),
        jumlah_hari_belajar: SemesterField::JumlahHariBelajar
            .lookup(obj)
            .map(LooseNumber::from_value),
        catatan: text(SemesterField::Catatan).unwrap_or_default(),
        is_active: SemesterField::IsActive
            .lookup(obj)
            .map(value_is_truthy)
            .unwrap_or(false),
    })
}

/// Explicit label carried by the record, verbatim.
pub fn explicit_label(record: &Value) -> Option<String> {
    let obj = record.as_object()?;
    match SemesterField::Label.lookup(obj)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}
