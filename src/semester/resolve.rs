use serde_json::Value;

use super::normalize::{normalize_semester, SemesterMetadata};

/// Ids supplied by the caller, in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemesterSelection<'a> {
    pub explicit: Option<&'a str>,
    pub selected: Option<&'a str>,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Effective semester id, or `""` when nothing resolves.
///
/// Order: explicit, selected, the active record, the only record, the first
/// record with an id. When several records are flagged active the first one
/// in list order wins.
pub fn resolve_effective_semester_id(
    selection: SemesterSelection<'_>,
    semesters: &[SemesterMetadata],
) -> String {
    if let Some(id) = non_blank(selection.explicit) {
        return id.to_string();
    }
    if let Some(id) = non_blank(selection.selected) {
        return id.to_string();
    }

    let mut active = semesters.iter().filter(|s| s.is_active);
    if let Some(first) = active.next() {
        let extra = active.count();
        if extra > 0 {
            tracing::warn!(
                active = extra + 1,
                "multiple semesters flagged active; using the first"
            );
        }
        if let Some(id) = first.usable_id() {
            return id.to_string();
        }
    }

    if let [only] = semesters {
        if let Some(id) = only.usable_id() {
            return id.to_string();
        }
    }

    semesters
        .iter()
        .find_map(SemesterMetadata::usable_id)
        .map(str::to_string)
        .unwrap_or_default()
}

/// Metadata for the effective semester. Falls back to normalizing the
/// caller's fallback record when no listed semester matches.
pub fn resolve_semester_metadata(
    selection: SemesterSelection<'_>,
    semesters: &[SemesterMetadata],
    fallback: Option<&Value>,
) -> Option<SemesterMetadata> {
    let id = resolve_effective_semester_id(selection, semesters);
    if !id.is_empty() {
        if let Some(found) = semesters.iter().find(|s| s.usable_id() == Some(id.as_str())) {
            return Some(found.clone());
        }
    }
    normalize_semester(fallback)
}
