//! Semester derivations shared by every record surface: normalizing loose
//! records, formatting labels, resolving the effective semester and deciding
//! whether new records must carry a semester id.

mod enforcement;
mod format;
mod normalize;
mod resolve;

pub use enforcement::{is_semester_expired, EnforcementPolicy, SemesterSettingsSource};
pub use format::{
    build_semester_date_range, build_semester_label, build_semester_title, format_study_days,
    parse_date, parse_date_time,
};
pub use normalize::{explicit_label, normalize_semester, SemesterField, SemesterMetadata};
pub use resolve::{resolve_effective_semester_id, resolve_semester_metadata, SemesterSelection};
