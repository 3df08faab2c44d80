use serde::Serialize;
use std::collections::BTreeMap;

/// Two-decimal rounding used for every average shown on screen and on the
/// report card.
pub fn round_off_2_decimal(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Hadir,
    Sakit,
    Izin,
    Alpa,
}

impl AttendanceStatus {
    /// Accepts the full word or the single-letter code used on paper rolls.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hadir" | "h" | "present" => Some(Self::Hadir),
            "sakit" | "s" | "sick" => Some(Self::Sakit),
            "izin" | "i" | "permit" => Some(Self::Izin),
            "alpa" | "alpha" | "a" | "absent" => Some(Self::Alpa),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hadir => "hadir",
            Self::Sakit => "sakit",
            Self::Izin => "izin",
            Self::Alpa => "alpa",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub hadir: usize,
    pub sakit: usize,
    pub izin: usize,
    pub alpa: usize,
}

impl AttendanceTally {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Hadir => self.hadir += 1,
            AttendanceStatus::Sakit => self.sakit += 1,
            AttendanceStatus::Izin => self.izin += 1,
            AttendanceStatus::Alpa => self.alpa += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.hadir + self.sakit + self.izin + self.alpa
    }

    /// Share of recorded days marked present; `None` with no records.
    pub fn presence_percent(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        Some(round_off_2_decimal(100.0 * self.hadir as f64 / total as f64))
    }
}

pub fn tally_attendance<I>(statuses: I) -> AttendanceTally
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut t = AttendanceTally::default();
    for s in statuses {
        t.add(s);
    }
    t
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub student_id: String,
    pub subject_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Accum {
    sum: f64,
    count: usize,
}

impl Accum {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub average: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeSummary {
    pub student_id: String,
    pub subjects: Vec<SubjectAverage>,
    /// Mean of the subject averages, so a subject with many entries does not
    /// outweigh the others.
    pub overall_average: Option<f64>,
}

/// Per-student, per-subject averages. Output is ordered by student id then
/// subject id.
pub fn summarize_grades(rows: &[GradeRow]) -> Vec<StudentGradeSummary> {
    let mut by_student: BTreeMap<&str, BTreeMap<&str, Accum>> = BTreeMap::new();
    for r in rows {
        by_student
            .entry(r.student_id.as_str())
            .or_default()
            .entry(r.subject_id.as_str())
            .or_default()
            .push(r.score);
    }

    by_student
        .into_iter()
        .map(|(student_id, subjects)| {
            let subjects: Vec<SubjectAverage> = subjects
                .into_iter()
                .filter_map(|(subject_id, acc)| {
                    acc.mean().map(|avg| SubjectAverage {
                        subject_id: subject_id.to_string(),
                        average: round_off_2_decimal(avg),
                        count: acc.count,
                    })
                })
                .collect();
            let mut overall = Accum::default();
            for s in &subjects {
                overall.push(s.average);
            }
            StudentGradeSummary {
                student_id: student_id.to_string(),
                subjects,
                overall_average: overall.mean().map(round_off_2_decimal),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(student: &str, subject: &str, score: f64) -> GradeRow {
        GradeRow {
            student_id: student.to_string(),
            subject_id: subject.to_string(),
            score,
        }
    }

    #[test]
    fn round_off_two_places() {
        assert_eq!(round_off_2_decimal(83.333333), 83.33);
        assert_eq!(round_off_2_decimal(66.666666), 66.67);
        assert_eq!(round_off_2_decimal(0.0), 0.0);
    }

    #[test]
    fn attendance_status_codes() {
        assert_eq!(AttendanceStatus::parse("H"), Some(AttendanceStatus::Hadir));
        assert_eq!(AttendanceStatus::parse(" Sakit "), Some(AttendanceStatus::Sakit));
        assert_eq!(AttendanceStatus::parse("alpha"), Some(AttendanceStatus::Alpa));
        assert_eq!(AttendanceStatus::parse("terlambat"), None);
    }

    #[test]
    fn tally_and_presence() {
        use AttendanceStatus::*;
        let t = tally_attendance([Hadir, Hadir, Hadir, Sakit, Izin, Alpa]);
        assert_eq!(t.total(), 6);
        assert_eq!(t.hadir, 3);
        assert_eq!(t.presence_percent(), Some(50.0));
        assert_eq!(AttendanceTally::default().presence_percent(), None);
    }

    #[test]
    fn overall_is_mean_of_subject_averages() {
        let rows = vec![
            row("s1", "mat", 80.0),
            row("s1", "mat", 90.0),
            row("s1", "mat", 100.0),
            row("s1", "ipa", 70.0),
            row("s2", "mat", 75.5),
        ];
        let summary = summarize_grades(&rows);
        assert_eq!(summary.len(), 2);

        let s1 = &summary[0];
        assert_eq!(s1.student_id, "s1");
        assert_eq!(s1.subjects.len(), 2);
        // BTreeMap ordering: "ipa" before "mat".
        assert_eq!(s1.subjects[0].subject_id, "ipa");
        assert_eq!(s1.subjects[1].average, 90.0);
        assert_eq!(s1.subjects[1].count, 3);
        assert_eq!(s1.overall_average, Some(80.0));

        assert_eq!(summary[1].overall_average, Some(75.5));
    }

    #[test]
    fn empty_rows_summarize_to_nothing() {
        assert!(summarize_grades(&[]).is_empty());
    }
}
