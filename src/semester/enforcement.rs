use chrono::{Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use serde_json::{json, Value};

use super::format::{parse_date, parse_date_time};
use super::normalize::{normalize_semester, SemesterMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Strict,
    #[default]
    Relaxed,
}

impl EnforcementMode {
    /// Anything other than "strict" is relaxed.
    pub fn parse(raw: Option<&Value>) -> Self {
        match raw.and_then(|v| v.as_str()).map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "strict" => Self::Strict,
            _ => Self::Relaxed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Relaxed => "relaxed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnforcementSettings {
    pub mode: EnforcementMode,
    pub activation_date: Option<NaiveDateTime>,
    pub active_semester: Option<SemesterMetadata>,
}

impl EnforcementSettings {
    /// Reads `{mode, activationDate | activeDate, activeSemester}`, optionally
    /// wrapped in `data`. Unparseable activation dates are treated as absent.
    pub fn from_payload(payload: &Value) -> Self {
        let body = match payload.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => payload,
        };
        let activation_date = ["activationDate", "activeDate"]
            .iter()
            .filter_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .find(|s| !s.trim().is_empty())
            .and_then(parse_date_time);
        Self {
            mode: EnforcementMode::parse(body.get("mode")),
            activation_date,
            active_semester: normalize_semester(body.get("activeSemester")),
        }
    }
}

/// Where enforcement settings come from. The workspace store implements it;
/// tests substitute canned payloads.
pub trait SemesterSettingsSource {
    fn semester_enforcement_settings(&self) -> anyhow::Result<Value>;
}

/// Issued by [`EnforcementPolicy::begin_refresh`]. Only the most recent token
/// may apply its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshToken {
    generation: u64,
}

#[derive(Debug, Default)]
pub struct EnforcementPolicy {
    settings: EnforcementSettings,
    error: Option<String>,
    generation: u64,
}

impl EnforcementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> EnforcementMode {
        self.settings.mode
    }

    /// Message from the last failed refresh, cleared by a successful one.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn active_semester(&self) -> Option<&SemesterMetadata> {
        self.settings.active_semester.as_ref()
    }

    pub fn active_semester_id(&self) -> Option<&str> {
        self.active_semester().and_then(SemesterMetadata::usable_id)
    }

    pub fn begin_refresh(&mut self) -> RefreshToken {
        self.generation += 1;
        RefreshToken {
            generation: self.generation,
        }
    }

    /// Applies a fetch result. Returns `false` when the token was superseded
    /// and the result was dropped.
    pub fn finish_refresh(&mut self, token: RefreshToken, fetched: anyhow::Result<Value>) -> bool {
        if token.generation != self.generation {
            tracing::debug!(
                token = token.generation,
                current = self.generation,
                "discarding stale enforcement refresh"
            );
            return false;
        }
        match fetched {
            Ok(payload) => {
                self.settings = EnforcementSettings::from_payload(&payload);
                self.error = None;
                tracing::info!(
                    mode = self.settings.mode.as_str(),
                    activation = ?self.settings.activation_date,
                    active_semester = ?self.active_semester_id(),
                    "semester enforcement refreshed"
                );
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::error!(
                    error = %message,
                    "failed to load semester enforcement settings; using relaxed mode"
                );
                self.settings = EnforcementSettings::default();
                self.error = Some(message);
            }
        }
        true
    }

    /// Re-fetches settings. Never fails: a fetch error leaves the policy
    /// relaxed with [`Self::error`] set.
    pub fn refresh(&mut self, source: &dyn SemesterSettingsSource) {
        let token = self.begin_refresh();
        let fetched = source.semester_enforcement_settings();
        self.finish_refresh(token, fetched);
    }

    pub fn is_strict_active_at(&self, now: NaiveDateTime) -> bool {
        if self.settings.mode != EnforcementMode::Strict {
            return false;
        }
        match self.settings.activation_date {
            None => true,
            Some(activation) => now >= activation,
        }
    }

    pub fn is_strict_active(&self) -> bool {
        self.is_strict_active_at(Local::now().naive_local())
    }

    pub fn should_attach_semester_id_at(&self, candidate: Option<&str>, now: NaiveDateTime) -> bool {
        if !self.is_strict_active_at(now) {
            return false;
        }
        let has_candidate = candidate.map(|c| !c.trim().is_empty()).unwrap_or(false);
        has_candidate || self.active_semester_id().is_some()
    }

    pub fn should_attach_semester_id(&self, candidate: Option<&str>) -> bool {
        self.should_attach_semester_id_at(candidate, Local::now().naive_local())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mode": self.mode(),
            "activationDate": self
                .settings
                .activation_date
                .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
            "activeSemester": self.settings.active_semester,
            "strictActive": self.is_strict_active(),
            "error": self.error(),
        })
    }
}

/// True when the end of the semester's last day lies strictly before
/// `reference`. No end date, or an unreadable one, is never expired.
pub fn is_semester_expired_at(metadata: &SemesterMetadata, reference: NaiveDateTime) -> bool {
    let Some(end) = metadata.tanggal_selesai.as_deref().and_then(parse_date) else {
        return false;
    };
    let Some(end_of_day) = NaiveTime::from_hms_milli_opt(23, 59, 59, 999) else {
        return false;
    };
    end.and_time(end_of_day) < reference
}

pub fn is_semester_expired(metadata: &SemesterMetadata) -> bool {
    is_semester_expired_at(metadata, Local::now().naive_local())
}
