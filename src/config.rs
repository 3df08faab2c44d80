use std::path::PathBuf;

pub const WORKSPACE_ENV: &str = "RAPORD_WORKSPACE";
pub const LOG_ENV: &str = "RAPORD_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// Startup configuration. Everything a workspace needs at runtime lives in
/// its own `settings` table instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            workspace: non_blank(WORKSPACE_ENV).map(PathBuf::from),
            log_filter: non_blank(LOG_ENV).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}
