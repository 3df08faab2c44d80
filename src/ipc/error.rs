use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Failure inside a handler, rendered into the error envelope by
/// [`HandlerErr::response`].
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self::new("db_query_failed", format!("{e:#}"))
    }
}

/// Attaches a specific code to a storage failure, e.g. `db_insert_failed`.
pub trait DbResultExt<T> {
    fn db_err(self, code: &'static str, table: &str) -> Result<T, HandlerErr>;
}

impl<T> DbResultExt<T> for rusqlite::Result<T> {
    fn db_err(self, code: &'static str, table: &str) -> Result<T, HandlerErr> {
        self.map_err(|e| HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table })))
    }
}
