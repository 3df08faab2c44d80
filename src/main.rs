mod calc;
mod config;
mod db;
mod ipc;
mod logging;
mod semester;

use std::io::{self, BufRead, Write};

fn main() {
    let cfg = config::DaemonConfig::from_env();
    logging::init(&cfg.log_filter);

    let mut state = ipc::AppState::new();
    if let Some(path) = cfg.workspace.as_deref() {
        // A bad startup workspace is not fatal; the UI can still select one.
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            tracing::error!(workspace = %path.display(), error = %e, "startup workspace failed to open");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rapord ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                // Can't reply without id.
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        tracing::debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed; shutting down");
}
