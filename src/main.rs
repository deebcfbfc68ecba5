mod calc;
mod config;
mod db;
mod ipc;
mod leave;
mod model;
mod qr;
mod repo;
mod sessions;
mod verification;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("attendd=info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    // .env may carry RUST_LOG, so load it before the subscriber reads the filter.
    dotenvy::dotenv().ok();
    init_tracing();
    let config = config::AppConfig::from_env();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        academic_start_date = %config.attendance.academic_start_date,
        utc_offset_minutes = config.attendance.utc_offset_minutes,
        "attendd starting"
    );
    let mut state = ipc::AppState::new(config);

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
                // Can't reply without id.
                tracing::warn!(error = %e, "unparseable request line");
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
