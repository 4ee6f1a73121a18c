//! Logging setup shared by the binary and any test harness that wants
//! real log output. Format (human vs JSON) is chosen by an env var so the
//! same binary behaves differently in a dev shell and in a container.

/// Initialize the global `tracing` subscriber.
///
/// `MINDMAP_LOG_JSON=1` switches to structured JSON output for production
/// log collectors; otherwise a compact human-readable format is used.
/// `RUST_LOG` overrides the default level filter when set.
pub fn init() {
    let json_logging = std::env::var("MINDMAP_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("mindmap=info")
            .add_directive(tracing::Level::INFO.into())
            .add_directive(tracing::Level::WARN.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}
