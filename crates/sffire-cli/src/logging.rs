use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber for `sync` and `check` runs.
///
/// `RUST_LOG` directives take precedence, so `RUST_LOG=sffire_storage=debug`
/// can surface per-connection detail while `--log-level` stays at `info`.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
