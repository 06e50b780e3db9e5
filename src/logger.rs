//! Logging setup shared by the `bundle_adjustment` binary and the benchmarks.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the executable.

use tracing::Level;

/// Install the default subscriber at INFO level.
///
/// `RUST_LOG` overrides the level, e.g. `RUST_LOG=apex_ba=debug` prints every
/// Levenberg-Marquardt state transition.
///
/// # Example
/// ```no_run
/// apex_ba::init_logger();
/// tracing::info!("loading dataset");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the default subscriber with a custom default level.
///
/// Calling this twice is harmless: the second installation is ignored.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .try_init();
}
