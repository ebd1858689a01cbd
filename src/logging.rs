//! Log subscriber setup for hosts embedding the search pipeline.
//!
//! Library code logs through the `log` macros; the subscriber installed here
//! also captures those records through tracing's log bridge.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive (e.g. `skillsearch=debug`).
pub const LOG_ENV: &str = "SKILLSEARCH_LOG";

/// Install a fmt subscriber filtered by `SKILLSEARCH_LOG`, or `default_filter` when unset.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
