//! Log subscriber setup for processes and test suites that run queues.
//!
//! The queue crates only emit `tracing` events; nothing is printed until one
//! of these installs a subscriber. Events carry the queue name and message
//! id as fields and are filtered by `RUST_LOG` against the `msgqueue_*`
//! targets, e.g. `RUST_LOG=msgqueue_processor=debug` to follow every
//! reservation, retry and release.

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` if set and valid, otherwise `default` for every target.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install JSON logging for a service that embeds queues. Defaults to
/// `info`, which covers processor start/stop and dropped or failed
/// messages. Later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Install plain-text logging captured per test. Defaults to `warn` so that
/// only retries and staging fallbacks show up in a failing test's output.
/// Thread names are kept to tell fetcher, worker and deleter apart.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
