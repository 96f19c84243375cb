//! Helpers for testing the revalidate crates.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Cached values live on wall-clock time, not on the tokio clock, so tests
//!    use real (short) sleeps. Prefer [`eventually`] over a fixed sleep when
//!    waiting for a background refresh to land; it polls and gives slow CI
//!    machines room to catch up.

use std::time::{Duration, Instant};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `revalidate`
///    crates and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("revalidate=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Polls `predicate` until it holds or `deadline` elapses, returning whether
/// it ever held.
pub async fn eventually(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
