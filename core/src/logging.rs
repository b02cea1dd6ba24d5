//! Logging setup.
//!
//! The crate logs through `tracing`. Applications install their own subscriber; `init` is a
//! convenience that installs a formatted subscriber filtered by the `PS_SYNC_LOG` environment
//! variable (default `info`), e.g. `PS_SYNC_LOG=ps_sync::synchronizer=debug`.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "PS_SYNC_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the subscriber is only installed once
static INIT: Once = Once::new();

/// Installs a global fmt subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .try_init();
    });
}

/// Like [`init`], but writes through the test harness so output is captured per test.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_test_writer()
            .try_init();
    });
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL))
}
