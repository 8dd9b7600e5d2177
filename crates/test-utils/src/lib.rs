//! Shared helpers for the `dagcluster` integration tests.
//!
//! - [`builders`]: workflow text and worker registrations.
//! - [`fake_worker`]: a protocol-level worker that never starts a process.

pub mod builders;
pub mod fake_worker;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Upper bound for one master/worker exchange in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a test-captured subscriber once per test binary.
///
/// Output only shows for failing tests unless run with `--nocapture`.
/// `RUST_LOG=dagcluster=trace` turns on per-message protocol logging.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,dagcluster=info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, failing the test after [`TEST_TIMEOUT`].
///
/// A lost message makes the master or a worker wait forever; this turns
/// that hang into a failure.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("test timed out after {TEST_TIMEOUT:?}"))
}
