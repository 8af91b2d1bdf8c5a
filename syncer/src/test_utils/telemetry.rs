use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a global fmt subscriber for tests, once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `info` for the syncer.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("syncer=info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
