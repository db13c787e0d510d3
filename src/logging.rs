//! Log output for test binaries.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Output goes through the test writer, so `cargo test` captures it per test.
/// Safe to call from every test: only the first call installs anything.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], with a different filter when `RUST_LOG` is unset.
pub fn init_with_default(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_test_writer()
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_default("debug");
        tracing::info!("still logging");
    }
}
