//! `tracing` subscriber setup.
//!
//! The store only emits `tracing` events; it never installs a subscriber on
//! its own. Binaries call [`init_subscriber`] before opening a store, as
//! `ed-cli` does with its `--log-level` flag.

/// Initialize the global tracing subscriber with compact stderr output.
///
/// A set `RUST_LOG` replaces `level` entirely, so per-target directives such
/// as `RUST_LOG=ed_store::sqlite=debug` reach the pool and statement logs
/// without raising the level of everything else. Stdout is left to the
/// caller's own output (the driver prints its report there). Only the first
/// call installs a subscriber; later calls, and calls after a test harness
/// installed one, are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init fails once a global default exists
    let _ = subscriber.try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
