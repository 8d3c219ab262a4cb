//! Common test utilities: tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ...
//! }
//! ```
//!
//! Filter directives come from `RUST_LOG` (e.g. `blinktree=trace`);
//! without it only warnings show. The library side emits events only
//! when built with the `tracing` cargo feature:
//!
//! ```bash
//! RUST_LOG=blinktree=trace cargo test --features tracing --test concurrent_stress
//! ```

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber for this test binary.
///
/// Safe to call multiple times; only the first call takes effect. Output
/// goes through the capturing test writer, so passing tests stay quiet.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
