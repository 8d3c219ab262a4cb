//! Zero-cost tracing shims.
//!
//! With the `tracing` cargo feature enabled these forward to the
//! `tracing` crate; without it they compile away entirely, keeping the
//! hot paths free of any logging cost.
//!
//! ```bash
//! # instrumented test run
//! RUST_LOG=blinktree=trace cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use {debug_log, trace_log};
