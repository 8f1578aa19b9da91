//! Feature-gated tracing macros for zero-overhead instrumentation.
//!
//! With the `tracing` feature the tracing crate's macros are re-exported;
//! without it every macro compiles to a no-op.

#[cfg(feature = "tracing")]
pub use tracing::{debug, debug_span, info, trace, Span};

#[cfg(not(feature = "tracing"))]
mod noop {
    /// No-op span that does nothing
    pub struct Span;

    impl Span {
        pub fn none() -> Self {
            Span
        }

        pub fn entered(self) -> SpanGuard {
            SpanGuard
        }
    }

    /// No-op guard that implements Drop
    pub struct SpanGuard;

    impl Drop for SpanGuard {
        fn drop(&mut self) {}
    }

    #[macro_export]
    macro_rules! trace {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! debug {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! info {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! debug_span {
        ($($tt:tt)*) => {
            $crate::trace::Span::none()
        };
    }

    pub use crate::{debug, debug_span, info, trace};
}

#[cfg(not(feature = "tracing"))]
pub use noop::*;

/// Initialize a tracing subscriber for tests/development.
///
/// Reads the filter from the environment (`RUST_LOG`), defaulting to
/// `info`. Safe to call more than once.
#[cfg(feature = "tracing")]
pub fn init_subscriber() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
        .ok();
}

#[cfg(not(feature = "tracing"))]
pub fn init_subscriber() {}
