//! Crate-wide error type.
//!
//! Mirrors the teacher's split between an internal, structured [`Error`] and
//! a narrower "format it and hand it to a callback" boundary at the public
//! API (see [`crate::session::Session`]): every fallible internal helper
//! returns [`Result<T>`], and the handful of public entry points convert an
//! `Err` into a formatted message passed to the user's error callback,
//! returning only a success/failure indicator to the caller.

use std::io;

/// The crate's `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong state, bad argument, disallowed flag, etc. Reported via the
    /// error callback; never fatal to the process.
    #[error("{0}")]
    Usage(String),

    /// A syscall failed (`errno` is folded into the message, `perrorf`-style).
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Malformed length prefix, straddling frame, or sentinel observed in the
    /// wrong state.
    #[error("framing error: {0}")]
    Framing(String),

    /// A fallible allocation (the inbound buffer's growth) could not be
    /// satisfied. The out-of-memory callback is invoked with this variant
    /// folded into a message; by default that callback aborts the process.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Returned by [`crate::event_loop::EventLoop::add_timeout`] on the
    /// default, timerless loop.
    #[error("timers are not supported by this event loop")]
    Unsupported,
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }
}

/// Log an error at `error` level, then return it wrapped in `Err`.
///
/// Equivalent in spirit to the teacher's `log_then_return!` macro: keeps the
/// tracing call and the early return next to each other at the call site
/// instead of splitting them across two lines everywhere.
macro_rules! log_then_return {
    ($err:expr) => {{
        let err = $err;
        tracing::error!(error = %err, "returning error");
        return Err(err);
    }};
}

pub(crate) use log_then_return;
