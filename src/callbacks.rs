//! The callback registry (§2 item 6, §3 "Callback Table").
//!
//! The source models each callback as a `(function pointer, opaque user
//! datum)` pair so C call sites can thread arbitrary state through a
//! function-pointer boundary. Rust's idiomatic equivalent is a boxed
//! closure that has already captured its datum by move — there is no
//! separate `data` field here, the closure *is* `(function, datum)` fused
//! together. The internal/user duality from the source survives as two
//! distinct optional slots for the callback kinds that need it.

/// Fired when a public operation fails. Receives the already-formatted
/// message; if unset, failures are silently dropped (matching the source's
/// `if (!g->error_cb) return;`).
pub type ErrorCallback = Box<dyn FnMut(&str)>;

/// Fired on allocator failure at the one fallible-growth site the core
/// controls. By default this aborts the process, matching the source's
/// `abort_cb`.
pub type OutOfMemoryCallback = Box<dyn FnMut()>;

/// Fired once per chunk of bytes read from the child's stdout/console pipe.
/// Chunk boundaries are arbitrary; the callback must tolerate partial lines.
pub type LogCallback = Box<dyn FnMut(&[u8])>;

/// Fired when a reply frame is demultiplexed off the control socket, with
/// its raw payload bytes.
pub type ReplyCallback = Box<dyn FnMut(&[u8])>;

/// Fired once, from the stdout-EOF teardown path, after the session has
/// already collapsed to `CONFIG`.
pub type SubprocessQuitCallback = Box<dyn FnMut()>;

/// Fired when the ready sentinel arrives and the session transitions to
/// `READY`.
pub type LaunchDoneCallback = Box<dyn FnMut()>;

/// Default error callback: write a one-line message to stderr, exactly as
/// the source's `default_error_cb` does.
pub(crate) fn default_error_callback() -> ErrorCallback {
    Box::new(|msg: &str| {
        eprintln!("vmsession: error: {msg}");
    })
}

/// Default out-of-memory callback: terminate the process. Preserves the
/// source's `abort_cb` default of `abort()`.
pub(crate) fn default_out_of_memory_callback() -> OutOfMemoryCallback {
    Box::new(|| {
        eprintln!("vmsession: out of memory, aborting");
        std::process::abort();
    })
}

/// All registered callbacks for one [`crate::session::Session`]. `reply` and
/// `launch_done` each carry an extra internal slot used by synchronous
/// helpers ([`crate::session::Session::wait_ready`] and friends) to observe
/// the next matching event without disturbing whatever the caller has
/// installed.
#[derive(Default)]
pub(crate) struct CallbackTable {
    pub(crate) error: Option<ErrorCallback>,
    pub(crate) out_of_memory: Option<OutOfMemoryCallback>,
    pub(crate) log: Option<LogCallback>,
    pub(crate) reply: Option<ReplyCallback>,
    pub(crate) reply_internal: Option<ReplyCallback>,
    pub(crate) subprocess_quit: Option<SubprocessQuitCallback>,
    pub(crate) launch_done: Option<LaunchDoneCallback>,
    pub(crate) launch_done_internal: Option<LaunchDoneCallback>,
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        CallbackTable {
            error: Some(default_error_callback()),
            out_of_memory: Some(default_out_of_memory_callback()),
            ..Default::default()
        }
    }

    /// Format and dispatch to the error callback, matching the source's
    /// `error()`/`perrorf()` helpers. Silently dropped if unset.
    pub(crate) fn report_error(&mut self, msg: impl AsRef<str>) {
        if let Some(cb) = self.error.as_mut() {
            cb(msg.as_ref());
        }
    }

    pub(crate) fn report_out_of_memory(&mut self) {
        match self.out_of_memory.as_mut() {
            Some(cb) => cb(),
            None => std::process::abort(),
        }
    }

    /// Clears the log callback, as `close` does before tearing down the
    /// subprocess, so no further log messages are delivered mid-teardown.
    pub(crate) fn clear_log(&mut self) {
        self.log = None;
    }

    /// Clears every callback. Called at the end of `close`: per P4, nothing
    /// registered on the handle fires again afterwards.
    pub(crate) fn clear_all(&mut self) {
        *self = CallbackTable::default();
    }
}
