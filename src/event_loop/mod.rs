//! The pluggable event-loop interface (§2 item 1, §4.6).
//!
//! The core never blocks on I/O directly; it registers descriptor interest
//! with whatever [`EventLoop`] the embedder hands it and is driven entirely
//! by the callbacks that loop fires. [`poll::PollEventLoop`] is the bundled
//! default, built on `libc::poll` rather than `select`'s `FD_SETSIZE`-bounded
//! bitsets (see DESIGN.md).

pub mod poll;

use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Readiness bits a caller may register interest in. `HANGUP`/`ERROR`
    /// are always delivered together by the default loop (they share one
    /// underlying `poll` event class), matching the source's `xset`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const HANGUP   = 0b0100;
        const ERROR    = 0b1000;
    }
}

/// Opaque handle returned by [`EventLoop::add_handle`]; pass it back to
/// [`EventLoop::remove_handle`]. The default loop happens to make this the
/// watched fd, but callers must not rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub(crate) RawFd);

/// Opaque handle returned by [`EventLoop::add_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutToken(pub(crate) u64);

/// A callback fired by the event loop with the interest bits that were
/// actually observed ready.
pub type HandleCallback = Box<dyn FnMut(Interest)>;

/// A callback fired once, when a timeout elapses.
pub type TimeoutCallback = Box<dyn FnOnce()>;

/// Capability the core consumes to multiplex its three descriptors (child
/// stdin -- unused for reading, stdout, and the control socket) and to
/// implement the nested synchronous waits of §4.3.
pub trait EventLoop {
    /// Register `fd` for the given `interest`; `callback` fires once per
    /// iteration in which any of those bits become ready, with the observed
    /// subset.
    fn add_handle(&mut self, fd: RawFd, interest: Interest, callback: HandleCallback)
        -> Result<WatchToken>;

    /// Deregister a previously-added watch.
    fn remove_handle(&mut self, token: WatchToken) -> Result<()>;

    /// Schedule a one-shot timer. The default loop is timerless and returns
    /// [`crate::error::Error::Unsupported`]; nothing in the core itself
    /// calls this.
    fn add_timeout(&mut self, after: Duration, callback: TimeoutCallback) -> Result<TimeoutToken>;

    /// Cancel a pending timeout.
    fn remove_timeout(&mut self, token: TimeoutToken) -> Result<()>;

    /// Enter the loop. Increments the nesting level by one and blocks,
    /// dispatching ready callbacks, until a nested [`EventLoop::quit`] brings
    /// the level back down to (or below) the level at which this `run` was
    /// entered, or until no watches remain registered.
    fn run(&mut self);

    /// Unwind one level of `run`. Calling this while not inside any `run` is
    /// a usage error.
    fn quit(&mut self) -> Result<()>;

    /// Produce another handle to this same loop's shared state. Lets a
    /// callback fired from within [`EventLoop::run`] obtain its own `&mut`
    /// access to the loop (to `quit()` it, or re-enter `run()`) without ever
    /// needing two live `&mut` borrows of one object — each handle owns its
    /// own thin wrapper around the same underlying registry.
    fn try_clone(&self) -> Box<dyn EventLoop>;
}
