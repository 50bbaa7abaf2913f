//! The default, bundled [`EventLoop`] implementation, built on `libc::poll`.
//!
//! Design Note 9.2 ("process-global event loop state") asks for this to be
//! instance-scoped rather than file-scope static storage, so a process can
//! run more than one independent loop (or more than one [`Session`] on the
//! same loop). [`PollEventLoop`] is cheaply [`Clone`] — it's a handle to
//! `Rc<RefCell<Inner>>` — which is what lets a callback registered with the
//! loop reenter `add_handle`/`run`/`quit` on the very loop that's currently
//! dispatching it: the loop never holds a borrow across `poll(2)` or across
//! a callback invocation, only across the short bookkeeping steps around it.
//!
//! [`Session`]: crate::session::Session

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration;

use super::{EventLoop, HandleCallback, Interest, TimeoutCallback, TimeoutToken, WatchToken};
use crate::error::{Error, Result};

/// Upper bound on registrable descriptors. `poll(2)` itself has no such
/// limit, but the contract in §4.6/B4 is part of the core's observable
/// behavior, so it's enforced here regardless of multiplexer choice.
pub const MAX_FDS: RawFd = 4096;

struct Entry {
    interest: Interest,
    callback: Option<HandleCallback>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<RawFd, Entry>,
    level: u32,
}

/// The bundled poll(2)-based event loop. Timerless: `add_timeout` and
/// `remove_timeout` return [`Error::Unsupported`] rather than aborting, the
/// Open Question in SPEC_FULL.md §9 resolved towards a plain error since
/// nothing in the core itself schedules a timer.
#[derive(Clone)]
pub struct PollEventLoop {
    inner: Rc<RefCell<Inner>>,
}

impl Default for PollEventLoop {
    fn default() -> Self {
        PollEventLoop {
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }
}

impl PollEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    fn interest_to_events(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.contains(Interest::READABLE) {
            events |= libc::POLLIN;
        }
        if interest.contains(Interest::WRITABLE) {
            events |= libc::POLLOUT;
        }
        // HANGUP/ERROR are always reported by the kernel regardless of the
        // requested mask, but request them explicitly for clarity.
        events |= libc::POLLHUP | libc::POLLERR;
        events as libc::c_short
    }

    fn events_to_interest(revents: libc::c_short) -> Interest {
        let revents = revents as libc::c_int;
        let mut interest = Interest::empty();
        if revents & libc::POLLIN != 0 {
            interest |= Interest::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            interest |= Interest::WRITABLE;
        }
        if revents & libc::POLLHUP != 0 {
            interest |= Interest::HANGUP;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            interest |= Interest::ERROR;
        }
        interest
    }
}

impl EventLoop for PollEventLoop {
    fn add_handle(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: HandleCallback,
    ) -> Result<WatchToken> {
        if fd < 0 || fd >= MAX_FDS {
            return Err(Error::usage(format!("fd {fd} is out of range")));
        }
        if interest.is_empty() {
            return Err(Error::usage("set of events is empty"));
        }

        let mut inner = self.inner.borrow_mut();
        if inner.entries.contains_key(&fd) {
            return Err(Error::usage(format!("fd {fd} is already registered")));
        }
        inner.entries.insert(
            fd,
            Entry {
                interest,
                callback: Some(callback),
            },
        );
        Ok(WatchToken(fd))
    }

    fn remove_handle(&mut self, token: WatchToken) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.entries.remove(&token.0).is_none() {
            return Err(Error::usage(format!("fd {} was not registered", token.0)));
        }
        Ok(())
    }

    fn add_timeout(&mut self, _after: Duration, _callback: TimeoutCallback) -> Result<TimeoutToken> {
        Err(Error::Unsupported)
    }

    fn remove_timeout(&mut self, _token: TimeoutToken) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn run(&mut self) {
        let entry_level = self.inner.borrow().level;
        self.inner.borrow_mut().level += 1;

        loop {
            let (has_entries, cur_level) = {
                let inner = self.inner.borrow();
                (!inner.entries.is_empty(), inner.level)
            };
            if cur_level <= entry_level {
                break;
            }
            if !has_entries {
                self.inner.borrow_mut().level = entry_level;
                break;
            }

            let watch_list: Vec<(RawFd, Interest)> = {
                let inner = self.inner.borrow();
                inner.entries.iter().map(|(fd, e)| (*fd, e.interest)).collect()
            };
            let mut pollfds: Vec<libc::pollfd> = watch_list
                .iter()
                .map(|(fd, interest)| libc::pollfd {
                    fd: *fd,
                    events: Self::interest_to_events(*interest),
                    revents: 0,
                })
                .collect();

            // SAFETY: `pollfds` is a valid, exclusively-owned buffer of the
            // length passed, alive for the duration of the call.
            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "poll failed");
                self.inner.borrow_mut().level = entry_level;
                break;
            }

            for pfd in &pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                let observed = Self::events_to_interest(pfd.revents);

                let cb = {
                    let mut inner = self.inner.borrow_mut();
                    inner.entries.get_mut(&pfd.fd).and_then(|e| e.callback.take())
                };
                if let Some(mut cb) = cb {
                    cb(observed);
                    let mut inner = self.inner.borrow_mut();
                    if let Some(e) = inner.entries.get_mut(&pfd.fd) {
                        if e.callback.is_none() {
                            e.callback = Some(cb);
                        }
                    }
                }
            }
        }
    }

    fn quit(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.level == 0 {
            return Err(Error::usage("cannot quit, we are not in a main loop"));
        }
        inner.level -= 1;
        Ok(())
    }

    fn try_clone(&self) -> Box<dyn EventLoop> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::cell::RefCell;

    #[test]
    fn add_handle_rejects_out_of_range_fd() {
        let mut el = PollEventLoop::new();
        assert!(el.add_handle(-1, Interest::READABLE, Box::new(|_| {})).is_err());
        assert!(el
            .add_handle(MAX_FDS, Interest::READABLE, Box::new(|_| {}))
            .is_err());
    }

    #[test]
    fn add_handle_rejects_empty_mask() {
        let mut el = PollEventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(el
            .add_handle(a.as_raw_fd(), Interest::empty(), Box::new(|_| {}))
            .is_err());
    }

    #[test]
    fn add_handle_rejects_duplicate_fd() {
        let mut el = PollEventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        el.add_handle(fd, Interest::READABLE, Box::new(|_| {})).unwrap();
        assert!(el.add_handle(fd, Interest::READABLE, Box::new(|_| {})).is_err());
    }

    #[test]
    fn quit_outside_run_is_an_error() {
        let mut el = PollEventLoop::new();
        assert!(el.quit().is_err());
    }

    #[test]
    fn run_dispatches_readable_and_quits() {
        let mut el = PollEventLoop::new();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"hi").unwrap();

        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let mut el_clone = el.clone();
        let fd = a.as_raw_fd();
        el.add_handle(
            fd,
            Interest::READABLE,
            Box::new(move |interest| {
                assert!(interest.contains(Interest::READABLE));
                let mut buf = [0u8; 8];
                let n = a.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], b"hi");
                *fired2.borrow_mut() = true;
                el_clone.quit().unwrap();
            }),
        )
        .unwrap();

        el.run();
        assert!(*fired.borrow());
    }

    #[test]
    fn run_exits_when_no_handles_remain() {
        let mut el = PollEventLoop::new();
        // No watches registered: run() must return immediately rather than
        // block forever.
        el.run();
    }

    #[test]
    fn callback_can_reenter_add_handle() {
        let mut el = PollEventLoop::new();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let (c, mut d) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        d.write_all(b"y").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_c = seen.clone();
        let mut el_for_a = el.clone();
        let mut el_for_c = el.clone();

        let c_fd = c.as_raw_fd();
        el.add_handle(
            a.as_raw_fd(),
            Interest::READABLE,
            Box::new(move |_| {
                let mut buf = [0u8; 8];
                a.read(&mut buf).ok();
                seen_a.borrow_mut().push('a');
                el_for_a
                    .add_handle(
                        c_fd,
                        Interest::READABLE,
                        Box::new(move |_| {
                            let mut buf = [0u8; 8];
                            c.read(&mut buf).ok();
                            seen_c.borrow_mut().push('c');
                            el_for_c.quit().unwrap();
                        }),
                    )
                    .unwrap();
            }),
        )
        .unwrap();

        el.run();
        assert!(seen.borrow().contains(&'a'));
        assert!(seen.borrow().contains(&'c'));
    }
}
