//! The session handle (§2 item 2 "Handle", §3).
//!
//! [`Session`] is a cheap, `Clone`-able reference to shared, `RefCell`-guarded
//! state — the Rust shape of what the source models as a heap-allocated
//! `guestfs_h *` passed around by pointer. The `Rc<RefCell<_>>` wrapping is
//! what lets a callback registered with the event loop reach back into the
//! session it belongs to (to update state, deregister a watch, or run a
//! nested wait) without the embedder ever juggling raw pointers.
//!
//! Every borrow of the inner state is scoped tightly around its own
//! bookkeeping and dropped before a stored callback is invoked — the same
//! discipline [`crate::event_loop::poll::PollEventLoop`] uses — so a reply
//! callback is free to call [`Session::wait_ready`] or issue another launch
//! step without tripping a `RefCell` panic.

use std::cell::RefCell;
use std::io::{ErrorKind, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use crate::callbacks::CallbackTable;
use crate::config::{LaunchConfig, RESERVED_FLAGS};
use crate::demux::{self, FrameOutcome};
use crate::error::{log_then_return, Error, Result};
use crate::event_loop::poll::PollEventLoop;
use crate::event_loop::{EventLoop, Interest, WatchToken};

/// The four-state lifecycle of §3. `Launching` always collapses back to
/// `Config` on child death rather than lingering; there is no separate
/// "crashed" state to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Config,
    Launching,
    Ready,
    Busy,
    Closed,
}

/// Owned descriptors and watches for one launched appliance. Kept as a
/// separate struct so a clean launch failure can simply drop it rather than
/// threading a dozen `Option`s through [`SessionData`] directly.
struct Subprocess {
    pid: libc::pid_t,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    sock_fd: RawFd,
    stdout_watch: WatchToken,
    sock_watch: WatchToken,
    tmpdir: PathBuf,
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.stdin_fd);
            libc::close(self.stdout_fd);
            libc::close(self.sock_fd);
        }
    }
}

struct SessionData {
    state: State,
    events: Box<dyn EventLoop>,
    config: LaunchConfig,
    callbacks: CallbackTable,
    cmdline: Vec<String>,
    verbose: bool,
    inbound: Vec<u8>,
    subprocess: Option<Subprocess>,
}

/// A session handle. Cheap to `Clone`; every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct Session {
    inner: Rc<RefCell<SessionData>>,
}

impl Session {
    /// Create a new handle in `Config` state, using the bundled
    /// [`PollEventLoop`] and [`LaunchConfig::default`].
    pub fn create() -> Session {
        Session::create_with(LaunchConfig::default(), PollEventLoop::new())
    }

    /// Create a new handle with an explicit launch configuration and event
    /// loop implementation.
    pub fn create_with(config: LaunchConfig, events: impl EventLoop + 'static) -> Session {
        let verbose = std::env::var_os(crate::config::DEBUG_ENV_VAR).map_or(false, |v| v == "1");
        Session {
            inner: Rc::new(RefCell::new(SessionData {
                state: State::Config,
                events: Box::new(events),
                config,
                callbacks: CallbackTable::new(),
                cmdline: Vec::new(),
                verbose,
                inbound: Vec::new(),
                subprocess: None,
            })),
        }
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.borrow_mut().verbose = verbose;
    }

    pub fn verbose(&self) -> bool {
        self.inner.borrow().verbose
    }

    pub fn set_error_callback(&self, cb: Option<crate::callbacks::ErrorCallback>) {
        self.inner.borrow_mut().callbacks.error = cb;
    }

    pub fn set_log_callback(&self, cb: Option<crate::callbacks::LogCallback>) {
        self.inner.borrow_mut().callbacks.log = cb;
    }

    pub fn set_reply_callback(&self, cb: Option<crate::callbacks::ReplyCallback>) {
        self.inner.borrow_mut().callbacks.reply = cb;
    }

    pub fn set_subprocess_quit_callback(&self, cb: Option<crate::callbacks::SubprocessQuitCallback>) {
        self.inner.borrow_mut().callbacks.subprocess_quit = cb;
    }

    pub fn set_launch_done_callback(&self, cb: Option<crate::callbacks::LaunchDoneCallback>) {
        self.inner.borrow_mut().callbacks.launch_done = cb;
    }

    pub fn set_out_of_memory_callback(&self, cb: Option<crate::callbacks::OutOfMemoryCallback>) {
        self.inner.borrow_mut().callbacks.out_of_memory = cb;
    }

    /// Append `-flag[=value]` to the command line (§4.1 `configure`). Valid
    /// only in `Config`; rejects the launcher's own reserved flags.
    pub fn configure(&self, flag: &str, value: Option<&str>) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        if data.state != State::Config {
            return data.fail(Error::usage("configure is only valid in the CONFIG state"));
        }
        if !flag.starts_with('-') {
            return data.fail(Error::usage(format!("flag {flag:?} must start with '-'")));
        }
        if RESERVED_FLAGS.contains(&flag) {
            return data.fail(Error::usage(format!("flag {flag:?} is reserved by the launcher")));
        }
        data.cmdline.push(flag.to_string());
        if let Some(value) = value {
            data.cmdline.push(value.to_string());
        }
        Ok(())
    }

    /// `-drive file=<filename>` (§4.1 `add_drive`). Rejects a filename
    /// containing a comma, since the hypervisor's drive option is itself
    /// comma-delimited (E3).
    pub fn add_drive(&self, filename: &str) -> Result<()> {
        self.check_no_comma(filename)?;
        self.configure("-drive", Some(&format!("file={filename}")))
    }

    /// `-cdrom <filename>` (§4.1 `add_cdrom`). Unlike `add_drive`, the
    /// source passes the filename straight through as `-cdrom`'s value
    /// rather than wrapping it in `file=`.
    pub fn add_cdrom(&self, filename: &str) -> Result<()> {
        self.check_no_comma(filename)?;
        self.configure("-cdrom", Some(filename))
    }

    fn check_no_comma(&self, filename: &str) -> Result<()> {
        if filename.contains(',') {
            let mut data = self.inner.borrow_mut();
            return data.fail(Error::usage(
                "filename cannot contain ',' (comma) character",
            ));
        }
        Ok(())
    }

    /// Observable command-line tail, for introspection and tests.
    pub fn cmdline(&self) -> Vec<String> {
        self.inner.borrow().cmdline.clone()
    }

    /// Launch the appliance (§4.2). Delegates the mechanics to
    /// [`crate::launcher::launch`]; kept here only so the public API reads
    /// as a single method on [`Session`].
    pub fn launch(&self) -> Result<()> {
        crate::launcher::launch(self)
    }

    /// Block, running the event loop, until the session leaves `Launching`
    /// (§4.3). Returns `Ok(())` once `Ready`, or an error if the loop
    /// returned for any other reason (most commonly: the child died first,
    /// which drains every registered watch and so unblocks `run()` on its
    /// own via `teardown_after_child_death` — without this needing to hook
    /// `subprocess_quit` itself).
    pub fn wait_ready(&self) -> Result<()> {
        {
            let data = self.inner.borrow();
            if data.state == State::Config {
                return Err(Error::usage("wait_ready called before launch"));
            }
            if data.state != State::Launching {
                return Ok(());
            }
        }

        let done = Rc::new(RefCell::new(false));
        let done_for_launch = done.clone();
        let session_for_launch = self.clone();
        self.inner.borrow_mut().callbacks.launch_done_internal = Some(Box::new(move || {
            *done_for_launch.borrow_mut() = true;
            session_for_launch.quit_events();
        }));

        self.run_events();

        self.inner.borrow_mut().callbacks.launch_done_internal = None;

        if !*done.borrow() {
            return Err(Error::usage(
                "wait_ready failed, see earlier error messages",
            ));
        }
        if self.inner.borrow().state != State::Ready {
            return Err(Error::usage(
                "appliance launched and contacted daemon, but state != READY",
            ));
        }
        Ok(())
    }

    /// Send `SIGTERM` to the child (§4.2 final paragraph, §4.1
    /// `kill_subprocess`). Reaping happens on the stdout-EOF path, or
    /// synchronously in [`Session::close`].
    pub fn kill_subprocess(&self) -> Result<()> {
        let data = self.inner.borrow();
        match &data.subprocess {
            Some(sp) => {
                let pid = sp.pid;
                drop(data);
                // SAFETY: `pid` names a child we forked and have not yet reaped.
                unsafe { libc::kill(pid, libc::SIGTERM) };
                Ok(())
            }
            None => Err(Error::usage("no subprocess to kill")),
        }
    }

    /// Tear the handle down (§4.1 `close`). Idempotent: a second call on an
    /// already-`Closed` handle logs a diagnostic and returns.
    pub fn close(&self) {
        {
            let mut data = self.inner.borrow_mut();
            if data.state == State::Closed {
                eprintln!("vmsession: close called on an already-closed handle");
                return;
            }
            data.callbacks.clear_log();
        }

        let subprocess = self.inner.borrow_mut().subprocess.take();
        if let Some(sp) = subprocess {
            self.deregister(&sp);
            // SAFETY: `sp.pid` names a child we forked and have not reaped.
            unsafe {
                libc::kill(sp.pid, libc::SIGTERM);
                let mut status = 0;
                libc::waitpid(sp.pid, &mut status, 0);
            }
            let _ = std::fs::remove_file(sp.tmpdir.join("sock"));
            let _ = std::fs::remove_dir(&sp.tmpdir);
        }

        let mut data = self.inner.borrow_mut();
        data.cmdline.clear();
        data.state = State::Closed;
        data.callbacks.clear_all();
    }

    /// Clone a handle to the session's event loop and run it. The clone
    /// borrows `self.inner` only long enough to call
    /// [`crate::event_loop::EventLoop::try_clone`] — never across the
    /// blocking `run()` itself — so a callback dispatched from inside it is
    /// free to clone its own handle and `quit()` or re-enter `run()`.
    fn run_events(&self) {
        let mut handle = self.inner.borrow().events.try_clone();
        handle.run();
    }

    fn quit_events(&self) {
        let mut handle = self.inner.borrow().events.try_clone();
        let _ = handle.quit();
    }

    fn deregister(&self, sp: &Subprocess) {
        let mut data = self.inner.borrow_mut();
        let _ = data.events.remove_handle(sp.stdout_watch);
        let _ = data.events.remove_handle(sp.sock_watch);
    }

    /// Collapse back to `Config`, tear down descriptors and watches, and
    /// fire `subprocess_quit`. Shared by the stdout-EOF path and any other
    /// async detection of child death; distinct from [`Session::close`],
    /// which reaps synchronously and does not notify the caller (§9).
    #[tracing::instrument(skip(self))]
    fn teardown_after_child_death(&self) {
        metrics::counter!("vmsession_child_deaths_total").increment(1);
        tracing::warn!("appliance subprocess died, collapsing to CONFIG");
        let subprocess = self.inner.borrow_mut().subprocess.take();
        if let Some(sp) = subprocess {
            self.deregister(&sp);
            unsafe {
                let mut status = 0;
                libc::waitpid(sp.pid, &mut status, 0);
            }
            let _ = std::fs::remove_file(sp.tmpdir.join("sock"));
            let _ = std::fs::remove_dir(&sp.tmpdir);
        }

        {
            let mut data = self.inner.borrow_mut();
            data.state = State::Config;
            data.inbound.clear();
        }

        let cb = self.inner.borrow_mut().callbacks.subprocess_quit.take();
        if let Some(mut cb) = cb {
            cb();
            let mut data = self.inner.borrow_mut();
            if data.callbacks.subprocess_quit.is_none() {
                data.callbacks.subprocess_quit = Some(cb);
            }
        }
    }

    /// §4.4: fires once per chunk read from the child's console pipe. EOF
    /// tears the subprocess down; `EAGAIN` is swallowed (spurious
    /// readiness); everything else is mirrored to the log callback and, in
    /// verbose mode, to stderr.
    pub(crate) fn handle_stdout_event(&self, _interest: Interest) {
        let fd = match &self.inner.borrow().subprocess {
            Some(sp) => sp.stdout_fd,
            None => return,
        };

        let mut buf = [0u8; 4096];
        // SAFETY: `fd` is a valid, open, non-blocking pipe read end owned by
        // this session's subprocess for as long as it's registered.
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::WouldBlock {
                return;
            }
            self.inner.borrow_mut().callbacks.report_error(format!("stdout read: {err}"));
            return;
        }

        if n == 0 {
            self.teardown_after_child_death();
            return;
        }

        let chunk = &buf[..n as usize];
        if self.inner.borrow().verbose {
            let _ = std::io::stderr().write_all(chunk);
        }

        let cb = self.inner.borrow_mut().callbacks.log.take();
        if let Some(mut cb) = cb {
            cb(chunk);
            let mut data = self.inner.borrow_mut();
            if data.callbacks.log.is_none() {
                data.callbacks.log = Some(cb);
            }
        }
    }

    /// §4.5: fires once per chunk read from the control socket. Runs the
    /// pure [`demux::parse_frame`] state machine against the session's
    /// inbound buffer, possibly multiple times if one read delivered more
    /// than one frame's worth of bytes.
    pub(crate) fn handle_channel_event(&self, _interest: Interest) {
        let fd = match &self.inner.borrow().subprocess {
            Some(sp) => sp.sock_fd,
            None => return,
        };

        loop {
            let wanted = {
                let mut data = self.inner.borrow_mut();
                match demux::reserve_for_read(&mut data.inbound, 4096) {
                    Ok(()) => {}
                    Err(_) => {
                        drop(data);
                        self.report_out_of_memory();
                        return;
                    }
                }
                data.inbound.capacity() - data.inbound.len()
            };

            let mut tmp = vec![0u8; wanted.max(1)];
            // SAFETY: `fd` is a valid, open, non-blocking socket owned by
            // this session's subprocess for as long as it's registered.
            let n = unsafe {
                libc::read(fd, tmp.as_mut_ptr() as *mut libc::c_void, tmp.len())
            };

            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::WouldBlock {
                    return;
                }
                self.inner.borrow_mut().callbacks.report_error(format!("channel read: {err}"));
                return;
            }
            if n == 0 {
                // Disconnected; ignore it, the stdout-EOF path will do the
                // teardown once the child actually dies (§4.5 step 2). A
                // blocking `waitpid` here would stall the event loop on a
                // child that's still alive.
                return;
            }

            {
                let mut data = self.inner.borrow_mut();
                data.inbound.extend_from_slice(&tmp[..n as usize]);
            }

            if !self.drain_frames() {
                return;
            }
            if (n as usize) < tmp.len() {
                // Short read: the pipe is drained for now.
                return;
            }
        }
    }

    /// Parse as many complete frames as the buffer currently holds. Returns
    /// `false` if a framing error tore the session down (so the caller must
    /// stop touching this session's descriptors).
    fn drain_frames(&self) -> bool {
        loop {
            let outcome = {
                let mut data = self.inner.borrow_mut();
                demux::parse_frame(&mut data.inbound)
            };

            match outcome {
                Ok(FrameOutcome::NeedMore) => return true,
                Ok(FrameOutcome::Sentinel) => {
                    let in_launching = self.inner.borrow().state == State::Launching;
                    if !in_launching {
                        self.inner
                            .borrow_mut()
                            .callbacks
                            .report_error("ready sentinel received outside LAUNCHING");
                        continue;
                    }
                    self.inner.borrow_mut().state = State::Ready;
                    self.fire_launch_done();
                }
                Ok(FrameOutcome::Frame(payload)) => {
                    let was_busy = self.inner.borrow().state == State::Busy;
                    if !was_busy {
                        self.inner
                            .borrow_mut()
                            .callbacks
                            .report_error("reply received while not BUSY");
                    }
                    self.inner.borrow_mut().state = State::Ready;
                    self.fire_reply(&payload);
                }
                Err(e) => {
                    self.inner.borrow_mut().callbacks.report_error(e.to_string());
                    return false;
                }
            }
        }
    }

    /// Both the internal and user launch-done slots fire, in that order, for
    /// the same event (§4.5 step 5) — unlike `reply`, this is not an
    /// internal-XOR-user delivery.
    fn fire_launch_done(&self) {
        let internal = self.inner.borrow_mut().callbacks.launch_done_internal.take();
        if let Some(mut cb) = internal {
            cb();
            let mut data = self.inner.borrow_mut();
            if data.callbacks.launch_done_internal.is_none() {
                data.callbacks.launch_done_internal = Some(cb);
            }
        }
        let user = self.inner.borrow_mut().callbacks.launch_done.take();
        if let Some(mut cb) = user {
            cb();
            let mut data = self.inner.borrow_mut();
            if data.callbacks.launch_done.is_none() {
                data.callbacks.launch_done = Some(cb);
            }
        }
    }

    fn fire_reply(&self, payload: &[u8]) {
        let internal = self.inner.borrow_mut().callbacks.reply_internal.take();
        if let Some(mut cb) = internal {
            cb(payload);
            let mut data = self.inner.borrow_mut();
            if data.callbacks.reply_internal.is_none() {
                data.callbacks.reply_internal = Some(cb);
            }
            return;
        }
        let user = self.inner.borrow_mut().callbacks.reply.take();
        if let Some(mut cb) = user {
            cb(payload);
            let mut data = self.inner.borrow_mut();
            if data.callbacks.reply.is_none() {
                data.callbacks.reply = Some(cb);
            }
        }
    }

    fn report_out_of_memory(&self) {
        self.inner.borrow_mut().callbacks.report_out_of_memory();
    }

    pub(crate) fn report_error(&self, msg: impl AsRef<str>) {
        self.inner.borrow_mut().callbacks.report_error(msg);
    }
}

impl SessionData {
    fn fail(&mut self, err: Error) -> Result<()> {
        self.callbacks.report_error(err.to_string());
        log_then_return!(err);
    }
}

pub(crate) struct LaunchHandles {
    pub(crate) pid: libc::pid_t,
    pub(crate) stdin_fd: RawFd,
    pub(crate) stdout_fd: RawFd,
    pub(crate) sock_fd: RawFd,
    pub(crate) tmpdir: PathBuf,
}

impl Session {
    /// Called by [`crate::launcher::launch`] once the child is spawned, the
    /// rendezvous socket connected, and both descriptors registered with the
    /// event loop. Moves the session into `Launching`.
    pub(crate) fn install_subprocess(
        &self,
        handles: LaunchHandles,
        stdout_watch: WatchToken,
        sock_watch: WatchToken,
    ) {
        let mut data = self.inner.borrow_mut();
        data.subprocess = Some(Subprocess {
            pid: handles.pid,
            stdin_fd: handles.stdin_fd,
            stdout_fd: handles.stdout_fd,
            sock_fd: handles.sock_fd,
            stdout_watch,
            sock_watch,
            tmpdir: handles.tmpdir,
        });
        data.state = State::Launching;
    }

    pub(crate) fn borrow_events(&self) -> std::cell::RefMut<'_, dyn EventLoop> {
        std::cell::RefMut::map(self.inner.borrow_mut(), |d| &mut *d.events)
    }

    pub(crate) fn config(&self) -> LaunchConfig {
        self.inner.borrow().config.clone()
    }

    pub(crate) fn cmdline_tail(&self) -> Vec<String> {
        self.inner.borrow().cmdline.clone()
    }

    pub(crate) fn check_launch_precondition(&self) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        if data.state != State::Config {
            return data.fail(Error::usage("launch is only valid in the CONFIG state"));
        }
        if data.cmdline.is_empty() {
            return data.fail(Error::usage(
                "launch requires at least one add_drive/add_cdrom/configure call first",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_in_config() {
        let s = Session::create();
        assert_eq!(s.state(), State::Config);
    }

    #[test]
    fn configure_rejects_flags_without_a_dash() {
        let s = Session::create();
        assert!(s.configure("kernel", None).is_err());
    }

    #[test]
    fn configure_rejects_reserved_flags() {
        let s = Session::create();
        assert!(s.configure("-kernel", Some("foo")).is_err());
    }

    #[test]
    fn add_drive_appends_expected_tail() {
        let s = Session::create();
        s.add_drive("disk.img").unwrap();
        assert_eq!(s.cmdline(), vec!["-drive".to_string(), "file=disk.img".to_string()]);
    }

    #[test]
    fn add_cdrom_appends_expected_tail() {
        let s = Session::create();
        s.add_cdrom("rescue.iso").unwrap();
        assert_eq!(
            s.cmdline(),
            vec!["-cdrom".to_string(), "rescue.iso".to_string()]
        );
    }

    #[test]
    fn configure_outside_config_state_fails() {
        let s = Session::create();
        s.inner.borrow_mut().state = State::Ready;
        assert!(s.configure("-foo", None).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let s = Session::create();
        s.close();
        assert_eq!(s.state(), State::Closed);
        s.close();
        assert_eq!(s.state(), State::Closed);
    }

    #[test]
    fn wait_ready_without_launch_is_a_usage_error() {
        let s = Session::create();
        assert!(s.wait_ready().is_err());
    }

    #[test]
    fn kill_subprocess_without_one_running_is_a_usage_error() {
        let s = Session::create();
        assert!(s.kill_subprocess().is_err());
    }

    /// Wires a session into `Launching` with a pair of `UnixStream`s standing
    /// in for the real stdout pipe and rendezvous socket, exactly as
    /// `crate::launcher::launch` would: watches registered, descriptors
    /// handed to an owned [`Subprocess`]. Returns the peer ends the test
    /// drives (write to `stdout_peer` to simulate console chatter or drop it
    /// for EOF; write to `sock_peer` to simulate daemon frames).
    fn fake_launch(s: &Session) -> (std::os::unix::net::UnixStream, std::os::unix::net::UnixStream) {
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let (stdin_ours, _stdin_peer) = UnixStream::pair().unwrap();
        let (stdout_ours, stdout_peer) = UnixStream::pair().unwrap();
        let (sock_ours, sock_peer) = UnixStream::pair().unwrap();
        stdout_ours.set_nonblocking(true).unwrap();
        sock_ours.set_nonblocking(true).unwrap();

        let stdin_fd = stdin_ours.into_raw_fd();
        let stdout_fd = stdout_ours.into_raw_fd();
        let sock_fd = sock_ours.into_raw_fd();

        let stdout_watch = {
            let mut events = s.borrow_events();
            let s_cb = s.clone();
            events
                .add_handle(
                    stdout_fd,
                    Interest::READABLE,
                    Box::new(move |interest| s_cb.handle_stdout_event(interest)),
                )
                .unwrap()
        };
        let sock_watch = {
            let mut events = s.borrow_events();
            let s_cb = s.clone();
            events
                .add_handle(
                    sock_fd,
                    Interest::READABLE | Interest::HANGUP | Interest::ERROR,
                    Box::new(move |interest| s_cb.handle_channel_event(interest)),
                )
                .unwrap()
        };

        s.install_subprocess(
            LaunchHandles {
                pid: 999_999_937,
                stdin_fd,
                stdout_fd,
                sock_fd,
                tmpdir: std::env::temp_dir().join("vmsession-test-unused"),
            },
            stdout_watch,
            sock_watch,
        );

        (stdout_peer, sock_peer)
    }

    #[test]
    fn wait_ready_succeeds_when_the_sentinel_arrives() {
        use std::io::Write;

        let s = Session::create();
        let (_stdout_peer, mut sock_peer) = fake_launch(&s);
        sock_peer.write_all(&0xF5F5_5FF5u32.to_be_bytes()).unwrap();

        s.wait_ready().unwrap();
        assert_eq!(s.state(), State::Ready);
    }

    #[test]
    fn wait_ready_fails_when_the_child_dies_first() {
        let s = Session::create();
        let (stdout_peer, _sock_peer) = fake_launch(&s);
        drop(stdout_peer); // EOF on the stdout pipe: the child "died".

        assert!(s.wait_ready().is_err());
        assert_eq!(s.state(), State::Config);
    }

    #[test]
    fn reply_callback_fires_once_the_session_is_busy() {
        use std::cell::RefCell;
        use std::io::Write;
        use std::rc::Rc;

        let s = Session::create();
        let (_stdout_peer, mut sock_peer) = fake_launch(&s);
        sock_peer.write_all(&0xF5F5_5FF5u32.to_be_bytes()).unwrap();
        s.wait_ready().unwrap();
        s.inner.borrow_mut().state = State::Busy;

        let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
        let received_cb = received.clone();
        s.set_reply_callback(Some(Box::new(move |payload| {
            *received_cb.borrow_mut() = Some(payload.to_vec());
        })));

        sock_peer.write_all(&3u32.to_be_bytes()).unwrap();
        sock_peer.write_all(b"ABC").unwrap();

        s.handle_channel_event(Interest::READABLE);

        assert_eq!(received.borrow().as_deref(), Some(&b"ABC"[..]));
        assert_eq!(s.state(), State::Ready);
    }
}
