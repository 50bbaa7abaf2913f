//! The launch sequence (§4.2).
//!
//! Spawns the hypervisor via [`std::process::Command`] (its piped stdio is
//! exactly the two pipes the source sets up by hand with `pipe(2)` +
//! `fork(2)` + `dup2(2)`), then races a non-blocking connect against the
//! rendezvous socket the hypervisor itself is racing to bind. The connect
//! race has no `std` equivalent — `UnixStream::connect` is blocking with no
//! way to flip `O_NONBLOCK` first — so that one step goes through raw `libc`,
//! the same way the teacher reaches for `libc` at the seams `std` doesn't
//! cover.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use crate::config::{LaunchConfig, TMPDIR_TEMPLATE, VMCHANNEL_ADDR, VMCHANNEL_PORT};
use crate::error::{log_then_return, Error, Result};
use crate::event_loop::Interest;
use crate::session::{LaunchHandles, Session};

/// Drive the full launch sequence for `session`. On any failure, unwinds
/// whatever was already set up and leaves the session in `Config`.
pub(crate) fn launch(session: &Session) -> Result<()> {
    session.check_launch_precondition()?;

    let config = session.config();
    let cmdline_tail = session.cmdline_tail();

    let tmpdir = match make_rendezvous_dir() {
        Ok(d) => d,
        Err(e) => return fail(session, e),
    };
    let sock_path = tmpdir.join("sock");

    let argv = build_argv(&config, &cmdline_tail, &sock_path);

    let mut command = Command::new(&config.hypervisor);
    command
        .args(&argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = std::fs::remove_dir(&tmpdir);
            return fail(session, Error::io(format!("spawning {:?}", config.hypervisor), e));
        }
    };

    let pid = child.id() as libc::pid_t;
    let stdin_fd = child.stdin.take().expect("piped stdin").into_raw_fd();
    let stdout_fd = child.stdout.take().expect("piped stdout").into_raw_fd();
    drop(child);

    if let Err(e) = set_nonblocking(stdout_fd) {
        unwind(pid, stdin_fd, stdout_fd, None, &tmpdir);
        return fail(session, e);
    }

    let sock_fd = match connect_rendezvous(&sock_path, &config) {
        Ok(fd) => fd,
        Err(e) => {
            unwind(pid, stdin_fd, stdout_fd, None, &tmpdir);
            return fail(session, e);
        }
    };

    let stdout_watch = {
        let session = session.clone();
        let mut events = session.borrow_events();
        let session_for_cb = session.clone();
        let res = events.add_handle(
            stdout_fd,
            Interest::READABLE,
            Box::new(move |interest| session_for_cb.handle_stdout_event(interest)),
        );
        drop(events);
        match res {
            Ok(w) => w,
            Err(e) => {
                unwind(pid, stdin_fd, stdout_fd, Some(sock_fd), &tmpdir);
                return fail(&session, e);
            }
        }
    };

    let sock_watch = {
        let session = session.clone();
        let mut events = session.borrow_events();
        let session_for_cb = session.clone();
        let res = events.add_handle(
            sock_fd,
            Interest::READABLE | Interest::HANGUP | Interest::ERROR,
            Box::new(move |interest| session_for_cb.handle_channel_event(interest)),
        );
        drop(events);
        match res {
            Ok(w) => w,
            Err(e) => {
                let mut events = session.borrow_events();
                let _ = events.remove_handle(stdout_watch);
                drop(events);
                unwind(pid, stdin_fd, stdout_fd, Some(sock_fd), &tmpdir);
                return fail(&session, e);
            }
        }
    };

    session.install_subprocess(
        LaunchHandles {
            pid,
            stdin_fd,
            stdout_fd,
            sock_fd,
            tmpdir,
        },
        stdout_watch,
        sock_watch,
    );

    Ok(())
}

fn fail(session: &Session, err: Error) -> Result<()> {
    session.report_error(err.to_string());
    log_then_return!(err);
}

/// `mkdtemp`-equivalent. `std`/`tempfile` have no API for an embedded
/// `XXXXXX` placeholder at a fixed position, so this goes straight to the
/// libc function the source itself calls.
fn make_rendezvous_dir() -> Result<PathBuf> {
    let mut template = TMPDIR_TEMPLATE.as_bytes().to_vec();
    template.push(0);
    // SAFETY: `template` is a NUL-terminated, exclusively-owned buffer ending
    // in six `X`s, exactly what `mkdtemp` requires; it mutates it in place.
    let ptr = unsafe { libc::mkdtemp(template.as_mut_ptr() as *mut libc::c_char) };
    if ptr.is_null() {
        return Err(Error::io("mkdtemp", std::io::Error::last_os_error()));
    }
    let len = template.iter().position(|&b| b == 0).unwrap_or(template.len());
    Ok(PathBuf::from(OsStr::from_bytes(&template[..len])))
}

/// Builds the full argv per §4.2: the caller's configured tail first, then
/// the launcher's own fixed flags in a set order.
fn build_argv(config: &LaunchConfig, tail: &[String], sock_path: &std::path::Path) -> Vec<String> {
    let mut argv = tail.to_vec();
    argv.push("-m".to_string());
    argv.push(config.memory_mb.to_string());
    argv.push("-kernel".to_string());
    argv.push(config.kernel.display().to_string());
    argv.push("-initrd".to_string());
    argv.push(config.initrd.display().to_string());
    argv.push("-append".to_string());
    argv.push(format!("console=ttyS0 guestfs={VMCHANNEL_ADDR}:{VMCHANNEL_PORT}"));
    argv.push("-nographic".to_string());
    argv.push("-serial".to_string());
    argv.push("stdio".to_string());
    argv.push("-net".to_string());
    argv.push(format!(
        "channel,{VMCHANNEL_PORT}:unix:{},server,nowait",
        sock_path.display()
    ));
    argv.push("-net".to_string());
    argv.push("user,vlan=0".to_string());
    argv.push("-net".to_string());
    argv.push("nic,vlan=0".to_string());
    argv
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by this call's caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::io("fcntl(F_GETFL)", std::io::Error::last_os_error()));
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::io("fcntl(F_SETFL)", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Race a non-blocking `connect()` against the hypervisor's own bind, per
/// §4.2's connect-race description and [`LaunchConfig`]'s retry knobs.
fn connect_rendezvous(sock_path: &std::path::Path, config: &LaunchConfig) -> Result<RawFd> {
    // SAFETY: a fresh, valid domain/type/protocol triple.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::io("socket(AF_UNIX)", std::io::Error::last_os_error()));
    }
    if let Err(e) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_bytes = sock_path.as_os_str().as_bytes();
    if path_bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(Error::usage(format!(
            "rendezvous path {sock_path:?} is too long for sockaddr_un"
        )));
    }
    for (dst, &src) in addr.sun_path.iter_mut().zip(path_bytes.iter()) {
        *dst = src as libc::c_char;
    }
    let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

    let mut last_err = std::io::Error::new(ErrorKind::TimedOut, "connect race exhausted");
    for _ in 0..config.connect_attempts {
        // SAFETY: `addr` is a valid, fully-initialized `sockaddr_un`.
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc == 0 {
            return Ok(fd);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // Already connected, or connecting: both count as a win, mirroring
            // the source's treatment of `EINPROGRESS` as success-in-progress.
            Some(libc::EISCONN) | Some(libc::EINPROGRESS) | Some(libc::EALREADY) => return Ok(fd),
            // Anything else (typically `ENOENT`/`ECONNREFUSED` while the
            // hypervisor hasn't bound the socket yet) is retryable.
            _ => {
                last_err = err;
                thread::sleep(config.connect_delay);
            }
        }
    }

    unsafe { libc::close(fd) };
    Err(Error::io("connect(AF_UNIX rendezvous)", last_err))
}

fn unwind(pid: libc::pid_t, stdin_fd: RawFd, stdout_fd: RawFd, sock_fd: Option<RawFd>, tmpdir: &std::path::Path) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
        libc::close(stdin_fd);
        libc::close(stdout_fd);
        if let Some(fd) = sock_fd {
            libc::close(fd);
        }
    }
    let _ = std::fs::remove_file(tmpdir.join("sock"));
    let _ = std::fs::remove_dir(tmpdir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_order_matches_the_launch_sequence() {
        let config = LaunchConfig::default();
        let tail = vec!["-drive".to_string(), "file=disk.img".to_string()];
        let argv = build_argv(&config, &tail, std::path::Path::new("/tmp/x/sock"));
        assert_eq!(
            argv,
            vec![
                "-drive", "file=disk.img", "-m", "384", "-kernel", "vmlinuz.fedora-10.x86_64",
                "-initrd", "initramfs.fedora-10.x86_64.img", "-append",
                "console=ttyS0 guestfs=10.0.2.4:6666", "-nographic", "-serial", "stdio", "-net",
                "channel,6666:unix:/tmp/x/sock,server,nowait", "-net", "user,vlan=0", "-net",
                "nic,vlan=0",
            ]
        );
    }

    #[test]
    fn rendezvous_dir_matches_the_mkdtemp_template() {
        let dir = make_rendezvous_dir().unwrap();
        let name = dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("libguestfs"));
        assert_eq!(name.len(), "libguestfsXXXXXX".len());
        assert!(dir.starts_with("/tmp"));
        std::fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn launch_outside_config_state_is_rejected() {
        let session = Session::create();
        session.close();
        assert!(session.launch().is_err());
    }
}
