//! A session manager that drives a disposable hypervisor appliance over a
//! length-framed control channel, so the host can manipulate disk images
//! without mounting them directly.
//!
//! The appliance is a throwaway virtual machine: [`Session::launch`] forks a
//! hypervisor subprocess booting a purpose-built kernel/initrd pair, waits
//! for it to announce readiness over a rendezvous socket
//! ([`Session::wait_ready`]), then exchanges length-prefixed frames with it
//! for as long as the caller needs. [`Session::close`] tears the whole thing
//! down again. Everything in between — what those frames actually mean — is
//! deliberately out of scope; see [`codec`] for the extension point a layer
//! built on top of this core would use.
//!
//! # Example
//!
//! ```no_run
//! use vmsession::Session;
//!
//! let session = Session::create();
//! session.add_drive("disk.img")?;
//! session.launch()?;
//! session.wait_ready()?;
//! // ... exchange frames over the reply/log callbacks ...
//! session.close();
//! # Ok::<(), vmsession::Error>(())
//! ```

mod callbacks;
mod config;
mod demux;
pub mod event_loop;
mod launcher;
mod session;

pub mod codec;
pub mod error;

pub use callbacks::{
    ErrorCallback, LaunchDoneCallback, LogCallback, OutOfMemoryCallback, ReplyCallback,
    SubprocessQuitCallback,
};
pub use config::LaunchConfig;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, Interest, TimeoutToken, WatchToken};
pub use session::{Session, State};

/// Not part of the crate's public API. Exists only so `benches/framing.rs`
/// can drive the framing state machine without promoting [`demux`] itself
/// (and its private [`demux::FrameOutcome`]) to `pub`.
#[doc(hidden)]
pub mod bench_support {
    pub fn parse_frame(buf: &mut Vec<u8>) -> bool {
        crate::demux::parse_frame(buf).is_ok()
    }
}
