//! Launch-time configuration.
//!
//! These are the knobs the original hardcoded (`qemu-system-x86_64`,
//! `-m 384`, a fixed 100x10ms connect race). Pulling them into a struct lets
//! an embedder point at a real appliance kernel and tune the connect race for
//! a slower CI sandbox without patching the crate; the defaults reproduce the
//! original's literal values.

use std::path::PathBuf;
use std::time::Duration;

/// The fixed vmchannel port both ends of the rendezvous agree on.
pub const VMCHANNEL_PORT: u16 = 6666;

/// The fixed guest-side address advertised on the kernel command line.
pub const VMCHANNEL_ADDR: &str = "10.0.2.4";

/// The `mkstemp`-style template the rendezvous directory is created from.
pub const TMPDIR_TEMPLATE: &str = "/tmp/libguestfsXXXXXX";

/// Reserved length value meaning "appliance ready"; never a real frame length.
pub const READY_SENTINEL: u32 = 0xF5F5_5FF5;

/// Value of `VMSESSION_DEBUG` that enables verbose mode.
pub const DEBUG_ENV_VAR: &str = "VMSESSION_DEBUG";

/// Flags [`crate::session::Session::configure`] refuses to let a caller set,
/// because the launcher synthesises them itself.
pub const RESERVED_FLAGS: &[&str] = &[
    "-kernel",
    "-initrd",
    "-nographic",
    "-serial",
    "-vnc",
    "-full-screen",
    "-std-vga",
];

/// Everything [`crate::launcher`] needs to build the hypervisor's argv and
/// drive the connect race, beyond what's already on the command line via
/// `configure`/`add_drive`/`add_cdrom`.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path (or bare name, resolved via `$PATH`) to the hypervisor binary.
    pub hypervisor: PathBuf,
    /// Path to the appliance kernel image.
    pub kernel: PathBuf,
    /// Path to the appliance initrd image.
    pub initrd: PathBuf,
    /// Guest RAM size in megabytes (`-m <memory_mb>`).
    pub memory_mb: u32,
    /// Number of `connect()` attempts to race against the hypervisor's own
    /// bind+connect before giving up.
    pub connect_attempts: u32,
    /// Delay slept before each connect attempt.
    pub connect_delay: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            hypervisor: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            kernel: PathBuf::from("vmlinuz.fedora-10.x86_64"),
            initrd: PathBuf::from("initramfs.fedora-10.x86_64.img"),
            memory_mb: 384,
            connect_attempts: 100,
            connect_delay: Duration::from_millis(10),
        }
    }
}
