//! FerriteOS — a teaching operating-system kernel for a simulated machine.
//!
//! The simulator exposes an MMU with two virtual regions (kernel region 0,
//! user region 1), a trap vector, a clock, terminals and a raw disk. The
//! kernel multiplexes that hardware among user processes behind a fixed set
//! of system calls: process lifecycle, memory growth, timed sleep, TTY I/O,
//! pipes, locks, condition variables and resource reclamation.
//!
//! All kernel state lives in a single [`kernel::Kernel`] value; the hardware
//! is reached only through the [`hardware::Machine`] trait, so the whole
//! kernel runs deterministically under test against
//! [`hardware::SimMachine`].

pub mod boot;
pub mod hardware;
pub mod interrupts;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod scheduler;
pub mod syscalls;
pub mod timer;

use core::fmt;

/// Kernel-internal error kinds. At the system-call boundary every variant
/// collapses to a single negative integer in `regs[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No physical frames, PCB slots, handles or buffers left.
    OutOfMemory,
    /// A disk or swap-file transfer came up short.
    Io,
    /// A malformed argument: bad pointer, zero length, bad tty id.
    BadArgument,
    /// The handle does not name a live utility of this process.
    NoSuchHandle,
    /// The handle names a utility of a different type.
    WrongHandleType,
    /// A lock operation that requires the lock to be held.
    NotHeld,
    /// A virtual address with no usable mapping behind it.
    Fault,
}

impl KernelError {
    /// The integer placed in `regs[0]` for user space.
    pub fn code(self) -> i64 {
        match self {
            KernelError::OutOfMemory => syscalls::ENOMEM,
            KernelError::Io => syscalls::EIO,
            _ => syscalls::ERROR,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::Io => write!(f, "i/o error"),
            KernelError::BadArgument => write!(f, "bad argument"),
            KernelError::NoSuchHandle => write!(f, "no such handle"),
            KernelError::WrongHandleType => write!(f, "wrong handle type"),
            KernelError::NotHeld => write!(f, "not held"),
            KernelError::Fault => write!(f, "address fault"),
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(_: std::io::Error) -> Self {
        KernelError::Io
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
