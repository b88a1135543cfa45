//! Kernel error taxonomy.
//!
//! All fallible kernel operations return `KernelResult<T>`. At the syscall
//! dispatch boundary a `KernelError` is converted once into the negative
//! `i64` value handed back to user code via `a0`.

use core::fmt;

/// Kernel-wide error type returned by fallible subsystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Argument failed validation (bad pointer, bad length, bad flag).
    InvalidArgument,
    /// Caller lacks permission for the requested operation.
    AccessDenied,
    /// File descriptor index is out of range or not open.
    BadFileDescriptor,
    /// Executable failed ELF validation (magic, class, machine, or type).
    BadExecutableFormat,
    /// Underlying device or media I/O failure.
    IoError,
    /// Kernel heap, frame, or thread/process table exhausted.
    OutOfMemory,
    /// Named entity (file, directory, device) does not exist.
    NotFound,
    /// Operation is not implemented for this object kind.
    NotSupported,
    /// No free process-table slot (`fork` has nowhere to place the child).
    NoChildren,
    /// Process I/O table is full.
    TooManyOpenFiles,
    /// Thread table is full.
    TooManyThreads,
    /// KTFS has no free data blocks.
    NoDataBlocks,
    /// KTFS has no free inodes.
    NoInodeBlocks,
}

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::AccessDenied => "access denied",
            Self::BadFileDescriptor => "bad file descriptor",
            Self::BadExecutableFormat => "bad executable format",
            Self::IoError => "I/O error",
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "no such entity",
            Self::NotSupported => "operation not supported",
            Self::NoChildren => "no child processes",
            Self::TooManyOpenFiles => "too many open files",
            Self::TooManyThreads => "too many threads",
            Self::NoDataBlocks => "no free data blocks",
            Self::NoInodeBlocks => "no free inodes",
        };
        f.write_str(msg)
    }
}

impl KernelError {
    /// Negative errno-style code returned to user code at the syscall boundary.
    pub const fn code(self) -> i64 {
        match self {
            Self::InvalidArgument => -1,
            Self::AccessDenied => -2,
            Self::BadFileDescriptor => -3,
            Self::BadExecutableFormat => -4,
            Self::IoError => -5,
            Self::OutOfMemory => -6,
            Self::NotFound => -7,
            Self::NotSupported => -8,
            Self::NoChildren => -9,
            Self::TooManyOpenFiles => -10,
            Self::TooManyThreads => -11,
            Self::NoDataBlocks => -12,
            Self::NoInodeBlocks => -13,
        }
    }
}

impl From<KernelError> for i64 {
    fn from(err: KernelError) -> Self {
        err.code()
    }
}
