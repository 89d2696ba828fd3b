use core::ffi::c_int;
use mirror_vm::VmError;

/// The category of an arena failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Misaligned base, bad size, a buffer that is too small or does not fit the arena.
    InvalidArgument,
    /// The system refused to reserve or commit memory, or the fault registry is full.
    OutOfMemory,
    /// The bookkeeping pages of a tracked arena were overwritten.
    Corrupt,
    /// The arena's usage does not allow the operation.
    NotSupported,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    reason: &'static str,
    os: Option<c_int>,
}

impl Error {
    pub(crate) const fn new(kind: ErrorKind, reason: &'static str) -> Self {
        Error {
            kind,
            reason,
            os: None,
        }
    }

    pub(crate) const fn os(kind: ErrorKind, reason: &'static str, errno: c_int) -> Self {
        Error {
            kind,
            reason,
            os: Some(errno),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The OS error code, if the failure originated in a system call.
    pub fn raw_os_error(&self) -> Option<c_int> {
        self.os
    }
}

impl From<VmError> for Error {
    fn from(err: VmError) -> Self {
        Error::os(
            ErrorKind::OutOfMemory,
            "virtual memory operation failed",
            err.errno(),
        )
    }
}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut dbg = f.debug_struct("Error");
        dbg.field("kind", &self.kind).field("reason", &self.reason);
        if let Some(os) = self.os {
            dbg.field("os", &os);
        }
        dbg.finish()
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.os {
            Some(os) => write!(f, "{} (os error {os})", self.reason),
            None => f.write_str(self.reason),
        }
    }
}

impl std::error::Error for Error {}
