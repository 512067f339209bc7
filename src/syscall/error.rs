use core::fmt;

/// Kernel-wide error taxonomy. The numeric values are part of the syscall
/// ABI and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FosError {
    Success = 0,
    BadArgs = 1,
    NoMem = 2,
    NoSpace = 3,
    Empty = 4,
    InUse = 5,
    AlreadyAllocated = 6,
    InvalidIndex = 7,
    InvalidRange = 8,
    AlignError = 9,
    StateMismatch = 10,
    NotImplemented = 11,
    AbortSystem = 12,
    UnknownError = 13,
}

impl FosError {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> FosError {
        match code {
            0 => FosError::Success,
            1 => FosError::BadArgs,
            2 => FosError::NoMem,
            3 => FosError::NoSpace,
            4 => FosError::Empty,
            5 => FosError::InUse,
            6 => FosError::AlreadyAllocated,
            7 => FosError::InvalidIndex,
            8 => FosError::InvalidRange,
            9 => FosError::AlignError,
            10 => FosError::StateMismatch,
            11 => FosError::NotImplemented,
            12 => FosError::AbortSystem,
            _ => FosError::UnknownError,
        }
    }
}

impl fmt::Display for FosError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FosError::Success => write!(f, "success"),
            FosError::BadArgs => write!(f, "bad arguments"),
            FosError::NoMem => write!(f, "out of memory"),
            FosError::NoSpace => write!(f, "out of space"),
            FosError::Empty => write!(f, "nothing available"),
            FosError::InUse => write!(f, "resource in use"),
            FosError::AlreadyAllocated => write!(f, "already allocated"),
            FosError::InvalidIndex => write!(f, "invalid index"),
            FosError::InvalidRange => write!(f, "invalid range"),
            FosError::AlignError => write!(f, "misaligned argument"),
            FosError::StateMismatch => write!(f, "state mismatch"),
            FosError::NotImplemented => write!(f, "not implemented"),
            FosError::AbortSystem => write!(f, "abort system"),
            FosError::UnknownError => write!(f, "unknown error"),
        }
    }
}

/// Result type for kernel-internal calls.
///
/// Syscall-style operations report user-visible outcomes through the
/// current thread's saved `eax` and return `Ok(())` here; an `Err` means
/// corrupt kernel state and shuts the machine down at the trap boundary.
pub type OsResult<T = ()> = Result<T, FosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..14 {
            assert_eq!(FosError::from_code(code).code(), code);
        }
    }

    #[test]
    fn unknown_codes_collapse() {
        assert_eq!(FosError::from_code(999), FosError::UnknownError);
    }
}
