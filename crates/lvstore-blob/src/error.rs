//! Blob store status codes
//!
//! Every blob store completion carries a status. Success is `Ok`; failure is
//! a negative errno wrapped in `BsError` so that callers can pass it through
//! verbatim.

use std::fmt;

/// Result type for blob store operations
pub type BsResult<T> = Result<T, BsError>;

/// Non-zero status reported by the blob store
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BsError(i32);

impl BsError {
    /// Object or attribute does not exist
    pub const NOT_FOUND: Self = Self(-libc::ENOENT);
    /// Generic I/O failure
    pub const IO: Self = Self(-libc::EIO);
    /// Device does not carry a store of the requested type
    pub const NO_SUCH_DEVICE: Self = Self(-libc::ENXIO);
    /// Object is still in use
    pub const BUSY: Self = Self(-libc::EBUSY);
    /// Object already exists
    pub const EXISTS: Self = Self(-libc::EEXIST);
    /// Store has been unloaded or destroyed
    pub const NO_DEVICE: Self = Self(-libc::ENODEV);
    /// Invalid argument or handle state
    pub const INVALID: Self = Self(-libc::EINVAL);
    /// Not enough free clusters or metadata space
    pub const NO_SPACE: Self = Self(-libc::ENOSPC);
    /// Device does not hold a valid store
    pub const CORRUPT: Self = Self(-libc::EILSEQ);

    /// Wrap an errno value; the sign is normalised to negative
    ///
    /// Zero is not a failure and maps to `IO`.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            0 => Self::IO,
            e if e > 0 => Self(-e),
            e => Self(e),
        }
    }

    /// The negative errno value
    #[must_use]
    pub const fn errno(self) -> i32 {
        self.0
    }

    /// Whether this status means "does not exist"
    #[must_use]
    pub const fn is_not_found(self) -> bool {
        self.0 == Self::NOT_FOUND.0
    }

    fn describe(self) -> &'static str {
        match self.0.wrapping_neg() {
            libc::ENOENT => "not found",
            libc::EIO => "I/O error",
            libc::ENXIO => "no such device or address",
            libc::EBUSY => "busy",
            libc::EEXIST => "already exists",
            libc::ENODEV => "no such device",
            libc::EINVAL => "invalid argument",
            libc::ENOSPC => "no space left",
            libc::EILSEQ => "invalid on-disk format",
            _ => "blob store failure",
        }
    }
}

impl fmt::Debug for BsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BsError({})", self.0)
    }
}

impl fmt::Display for BsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.describe(), self.0)
    }
}

impl std::error::Error for BsError {}

impl From<std::io::Error> for BsError {
    fn from(err: std::io::Error) -> Self {
        err.raw_os_error().map_or(Self::IO, Self::from_errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno_normalises_sign() {
        assert_eq!(BsError::from_errno(libc::ENOENT), BsError::NOT_FOUND);
        assert_eq!(BsError::from_errno(-libc::ENOENT), BsError::NOT_FOUND);
        assert_eq!(BsError::from_errno(-1).errno(), -1);
        assert_eq!(BsError::from_errno(0), BsError::IO);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BsError::BUSY.to_string(),
            format!("busy (status {})", -libc::EBUSY)
        );
        assert_eq!(BsError::from_errno(-1).to_string(), "blob store failure (status -1)");
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(BsError::from(err), BsError::NO_SPACE);

        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(BsError::from(err), BsError::IO);
        assert!(BsError::NOT_FOUND.is_not_found());
    }
}
