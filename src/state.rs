//! Tagged success/error result for reactor operations.
//!
//! Every completion callback receives a [`NetState`]: either `Ok(())` or a
//! [`NetError`] carrying the error category and the raw errno value. EOF is
//! *not* an error; it is surfaced as a successful read of zero bytes.

use std::io;

/// Classifies where an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// An OS call failed; the code field carries errno verbatim.
    System,
    /// The caller violated an operation contract.
    User,
}

/// An error produced by a reactor operation.
///
/// The `code` field is the raw errno for `System` errors. `ENOBUFS` is
/// synthesised when a fixed-size read buffer overflows during a scatter
/// injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{category:?} error (errno {code})")]
pub struct NetError {
    /// Error source classification.
    pub category: Category,
    /// Raw errno value for `System` errors, operation-defined otherwise.
    pub code: i32,
}

impl NetError {
    /// A system error from a raw errno value.
    #[inline]
    pub fn system(code: i32) -> Self {
        Self {
            category: Category::System,
            code,
        }
    }

    /// A caller-contract error.
    #[inline]
    pub fn user(code: i32) -> Self {
        Self {
            category: Category::User,
            code,
        }
    }

    /// Capture the calling thread's last OS error.
    #[inline]
    pub fn last_os_error() -> Self {
        Self::from(io::Error::last_os_error())
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        // Errors that did not originate from a syscall carry no errno; EIO is
        // the closest honest classification.
        Self::system(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Result of a completed operation: `Ok(())` or a tagged error.
///
/// `is_ok()` is the boolean conversion: true means the operation succeeded.
pub type NetState = Result<(), NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_errno_verbatim() {
        let err = NetError::system(libc::ECONNRESET);
        assert_eq!(err.category, Category::System);
        assert_eq!(err.code, libc::ECONNRESET);
    }

    #[test]
    fn from_io_error_recovers_raw_os_error() {
        let io_err = io::Error::from_raw_os_error(libc::EPIPE);
        let err = NetError::from(io_err);
        assert_eq!(err, NetError::system(libc::EPIPE));
    }

    #[test]
    fn from_io_error_without_errno_maps_to_eio() {
        let io_err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(NetError::from(io_err), NetError::system(libc::EIO));
    }

    #[test]
    fn state_boolean_conversion() {
        let ok: NetState = Ok(());
        let err: NetState = Err(NetError::system(libc::EAGAIN));
        assert!(ok.is_ok());
        assert!(!err.is_ok());
    }
}
