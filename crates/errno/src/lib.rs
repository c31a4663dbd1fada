//! POSIX error numbers.
//!
//! Fallible operations return `Result<T, Errno>`; the numeric value only
//! matters at the syscall boundary, where [`Errno::as_neg`] produces the
//! conventional `-errno` return.

#![no_std]

use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(i32)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Errno {
        /// Operation not permitted
        EPERM = 1,
        /// No such file or directory
        ENOENT = 2,
        /// I/O error
        EIO = 5,
        /// Bad file descriptor
        EBADF = 9,
        /// Permission denied
        EACCES = 13,
        /// Device or resource busy
        EBUSY = 16,
        /// File exists
        EEXIST = 17,
        /// Invalid cross-device link
        EXDEV = 18,
        /// No such device
        ENODEV = 19,
        /// Not a directory
        ENOTDIR = 20,
        /// Is a directory
        EISDIR = 21,
        /// Invalid argument
        EINVAL = 22,
        /// Too many open files
        EMFILE = 24,
        /// No space left on device
        ENOSPC = 28,
        /// Read-only file system
        EROFS = 30,
        /// File name too long
        ENAMETOOLONG = 36,
        /// Directory not empty
        ENOTEMPTY = 39,
        /// Transport endpoint is not connected
        ENOTCONN = 107,
        /// Connection timed out
        ETIMEDOUT = 110,
        /// Stale file handle
        ESTALE = 116,
    }
}

impl Errno {
    /// The `-errno` form used by the raw syscall return convention.
    pub fn as_neg(self) -> i32 {
        -(self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric() {
        assert_eq!(i32::from(Errno::ENOENT), 2);
        assert_eq!(Errno::try_from(17), Ok(Errno::EEXIST));
        assert!(Errno::try_from(-1).is_err());
        assert_eq!(Errno::ESTALE.as_neg(), -116);
    }
}
