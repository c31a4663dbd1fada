//! Open flags and stat mode bits.

use bitflags::bitflags;

bitflags! {
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_TRUNC = 0o1000;
        /// The file is opened in append mode. Before each write, the file
        /// offset is positioned at the end of the file.
        const O_APPEND = 0o2000;
        const O_DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    /// The low two bits select the access mode.
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::O_WRONLY)
    }

    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

bitflags! {
    pub struct StatMode: u32 {
        /// bit mask for the file type bit field
        const S_IFMT = 0o170000;
        /// symbolic link
        const S_IFLNK = 0o120000;
        /// regular file
        const S_IFREG = 0o100000;
        /// directory
        const S_IFDIR = 0o040000;
        /// owner has read, write, and execute permission
        const S_IRWXU = 0o0700;
        /// group has read, write, and execute permission
        const S_IRWXG = 0o0070;
        /// others have read, write, and execute permission
        const S_IRWXO = 0o0007;
    }
}

impl StatMode {
    fn fmt_bits(&self) -> u32 {
        self.bits() & StatMode::S_IFMT.bits()
    }

    pub fn is_dir(&self) -> bool {
        self.fmt_bits() == StatMode::S_IFDIR.bits()
    }

    pub fn is_reg(&self) -> bool {
        self.fmt_bits() == StatMode::S_IFREG.bits()
    }

    pub fn is_lnk(&self) -> bool {
        self.fmt_bits() == StatMode::S_IFLNK.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode() {
        assert!(OpenFlags::O_RDONLY.readable());
        assert!(!OpenFlags::O_RDONLY.writable());
        assert!(!OpenFlags::O_WRONLY.readable());
        assert!(OpenFlags::O_WRONLY.writable());
        assert!(OpenFlags::O_RDWR.readable());
        assert!(OpenFlags::O_RDWR.writable());
    }

    #[test]
    fn test_file_type() {
        let mode = StatMode::S_IFDIR | StatMode::S_IRWXU;
        assert!(mode.is_dir());
        assert!(!mode.is_reg());
        let mode = StatMode::S_IFLNK;
        assert!(mode.is_lnk());
    }
}
