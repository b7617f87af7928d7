//! Local effect layer consumed by the device dispatch table.

use std::ffi::OsStr;
use std::io;
use std::path::Path;

use crate::protocol::{FileInfo, FileStat, FsStat, TimeSpec};

/// Reply of `getxattr`/`listxattr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Caller passed a zero size and only wants the length.
    Size(usize),
    Data(Vec<u8>),
}

impl XattrReply {
    pub fn total_size(&self) -> usize {
        match self {
            XattrReply::Size(n) => *n,
            XattrReply::Data(d) => d.len(),
        }
    }
}

/// Directory entry sink. Returns `true` when it is full and iteration
/// should stop.
pub type DirFiller<'a> = dyn FnMut(&OsStr, FileStat) -> bool + 'a;

fn enosys<T>() -> io::Result<T> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// POSIX calls performed on the device on behalf of the host.
///
/// Paths are the ones sent over the wire. Every method defaults to
/// `ENOSYS`, which the device reports back to the host unchanged.
pub trait LocalFs: Send + Sync {
    fn getattr(&self, _path: &Path) -> io::Result<FileStat> {
        enosys()
    }

    /// Raw symlink target.
    fn readlink(&self, _path: &Path) -> io::Result<Vec<u8>> {
        enosys()
    }

    fn mkdir(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        enosys()
    }

    /// Open a file and return the file info with `fh` set.
    fn open(&self, _path: &Path, _fi: &FileInfo) -> io::Result<FileInfo> {
        enosys()
    }

    fn release(&self, _path: &Path, _fi: &FileInfo) -> io::Result<()> {
        enosys()
    }

    fn read(&self, _path: &Path, _size: usize, _offset: i64, _fi: &FileInfo) -> io::Result<Vec<u8>> {
        enosys()
    }

    fn write(&self, _path: &Path, _data: &[u8], _offset: i64, _fi: &FileInfo) -> io::Result<usize> {
        enosys()
    }

    fn unlink(&self, _path: &Path) -> io::Result<()> {
        enosys()
    }

    fn rmdir(&self, _path: &Path) -> io::Result<()> {
        enosys()
    }

    fn truncate(&self, _path: &Path, _size: i64) -> io::Result<()> {
        enosys()
    }

    fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        enosys()
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        enosys()
    }

    /// `None` leaves the owner or group unchanged.
    fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
        enosys()
    }

    fn access(&self, _path: &Path, _mask: i32) -> io::Result<()> {
        enosys()
    }

    /// Create `link` pointing at `target`. The target is stored verbatim.
    fn symlink(&self, _target: &OsStr, _link: &Path) -> io::Result<()> {
        enosys()
    }

    fn link(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        enosys()
    }

    fn mknod(&self, _path: &Path, _mode: u32, _rdev: u64) -> io::Result<()> {
        enosys()
    }

    fn utimens(&self, _path: &Path, _atime: TimeSpec, _mtime: TimeSpec) -> io::Result<()> {
        enosys()
    }

    fn statfs(&self, _path: &Path) -> io::Result<FsStat> {
        enosys()
    }

    fn fsync(&self, _path: &Path, _datasync: bool, _fi: &FileInfo) -> io::Result<()> {
        enosys()
    }

    fn fallocate(
        &self,
        _path: &Path,
        _mode: i32,
        _offset: i64,
        _len: i64,
        _fi: &FileInfo,
    ) -> io::Result<()> {
        enosys()
    }

    fn setxattr(&self, _path: &Path, _name: &OsStr, _value: &[u8], _flags: i32) -> io::Result<()> {
        enosys()
    }

    fn getxattr(&self, _path: &Path, _name: &OsStr, _size: usize) -> io::Result<XattrReply> {
        enosys()
    }

    fn listxattr(&self, _path: &Path, _size: usize) -> io::Result<XattrReply> {
        enosys()
    }

    fn removexattr(&self, _path: &Path, _name: &OsStr) -> io::Result<()> {
        enosys()
    }

    /// Feed every entry of the directory, `.` and `..` included, to `filler`
    /// until it reports full.
    fn readdir(
        &self,
        _path: &Path,
        _offset: i64,
        _fi: &FileInfo,
        _filler: &mut DirFiller<'_>,
    ) -> io::Result<()> {
        enosys()
    }

    /// The session using this filesystem is over; drop whatever it left open.
    fn end_session(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFs;
    impl LocalFs for NoopFs {}

    #[test]
    fn test_default_methods_return_enosys() {
        let fs = NoopFs;
        let err = fs.getattr(Path::new("/")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
        let err = fs
            .readdir(Path::new("/"), 0, &FileInfo::default(), &mut |_, _| false)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
    }

    #[test]
    fn test_xattr_reply_size() {
        assert_eq!(XattrReply::Size(12).total_size(), 12);
        assert_eq!(XattrReply::Data(vec![1, 2, 3]).total_size(), 3);
    }
}
