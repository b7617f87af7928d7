//! Portable representation of the POSIX records that cross the wire.
//!
//! Every record is flattened into a fixed-size array of `i64`, one element per
//! field, in a documented order. [`marshal`](FileStat::marshal) returns the
//! array with each element already converted to big-endian, so the in-memory
//! bytes of the array are the wire bytes. [`unmarshal`](FileStat::unmarshal)
//! reverses both steps.
//!
//! Unsigned native fields travel as their two's-complement reinterpretation,
//! which round-trips exactly.

use std::os::unix::fs::MetadataExt;

/// Number of words in a marshalled [`FileInfo`].
pub const FILE_INFO_FIELDS: usize = 6;
/// Number of words in a marshalled [`FileStat`].
pub const STAT_FIELDS: usize = 13;
/// Number of words in a marshalled [`FsStat`].
pub const STATVFS_FIELDS: usize = 11;
/// Number of words in a marshalled [`TimeSpec`].
pub const TIMESPEC_FIELDS: usize = 2;

const DIRECT_IO: i64 = 1 << 0;
const KEEP_CACHE: i64 = 1 << 1;
const FLUSH: i64 = 1 << 2;
const NONSEEKABLE: i64 = 1 << 3;
const FLOCK_RELEASE: i64 = 1 << 4;

fn to_be_words<const N: usize>(words: [i64; N]) -> [i64; N] {
    words.map(i64::to_be)
}

fn from_be_words<const N: usize>(words: &[i64; N]) -> [i64; N] {
    words.map(i64::from_be)
}

/// Open-file state shared between the host front-end and the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// `open(2)` flags.
    pub flags: i32,
    pub fh_old: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub flush: bool,
    pub nonseekable: bool,
    pub flock_release: bool,
    pub padding: u32,
    /// Device-side handle, filled in by `open`.
    pub fh: u64,
    pub lock_owner: u64,
}

impl FileInfo {
    pub fn with_flags(flags: i32) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    pub fn with_handle(fh: u64) -> Self {
        Self {
            fh,
            ..Default::default()
        }
    }

    fn bits(&self) -> i64 {
        let mut bits = 0;
        if self.direct_io {
            bits |= DIRECT_IO;
        }
        if self.keep_cache {
            bits |= KEEP_CACHE;
        }
        if self.flush {
            bits |= FLUSH;
        }
        if self.nonseekable {
            bits |= NONSEEKABLE;
        }
        if self.flock_release {
            bits |= FLOCK_RELEASE;
        }
        bits
    }

    pub fn marshal(&self) -> [i64; FILE_INFO_FIELDS] {
        to_be_words([
            self.flags as i64,
            self.fh_old as i64,
            self.bits(),
            self.padding as i64,
            self.fh as i64,
            self.lock_owner as i64,
        ])
    }

    pub fn unmarshal(wire: &[i64; FILE_INFO_FIELDS]) -> Self {
        let w = from_be_words(wire);
        Self {
            flags: w[0] as i32,
            fh_old: w[1] as u64,
            direct_io: w[2] & DIRECT_IO != 0,
            keep_cache: w[2] & KEEP_CACHE != 0,
            flush: w[2] & FLUSH != 0,
            nonseekable: w[2] & NONSEEKABLE != 0,
            flock_release: w[2] & FLOCK_RELEASE != 0,
            padding: w[3] as u32,
            fh: w[4] as u64,
            lock_owner: w[5] as u64,
        }
    }
}

/// File status, as returned by `lstat(2)`. Timestamps are whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn marshal(&self) -> [i64; STAT_FIELDS] {
        to_be_words([
            self.dev as i64,
            self.ino as i64,
            self.mode as i64,
            self.nlink as i64,
            self.uid as i64,
            self.gid as i64,
            self.rdev as i64,
            self.size,
            self.blksize,
            self.blocks,
            self.atime,
            self.mtime,
            self.ctime,
        ])
    }

    pub fn unmarshal(wire: &[i64; STAT_FIELDS]) -> Self {
        let w = from_be_words(wire);
        Self {
            dev: w[0] as u64,
            ino: w[1] as u64,
            mode: w[2] as u32,
            nlink: w[3] as u64,
            uid: w[4] as u32,
            gid: w[5] as u32,
            rdev: w[6] as u64,
            size: w[7],
            blksize: w[8],
            blocks: w[9],
            atime: w[10],
            mtime: w[11],
            ctime: w[12],
        }
    }

    /// `S_IFMT` bits of the mode.
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    /// Stat used for directory entries: only the inode and the type bits are
    /// meaningful.
    pub fn dir_entry(ino: u64, d_type: u8) -> Self {
        Self {
            ino,
            mode: (d_type as u32) << 12,
            ..Default::default()
        }
    }
}

impl From<&std::fs::Metadata> for FileStat {
    fn from(m: &std::fs::Metadata) -> Self {
        Self {
            dev: m.dev(),
            ino: m.ino(),
            mode: m.mode(),
            nlink: m.nlink(),
            uid: m.uid(),
            gid: m.gid(),
            rdev: m.rdev(),
            size: m.size() as i64,
            blksize: m.blksize() as i64,
            blocks: m.blocks() as i64,
            atime: m.atime(),
            mtime: m.mtime(),
            ctime: m.ctime(),
        }
    }
}

/// Filesystem status, as returned by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStat {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl FsStat {
    pub fn marshal(&self) -> [i64; STATVFS_FIELDS] {
        to_be_words([
            self.bsize as i64,
            self.frsize as i64,
            self.blocks as i64,
            self.bfree as i64,
            self.bavail as i64,
            self.files as i64,
            self.ffree as i64,
            self.favail as i64,
            self.fsid as i64,
            self.flag as i64,
            self.namemax as i64,
        ])
    }

    pub fn unmarshal(wire: &[i64; STATVFS_FIELDS]) -> Self {
        let w = from_be_words(wire).map(|v| v as u64);
        Self {
            bsize: w[0],
            frsize: w[1],
            blocks: w[2],
            bfree: w[3],
            bavail: w[4],
            files: w[5],
            ffree: w[6],
            favail: w[7],
            fsid: w[8],
            flag: w[9],
            namemax: w[10],
        }
    }
}

impl From<&nix::sys::statvfs::Statvfs> for FsStat {
    fn from(s: &nix::sys::statvfs::Statvfs) -> Self {
        Self {
            bsize: s.block_size() as u64,
            frsize: s.fragment_size() as u64,
            blocks: s.blocks() as u64,
            bfree: s.blocks_free() as u64,
            bavail: s.blocks_available() as u64,
            files: s.files() as u64,
            ffree: s.files_free() as u64,
            favail: s.files_available() as u64,
            fsid: s.filesystem_id() as u64,
            flag: s.flags().bits() as u64,
            namemax: s.name_max() as u64,
        }
    }
}

/// A `struct timespec`. `nsec` may hold `UTIME_NOW` or `UTIME_OMIT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const NOW: TimeSpec = TimeSpec {
        sec: 0,
        nsec: libc::UTIME_NOW as i64,
    };
    pub const OMIT: TimeSpec = TimeSpec {
        sec: 0,
        nsec: libc::UTIME_OMIT as i64,
    };

    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub fn marshal(&self) -> [i64; TIMESPEC_FIELDS] {
        to_be_words([self.sec, self.nsec])
    }

    pub fn unmarshal(wire: &[i64; TIMESPEC_FIELDS]) -> Self {
        let w = from_be_words(wire);
        Self {
            sec: w[0],
            nsec: w[1],
        }
    }
}

impl From<std::time::SystemTime> for TimeSpec {
    fn from(t: std::time::SystemTime) -> Self {
        match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    TimeSpec::new(-(d.as_secs() as i64), 0)
                } else {
                    TimeSpec::new(
                        -(d.as_secs() as i64) - 1,
                        1_000_000_000 - d.subsec_nanos() as i64,
                    )
                }
            }
        }
    }
}

impl From<TimeSpec> for libc::timespec {
    fn from(t: TimeSpec) -> Self {
        libc::timespec {
            tv_sec: t.sec as libc::time_t,
            tv_nsec: t.nsec as _,
        }
    }
}
