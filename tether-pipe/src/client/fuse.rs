//! fuser::Filesystem implementation forwarding every callback to a device.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    consts, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use tracing::{debug, warn};

use super::remote::RemoteFs;
use crate::protocol::{FileInfo, FileStat, ProtocolError, TimeSpec};
use crate::transport::Transport;

const TTL: Duration = Duration::from_secs(1);

/// Longest symlink target fetched by `readlink`.
const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Maps FUSE inode numbers to device paths. The root is inode 1.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next_ino: FUSE_ROOT_ID + 1,
        };
        table.paths.insert(FUSE_ROOT_ID, PathBuf::from("/"));
        table.inodes.insert(PathBuf::from("/"), FUSE_ROOT_ID);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.paths.get(&ino).map(PathBuf::as_path)
    }

    pub fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode for `path`, allocating one on first sight.
    pub fn intern(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.inodes.insert(path.to_path_buf(), ino);
        ino
    }

    pub fn remove(&mut self, path: &Path) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Move `from` and everything below it to `to`, keeping inode numbers.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(u64, PathBuf)> = self
            .paths
            .iter()
            .filter_map(|(&ino, p)| {
                let rest = p.strip_prefix(from).ok()?;
                let moved = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                Some((ino, moved))
            })
            .collect();
        for (ino, new_path) in moved {
            if let Some(old) = self.paths.insert(ino, new_path.clone()) {
                self.inodes.remove(&old);
            }
            self.inodes.insert(new_path, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// FUSE front-end backed by a [`RemoteFs`].
pub struct FuseClient<S = Box<dyn Transport>> {
    remote: Mutex<RemoteFs<S>>,
    inodes: InodeTable,
}

impl<S: Read + Write> FuseClient<S> {
    pub fn new(remote: RemoteFs<S>) -> Self {
        Self {
            remote: Mutex::new(remote),
            inodes: InodeTable::new(),
        }
    }

    fn remote(&self) -> MutexGuard<'_, RemoteFs<S>> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn path(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes
            .path(ino)
            .map(Path::to_path_buf)
            .ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        self.inodes.child(parent, name).ok_or(libc::ENOENT)
    }

    /// Stat `path` and reply with a fresh entry for it.
    fn entry(&mut self, path: &Path) -> Result<fuser::FileAttr, i32> {
        let stat = self.remote().getattr(path).map_err(errno)?;
        let ino = self.inodes.intern(path);
        Ok(to_fuser_attr(ino, &stat))
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr_inner(
        &mut self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileStat, ProtocolError> {
        let mut remote = self.remote();
        if let Some(mode) = mode {
            remote.chmod(path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            remote.chown(path, uid, gid)?;
        }
        if let Some(size) = size {
            remote.truncate(path, size as i64)?;
        }
        if atime.is_some() || mtime.is_some() {
            remote.utimens(path, to_timespec(atime), to_timespec(mtime))?;
        }
        remote.getattr(path)
    }
}

fn errno(e: ProtocolError) -> i32 {
    if !matches!(e, ProtocolError::Remote { .. }) {
        warn!(target: "tether-pipe::client", error = %e, "request failed");
    }
    e.errno()
}

fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn to_timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::OMIT,
        Some(TimeOrNow::Now) => TimeSpec::NOW,
        Some(TimeOrNow::SpecificTime(t)) => TimeSpec::from(t),
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn to_fuser_attr(ino: u64, stat: &FileStat) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: stat.size.max(0) as u64,
        blocks: stat.blocks.max(0) as u64,
        atime: system_time(stat.atime),
        mtime: system_time(stat.mtime),
        ctime: system_time(stat.ctime),
        crtime: UNIX_EPOCH,
        kind: file_type(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink as u32,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev as u32,
        blksize: stat.blksize as u32,
        flags: 0,
    }
}

fn open_flags(fi: &FileInfo) -> u32 {
    let mut flags = 0;
    if fi.direct_io {
        flags |= consts::FOPEN_DIRECT_IO;
    }
    if fi.keep_cache {
        flags |= consts::FOPEN_KEEP_CACHE;
    }
    if fi.nonseekable {
        flags |= consts::FOPEN_NONSEEKABLE;
    }
    flags
}

impl<S: Read + Write> Filesystem for FuseClient<S> {
    fn destroy(&mut self) {
        if let Err(e) = self.remote().quit() {
            debug!(target: "tether-pipe::client", error = %e, "quit failed");
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child(parent, name).and_then(|p| self.entry(&p)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().getattr(&p).map_err(errno));
        match result {
            Ok(stat) => reply.attr(&TTL, &to_fuser_attr(ino, &stat)),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.setattr_inner(&path, mode, uid, gid, size, atime, mtime) {
            Ok(stat) => reply.attr(&TTL, &to_fuser_attr(ino, &stat)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().readlink(&p, PATH_MAX).map_err(errno));
        match result {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, name).and_then(|p| {
            self.remote().mknod(&p, mode, rdev as u64).map_err(errno)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, name).and_then(|p| {
            self.remote().mkdir(&p, mode).map_err(errno)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|p| {
            self.remote().unlink(&p).map_err(errno)?;
            self.inodes.remove(&p);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|p| {
            self.remote().rmdir(&p).map_err(errno)?;
            self.inodes.remove(&p);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, link_name).and_then(|p| {
            self.remote()
                .symlink(target.as_os_str(), &p)
                .map_err(errno)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let result = self.child(parent, name).and_then(|from| {
            let to = self.child(newparent, newname)?;
            self.remote().rename(&from, &to).map_err(errno)?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.path(ino).and_then(|from| {
            let to = self.child(newparent, newname)?;
            self.remote().link(&from, &to).map_err(errno)?;
            self.entry(&to)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .open(&p, &FileInfo::with_flags(flags))
                .map_err(errno)
        });
        match result {
            Ok(fi) => reply.opened(fi.fh, open_flags(&fi)),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .read(&p, size as usize, offset, &FileInfo::with_handle(fh))
                .map_err(errno)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .write(&p, data, offset, &FileInfo::with_handle(fh))
                .map_err(errno)
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fi = FileInfo {
            flags,
            fh,
            ..Default::default()
        };
        let result = self
            .path(ino)
            .and_then(|p| self.remote().release(&p, &fi).map_err(errno));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .fsync(&p, datasync, &FileInfo::with_handle(fh))
                .map_err(errno)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    /// The device ignores the offset and always lists the whole directory,
    /// so entries before `offset` are skipped here.
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let entries = match self.remote().list_dir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(e)),
        };

        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.intern(parent),
            None => ino,
        };
        for (i, (name, stat)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let entry_ino = match name.as_encoded_bytes() {
                b"." => ino,
                b".." => parent_ino,
                _ => self.inodes.intern(&path.join(name)),
            };
            if reply.add(entry_ino, (i + 1) as i64, file_type(stat.mode), name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().statfs(&p).map_err(errno));
        match result {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.bsize as u32,
                st.namemax as u32,
                st.frsize as u32,
            ),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .setxattr(&p, name, value, flags)
                .map_err(errno)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .getxattr(&p, name, size as usize)
                .map_err(errno)
        });
        match result {
            Ok(x) if size == 0 => reply.size(x.size as u32),
            Ok(x) if x.data.len() > size as usize => reply.error(libc::ERANGE),
            Ok(x) => reply.data(&x.data),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().listxattr(&p, size as usize).map_err(errno));
        match result {
            Ok(x) if size == 0 => reply.size(x.size as u32),
            Ok(x) if x.data.len() > size as usize => reply.error(libc::ERANGE),
            Ok(x) => reply.data(&x.data),
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().removexattr(&p, name).map_err(errno));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self
            .path(ino)
            .and_then(|p| self.remote().access(&p, mask).map_err(errno));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    /// No `create` on the wire: make the node, then open it.
    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child(parent, name).and_then(|p| {
            let mode = libc::S_IFREG | (mode & 0o7777);
            match self.remote().mknod(&p, mode, 0) {
                Ok(()) => {}
                Err(e) if e.errno() == libc::EEXIST && flags & libc::O_EXCL == 0 => {}
                Err(e) => return Err(errno(e)),
            }
            let fi = self
                .remote()
                .open(&p, &FileInfo::with_flags(flags & !(libc::O_CREAT | libc::O_EXCL)))
                .map_err(errno)?;
            let attr = self.entry(&p)?;
            Ok((attr, fi))
        });
        match result {
            Ok((attr, fi)) => reply.created(&TTL, &attr, 0, fi.fh, open_flags(&fi)),
            Err(e) => reply.error(e),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|p| {
            self.remote()
                .fallocate(&p, mode, offset, length, &FileInfo::with_handle(fh))
                .map_err(errno)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}
