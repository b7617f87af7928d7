//! Passthrough filesystem serving a local directory tree.
//!
//! Wire paths are absolute (`/dir/file`) and resolved below the served root.
//! `..` components may not climb above the root, and symlinks may not lead
//! out of it: every directory on the way is resolved and checked, and calls
//! that follow a final symlink check its target too. Open files live in a
//! handle table keyed by the `fh` returned from `open`; operations that carry
//! a file info use the handle when it is known and fall back to the path
//! otherwise. The table is emptied when the session ends.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{AccessFlags, Gid, Uid};
use tracing::{debug, warn};

use super::handler::{DirFiller, LocalFs, XattrReply};
use crate::protocol::{FileInfo, FileStat, FsStat, TimeSpec};

/// Open-file table. Handles start at 1; 0 means "no handle".
struct HandleTable {
    handles: HashMap<u64, Arc<File>>,
    next_fh: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn insert(&mut self, file: File) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, Arc::new(file));
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.handles.get(&fh).cloned()
    }

    fn remove(&mut self, fh: u64) -> Option<Arc<File>> {
        self.handles.remove(&fh)
    }

    fn clear(&mut self) -> usize {
        let open = self.handles.len();
        self.handles.clear();
        self.next_fh = 1;
        open
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| errno(libc::EINVAL))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn d_type(ft: &fs::FileType) -> u8 {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_file() {
        libc::DT_REG
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else {
        libc::DT_UNKNOWN
    }
}

/// A [`LocalFs`] mapping every call onto a directory of the local machine.
pub struct PassthroughFs {
    root: PathBuf,
    read_only: bool,
    handles: Mutex<HandleTable>,
}

impl PassthroughFs {
    /// Serve the tree below `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            handles: Mutex::new(HandleTable::new()),
        }
    }

    /// Refuse every mutating call with `EROFS`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.table().handles.len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writable(&self) -> io::Result<()> {
        if self.read_only {
            return Err(errno(libc::EROFS));
        }
        Ok(())
    }

    /// Map a wire path onto the served tree without following a final
    /// symlink. The directory holding the last component must resolve to a
    /// place below the root.
    fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        let lexical = self.lexical(path)?;
        let root = fs::canonicalize(&self.root)?;
        let (parent, name) = match (lexical.parent(), lexical.file_name()) {
            (Some(parent), Some(name)) if lexical != self.root => (parent, name),
            _ => return Ok(root),
        };
        let parent = fs::canonicalize(parent)?;
        if !parent.starts_with(&root) {
            warn!(target: "tether-pipe::server", path = %path.display(), "path leaves the served root");
            return Err(errno(libc::EACCES));
        }
        Ok(parent.join(name))
    }

    /// [`resolve`](Self::resolve) for calls that follow a final symlink; its
    /// target must stay below the root as well.
    fn resolve_follow(&self, path: &Path) -> io::Result<PathBuf> {
        let resolved = self.resolve(path)?;
        match fs::canonicalize(&resolved) {
            Ok(target) => {
                if !target.starts_with(fs::canonicalize(&self.root)?) {
                    warn!(target: "tether-pipe::server", path = %path.display(), "symlink leaves the served root");
                    return Err(errno(libc::EACCES));
                }
                Ok(target)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling link could be created through.
                match fs::symlink_metadata(&resolved) {
                    Ok(meta) if meta.file_type().is_symlink() => Err(errno(libc::EACCES)),
                    _ => Ok(resolved),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Lexical mapping below the root; `..` may not climb above it.
    fn lexical(&self, path: &Path) -> io::Result<PathBuf> {
        let mut out = self.root.clone();
        let mut depth = 0usize;
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(errno(libc::EACCES));
                    }
                    out.pop();
                    depth -= 1;
                }
                Component::Normal(name) => {
                    out.push(name);
                    depth += 1;
                }
            }
        }
        Ok(out)
    }

    fn c_path(&self, path: &Path) -> io::Result<CString> {
        cstring(self.resolve(path)?.as_os_str().as_bytes())
    }

    /// The open file behind `fi`, or a fresh one opened from the path.
    fn file_for(&self, path: &Path, fi: &FileInfo, write: bool) -> io::Result<Arc<File>> {
        if fi.fh != 0 {
            if let Some(file) = self.table().get(fi.fh) {
                return Ok(file);
            }
            debug!(target: "tether-pipe::server", fh = fi.fh, "unknown handle, reopening by path");
        }
        let file = OpenOptions::new()
            .read(!write)
            .write(write)
            .open(self.resolve_follow(path)?)?;
        Ok(Arc::new(file))
    }

    fn open_options(flags: i32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                opts.write(true);
            }
            libc::O_RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            opts.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            opts.truncate(true);
        }
        if flags & libc::O_CREAT != 0 {
            opts.create(true).mode(0o666);
            if flags & libc::O_EXCL != 0 {
                opts.create_new(true);
            }
        }
        let handled = libc::O_ACCMODE
            | libc::O_APPEND
            | libc::O_TRUNC
            | libc::O_CREAT
            | libc::O_EXCL;
        opts.custom_flags(flags & !handled);
        opts
    }
}

impl LocalFs for PassthroughFs {
    fn getattr(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = fs::symlink_metadata(self.resolve(path)?)?;
        Ok(FileStat::from(&metadata))
    }

    fn readlink(&self, path: &Path) -> io::Result<Vec<u8>> {
        Ok(fs::read_link(self.resolve(path)?)?.into_os_string().into_vec())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.writable()?;
        fs::DirBuilder::new().mode(mode).create(self.resolve(path)?)
    }

    fn open(&self, path: &Path, fi: &FileInfo) -> io::Result<FileInfo> {
        let mutating = fi.flags & libc::O_ACCMODE != libc::O_RDONLY
            || fi.flags & (libc::O_TRUNC | libc::O_CREAT) != 0;
        if mutating {
            self.writable()?;
        }
        let file = Self::open_options(fi.flags).open(self.resolve_follow(path)?)?;
        let fh = self.table().insert(file);
        debug!(target: "tether-pipe::server", path = %path.display(), fh, "opened");
        Ok(FileInfo { fh, ..*fi })
    }

    fn release(&self, path: &Path, fi: &FileInfo) -> io::Result<()> {
        if self.table().remove(fi.fh).is_none() && fi.fh != 0 {
            warn!(target: "tether-pipe::server", path = %path.display(), fh = fi.fh, "release of unknown handle");
        }
        Ok(())
    }

    fn read(&self, path: &Path, size: usize, offset: i64, fi: &FileInfo) -> io::Result<Vec<u8>> {
        let offset = u64::try_from(offset).map_err(|_| errno(libc::EINVAL))?;
        let file = self.file_for(path, fi, false)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8], offset: i64, fi: &FileInfo) -> io::Result<usize> {
        self.writable()?;
        let offset = u64::try_from(offset).map_err(|_| errno(libc::EINVAL))?;
        let file = self.file_for(path, fi, true)?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        self.writable()?;
        fs::remove_file(self.resolve(path)?)
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        self.writable()?;
        fs::remove_dir(self.resolve(path)?)
    }

    fn truncate(&self, path: &Path, size: i64) -> io::Result<()> {
        self.writable()?;
        nix::unistd::truncate(&self.resolve_follow(path)?, size as libc::off_t)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.writable()?;
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.writable()?;
        fs::set_permissions(self.resolve_follow(path)?, fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        self.writable()?;
        nix::unistd::chown(
            &self.resolve_follow(path)?,
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?;
        Ok(())
    }

    fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        if mask & libc::W_OK != 0 && self.read_only {
            return Err(errno(libc::EROFS));
        }
        nix::unistd::access(&self.resolve_follow(path)?, AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    fn symlink(&self, target: &OsStr, link: &Path) -> io::Result<()> {
        self.writable()?;
        std::os::unix::fs::symlink(target, self.resolve(link)?)
    }

    fn link(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.writable()?;
        fs::hard_link(self.resolve(from)?, self.resolve(to)?)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
        self.writable()?;
        nix::sys::stat::mknod(
            &self.resolve(path)?,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            rdev as libc::dev_t,
        )?;
        Ok(())
    }

    fn utimens(&self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> io::Result<()> {
        self.writable()?;
        let c_path = self.c_path(path)?;
        let times: [libc::timespec; 2] = [atime.into(), mtime.into()];
        // SAFETY: c_path is NUL-terminated and times has the two entries
        // utimensat reads.
        check(unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })
    }

    fn statfs(&self, path: &Path) -> io::Result<FsStat> {
        let stat = nix::sys::statvfs::statvfs(&self.resolve_follow(path)?)?;
        Ok(FsStat::from(&stat))
    }

    fn fsync(&self, path: &Path, datasync: bool, fi: &FileInfo) -> io::Result<()> {
        let file = self.file_for(path, fi, false)?;
        if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        }
    }

    #[cfg(target_os = "linux")]
    fn fallocate(
        &self,
        path: &Path,
        mode: i32,
        offset: i64,
        len: i64,
        fi: &FileInfo,
    ) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        self.writable()?;
        let file = self.file_for(path, fi, true)?;
        // SAFETY: the descriptor stays open for the duration of the call.
        check(unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                mode,
                offset as libc::off_t,
                len as libc::off_t,
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
        self.writable()?;
        let c_path = self.c_path(path)?;
        let c_name = cstring(name.as_bytes())?;
        // SAFETY: both strings are NUL-terminated; value is valid for its length.
        check(unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn getxattr(&self, path: &Path, name: &OsStr, size: usize) -> io::Result<XattrReply> {
        let c_path = self.c_path(path)?;
        let c_name = cstring(name.as_bytes())?;
        if size == 0 {
            // SAFETY: a null buffer with size 0 only queries the length.
            let n = check_size(unsafe {
                libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
            })?;
            return Ok(XattrReply::Size(n));
        }
        let mut buf = vec![0u8; size];
        // SAFETY: buf is writable for `size` bytes.
        let n = check_size(unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        })?;
        buf.truncate(n);
        Ok(XattrReply::Data(buf))
    }

    #[cfg(target_os = "linux")]
    fn listxattr(&self, path: &Path, size: usize) -> io::Result<XattrReply> {
        let c_path = self.c_path(path)?;
        if size == 0 {
            // SAFETY: a null buffer with size 0 only queries the length.
            let n = check_size(unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) })?;
            return Ok(XattrReply::Size(n));
        }
        let mut buf = vec![0u8; size];
        // SAFETY: buf is writable for `size` bytes.
        let n = check_size(unsafe {
            libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        buf.truncate(n);
        Ok(XattrReply::Data(buf))
    }

    #[cfg(target_os = "linux")]
    fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        self.writable()?;
        let c_path = self.c_path(path)?;
        let c_name = cstring(name.as_bytes())?;
        // SAFETY: both strings are NUL-terminated.
        check(unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) })
    }

    fn readdir(
        &self,
        path: &Path,
        _offset: i64,
        _fi: &FileInfo,
        filler: &mut DirFiller<'_>,
    ) -> io::Result<()> {
        let dir = self.resolve_follow(path)?;
        let read_dir = fs::read_dir(&dir)?;

        let root = fs::canonicalize(&self.root)?;
        let self_ino = fs::symlink_metadata(&dir)?.ino();
        let parent_ino = match dir.parent() {
            Some(parent) if dir != root => fs::symlink_metadata(parent)?.ino(),
            _ => self_ino,
        };
        if filler(OsStr::new("."), FileStat::dir_entry(self_ino, libc::DT_DIR)) {
            return Ok(());
        }
        if filler(OsStr::new(".."), FileStat::dir_entry(parent_ino, libc::DT_DIR)) {
            return Ok(());
        }

        for entry in read_dir {
            let entry = entry?;
            let kind = entry
                .file_type()
                .map(|ft| d_type(&ft))
                .unwrap_or(libc::DT_UNKNOWN);
            if filler(&entry.file_name(), FileStat::dir_entry(entry.ino(), kind)) {
                break;
            }
        }
        Ok(())
    }

    fn end_session(&self) {
        let leaked = self.table().clear();
        if leaked > 0 {
            debug!(target: "tether-pipe::server", handles = leaked, "closed handles left open by host");
        }
    }
}
