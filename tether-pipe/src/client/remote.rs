//! Typed host-side filesystem: one method per operation.

use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use super::connection::Connection;
use crate::protocol::{
    has_more_groups, parse_payload, FileInfo, FileStat, FsStat, OpCode, ProtocolError, Result,
    Tag, TimeSpec, Value,
};
use crate::transport::Transport;

/// Reply of `getxattr`/`listxattr`: the attribute's total size, and its data
/// when the request asked for a non-zero size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrValue {
    pub size: usize,
    pub data: Vec<u8>,
}

/// Filesystem operations executed on the device.
///
/// Paths are absolute device paths (`/dir/file`).
pub struct RemoteFs<S = Box<dyn Transport>> {
    conn: Connection<S>,
}

impl<S: Read + Write> RemoteFs<S> {
    pub fn new(conn: Connection<S>) -> Self {
        Self { conn }
    }

    pub fn connection(&mut self) -> &mut Connection<S> {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection<S> {
        self.conn
    }

    /// Call `op` and expect a bare `End` back.
    fn call_empty(&mut self, op: OpCode, args: Vec<Value>) -> Result<()> {
        self.conn.call(op, args, &[Tag::End]).map(drop)
    }

    pub fn getattr(&mut self, path: &Path) -> Result<FileStat> {
        self.conn
            .call(OpCode::Getattr, vec![Value::path(path)], &[Tag::Stat, Tag::End])?
            .next_stat()
    }

    /// Read a symlink target, at most `size - 1` bytes of it.
    pub fn readlink(&mut self, path: &Path, size: usize) -> Result<Vec<u8>> {
        let args = vec![Value::path(path), Value::Int(size as i64)];
        let mut target = self
            .conn
            .call(OpCode::Readlink, args, &[Tag::Buffer, Tag::End])?
            .next_buffer()?;
        if let Some(nul) = target.iter().position(|&b| b == 0) {
            target.truncate(nul);
        }
        Ok(target)
    }

    pub fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.call_empty(OpCode::Mkdir, vec![Value::path(path), Value::Int(mode as i64)])
    }

    /// Open `path`. The returned file info carries the device handle.
    pub fn open(&mut self, path: &Path, fi: &FileInfo) -> Result<FileInfo> {
        self.conn
            .call(
                OpCode::Open,
                vec![Value::path(path), Value::FileInfo(*fi)],
                &[Tag::FileInfo, Tag::End],
            )?
            .next_file_info()
    }

    pub fn release(&mut self, path: &Path, fi: &FileInfo) -> Result<()> {
        self.conn
            .call(
                OpCode::Release,
                vec![Value::path(path), Value::FileInfo(*fi)],
                &[Tag::FileInfo, Tag::End],
            )
            .map(drop)
    }

    pub fn read(&mut self, path: &Path, size: usize, offset: i64, fi: &FileInfo) -> Result<Vec<u8>> {
        let args = vec![
            Value::path(path),
            Value::Int(size as i64),
            Value::Int(offset),
            Value::FileInfo(*fi),
        ];
        self.conn
            .call(OpCode::Read, args, &[Tag::Buffer, Tag::End])?
            .next_buffer()
    }

    /// Write `data` at `offset`. Returns the number of bytes written.
    pub fn write(&mut self, path: &Path, data: &[u8], offset: i64, fi: &FileInfo) -> Result<usize> {
        let args = vec![
            Value::path(path),
            Value::Buffer(data.to_vec()),
            Value::Int(offset),
            Value::FileInfo(*fi),
        ];
        let written = self
            .conn
            .call(OpCode::Write, args, &[Tag::Int, Tag::End])?
            .next_int()?;
        usize::try_from(written).map_err(|_| ProtocolError::OutOfBounds {
            needed: written as u64,
            remaining: data.len(),
        })
    }

    pub fn unlink(&mut self, path: &Path) -> Result<()> {
        self.call_empty(OpCode::Unlink, vec![Value::path(path)])
    }

    pub fn rmdir(&mut self, path: &Path) -> Result<()> {
        self.call_empty(OpCode::Rmdir, vec![Value::path(path)])
    }

    pub fn truncate(&mut self, path: &Path, size: i64) -> Result<()> {
        self.call_empty(OpCode::Truncate, vec![Value::path(path), Value::Int(size)])
    }

    pub fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.call_empty(OpCode::Rename, vec![Value::path(from), Value::path(to)])
    }

    pub fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.call_empty(OpCode::Chmod, vec![Value::path(path), Value::Int(mode as i64)])
    }

    /// Change ownership. `None` leaves that id unchanged.
    pub fn chown(&mut self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let id = |v: Option<u32>| Value::Int(v.map_or(-1, i64::from));
        self.call_empty(OpCode::Chown, vec![Value::path(path), id(uid), id(gid)])
    }

    pub fn access(&mut self, path: &Path, mask: i32) -> Result<()> {
        self.call_empty(OpCode::Access, vec![Value::path(path), Value::Int(mask as i64)])
    }

    /// Create `link` pointing at `target`.
    pub fn symlink(&mut self, target: &OsStr, link: &Path) -> Result<()> {
        self.call_empty(OpCode::Symlink, vec![Value::path(target), Value::path(link)])
    }

    pub fn link(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.call_empty(OpCode::Link, vec![Value::path(from), Value::path(to)])
    }

    pub fn mknod(&mut self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let args = vec![
            Value::path(path),
            Value::Int(mode as i64),
            Value::Int(rdev as i64),
        ];
        self.call_empty(OpCode::Mknod, args)
    }

    pub fn utimens(&mut self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        let args = vec![Value::path(path), Value::Timespec(atime), Value::Timespec(mtime)];
        self.call_empty(OpCode::Utimens, args)
    }

    pub fn statfs(&mut self, path: &Path) -> Result<FsStat> {
        self.conn
            .call(OpCode::Statfs, vec![Value::path(path)], &[Tag::Statvfs, Tag::End])?
            .next_statvfs()
    }

    pub fn fsync(&mut self, path: &Path, datasync: bool, fi: &FileInfo) -> Result<()> {
        let args = vec![
            Value::path(path),
            Value::Int(datasync as i64),
            Value::FileInfo(*fi),
        ];
        self.call_empty(OpCode::Fsync, args)
    }

    pub fn fallocate(
        &mut self,
        path: &Path,
        mode: i32,
        offset: i64,
        len: i64,
        fi: &FileInfo,
    ) -> Result<()> {
        let args = vec![
            Value::path(path),
            Value::Int(mode as i64),
            Value::Int(offset),
            Value::Int(len),
            Value::FileInfo(*fi),
        ];
        self.call_empty(OpCode::Fallocate, args)
    }

    pub fn setxattr(&mut self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let args = vec![
            Value::path(path),
            Value::path(name),
            Value::Buffer(value.to_vec()),
            Value::Int(flags as i64),
        ];
        self.call_empty(OpCode::Setxattr, args)
    }

    /// Fetch an extended attribute. A zero `size` only asks for its length.
    pub fn getxattr(&mut self, path: &Path, name: &OsStr, size: usize) -> Result<XattrValue> {
        let args = vec![Value::path(path), Value::path(name), Value::Int(size as i64)];
        self.xattr_answer(OpCode::Getxattr, args)
    }

    /// List attribute names, NUL separated. A zero `size` only asks for the
    /// length of the list.
    pub fn listxattr(&mut self, path: &Path, size: usize) -> Result<XattrValue> {
        self.xattr_answer(OpCode::Listxattr, vec![Value::path(path), Value::Int(size as i64)])
    }

    fn xattr_answer(&mut self, op: OpCode, args: Vec<Value>) -> Result<XattrValue> {
        let mut reply = self.conn.call(op, args, &[Tag::Int, Tag::Buffer, Tag::End])?;
        let size = reply.next_int()?.max(0) as usize;
        let data = reply.next_buffer()?;
        Ok(XattrValue { size, data })
    }

    pub fn removexattr(&mut self, path: &Path, name: &OsStr) -> Result<()> {
        self.call_empty(OpCode::Removexattr, vec![Value::path(path), Value::path(name)])
    }

    /// List a directory, calling `filler(name, stat)` per entry in device
    /// order. `filler` returns `true` to stop; the rest of the reply is then
    /// consumed without further calls. Only the inode and type bits of the
    /// stat are meaningful.
    pub fn readdir<F>(
        &mut self,
        path: &Path,
        offset: i64,
        fi: &FileInfo,
        mut filler: F,
    ) -> Result<FileInfo>
    where
        F: FnMut(&OsStr, &FileStat) -> bool,
    {
        let args = vec![Value::path(path), Value::Int(offset), Value::FileInfo(*fi)];
        self.conn.remote_call(OpCode::Readdir, args)?;
        let reply = self.conn.read_reply(OpCode::Readdir)?;
        let payload = &reply.payload;

        let mut pos = 0;
        let fi =
            parse_payload(payload, &mut pos, &[Tag::FileInfo, Tag::BlockEnd])?.next_file_info()?;

        let mut full = false;
        let mut entries = 0usize;
        while has_more_groups(payload, pos) {
            let shape = [Tag::Buffer, Tag::Stat, Tag::BlockEnd];
            let mut group = parse_payload(payload, &mut pos, &shape)?;
            let name = group.next_path()?;
            let stat = group.next_stat()?;
            entries += 1;
            if !full {
                full = filler(&name, &stat);
            }
        }

        parse_payload(payload, &mut pos, &[Tag::End])?;
        if pos != payload.len() {
            return Err(ProtocolError::TrailingBytes(payload.len() - pos));
        }
        debug!(target: "tether-pipe::client", path = %path.display(), entries, "readdir");
        Ok(fi)
    }

    /// Collect every entry of a directory.
    pub fn list_dir(&mut self, path: &Path) -> Result<Vec<(OsString, FileStat)>> {
        let mut entries = Vec::new();
        self.readdir(path, 0, &FileInfo::default(), |name, stat| {
            entries.push((name.to_os_string(), *stat));
            false
        })?;
        Ok(entries)
    }

    /// Ask the device to end the session. The connection is unusable
    /// afterwards.
    pub fn quit(&mut self) -> Result<()> {
        self.call_empty(OpCode::Quit, Vec::new())?;
        debug!(target: "tether-pipe::client", "session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::protocol::{
        build_payload, read_handshake, read_message, send_handshake, write_message, Packet,
        PROTOCOL_VERSION,
    };
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Device that answers one readdir with the given raw payload.
    fn readdir_device(payload: Vec<u8>) -> RemoteFs<UnixStream> {
        let (host, mut dev) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            send_handshake(&mut dev, PROTOCOL_VERSION).unwrap();
            read_handshake(&mut dev).unwrap();
            read_message(&mut dev).unwrap();
            let reply = Packet::reply(OpCode::Readdir.as_u8(), payload).unwrap();
            write_message(&mut dev, &reply.header, &reply.payload).unwrap();
        });
        RemoteFs::new(Connection::establish(host, &ClientConfig::default()).unwrap())
    }

    fn listing(names: &[&str]) -> Vec<u8> {
        let mut payload = Vec::new();
        build_payload(
            &mut payload,
            &[Value::FileInfo(FileInfo::with_handle(9)), Value::BlockEnd],
        )
        .unwrap();
        for (i, name) in names.iter().enumerate() {
            let stat = FileStat::dir_entry(i as u64 + 1, libc::DT_REG);
            build_payload(&mut payload, &[Value::path(name), Value::Stat(stat), Value::BlockEnd])
                .unwrap();
        }
        build_payload(&mut payload, &[Value::End]).unwrap();
        payload
    }

    #[test]
    fn test_readdir_two_entries_in_order() {
        let mut fs = readdir_device(listing(&["a", "b"]));
        let mut seen = Vec::new();
        let fi = fs
            .readdir(Path::new("/d"), 0, &FileInfo::default(), |name, stat| {
                seen.push((name.to_os_string(), stat.ino));
                false
            })
            .unwrap();
        assert_eq!(fi.fh, 9);
        assert_eq!(seen, vec![(OsString::from("a"), 1), (OsString::from("b"), 2)]);
    }

    #[test]
    fn test_readdir_empty() {
        let mut fs = readdir_device(listing(&[]));
        assert!(fs.list_dir(Path::new("/d")).unwrap().is_empty());
    }

    #[test]
    fn test_readdir_full_filler_drains_reply() {
        let mut fs = readdir_device(listing(&["a", "b", "c"]));
        let mut calls = 0;
        fs.readdir(Path::new("/d"), 0, &FileInfo::default(), |_, _| {
            calls += 1;
            true
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_readdir_missing_final_end() {
        let mut payload = listing(&["a"]);
        payload.truncate(payload.len() - 8);
        let mut fs = readdir_device(payload);
        assert!(fs.list_dir(Path::new("/d")).is_err());
    }

    #[test]
    fn test_readdir_trailing_bytes() {
        let mut payload = listing(&["a"]);
        payload.extend_from_slice(&[0u8; 4]);
        let mut fs = readdir_device(payload);
        // The lookahead sees more than one word left and tries another group.
        assert!(fs.list_dir(Path::new("/d")).is_err());
    }
}
