//! Device dispatch table: op code to request handler.
//!
//! The table is a plain array indexed by op ordinal, with an entry for every
//! op including `invalid`. Ops without a real handler map to
//! [`not_supported`], which answers `ENOSYS`. Codes past the end of the
//! enumeration never reach the array.
//!
//! A handler parses its argument shape, calls into [`LocalFs`] and encodes
//! the reply. Any failure along the way, whether a malformed payload or a
//! failed syscall, becomes an error reply carrying the errno and its
//! description.

use std::ffi::OsString;
use std::path::PathBuf;

use tracing::debug;

use super::handler::{LocalFs, XattrReply};
use crate::protocol::{
    build_payload, parse_payload, Args, OpCode, Packet, ProtocolError, Result, Tag, Value,
    MAX_PAYLOAD_SIZE,
};

/// Request handler: takes the filesystem and the request, returns the reply.
pub type Handler<F> = fn(&F, &Packet) -> Packet;

/// Largest read served in one reply, leaving room for the framing.
pub const MAX_READ_SIZE: usize = MAX_PAYLOAD_SIZE - 64;

pub struct DispatchTable<F> {
    handlers: [Handler<F>; OpCode::COUNT],
}

impl<F> Clone for DispatchTable<F> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers,
        }
    }
}

impl<F: LocalFs> Default for DispatchTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: LocalFs> DispatchTable<F> {
    /// Table with every supported op wired to its handler.
    pub fn new() -> Self {
        let mut handlers = [not_supported::<F> as Handler<F>; OpCode::COUNT];
        let mut set = |op: OpCode, handler: Handler<F>| handlers[op.index()] = handler;

        set(OpCode::Readdir, readdir::<F>);
        set(OpCode::Getattr, getattr::<F>);
        set(OpCode::Readlink, readlink::<F>);
        set(OpCode::Mkdir, mkdir::<F>);
        set(OpCode::Open, open::<F>);
        set(OpCode::Release, release::<F>);
        set(OpCode::Read, read::<F>);
        set(OpCode::Write, write::<F>);
        set(OpCode::Unlink, unlink::<F>);
        set(OpCode::Rmdir, rmdir::<F>);
        set(OpCode::Truncate, truncate::<F>);
        set(OpCode::Rename, rename::<F>);
        set(OpCode::Chmod, chmod::<F>);
        set(OpCode::Chown, chown::<F>);
        set(OpCode::Access, access::<F>);
        set(OpCode::Symlink, symlink::<F>);
        set(OpCode::Link, link::<F>);
        set(OpCode::Mknod, mknod::<F>);
        set(OpCode::Utimens, utimens::<F>);
        set(OpCode::Statfs, statfs::<F>);
        set(OpCode::Fsync, fsync::<F>);
        set(OpCode::Fallocate, fallocate::<F>);
        set(OpCode::Setxattr, setxattr::<F>);
        set(OpCode::Getxattr, getxattr::<F>);
        set(OpCode::Listxattr, listxattr::<F>);
        set(OpCode::Removexattr, removexattr::<F>);
        set(OpCode::Quit, quit::<F>);

        Self { handlers }
    }

    /// Table where every op answers `ENOSYS`.
    pub fn empty() -> Self {
        Self {
            handlers: [not_supported::<F> as Handler<F>; OpCode::COUNT],
        }
    }

    /// Replace the handler of one op.
    pub fn set(&mut self, op: OpCode, handler: Handler<F>) {
        self.handlers[op.index()] = handler;
    }

    /// Route `op` to the not-supported handler.
    pub fn disable(&mut self, op: OpCode) {
        self.set(op, not_supported::<F>);
    }

    /// Handler for a raw op code. Codes outside the enumeration are rejected
    /// before the table is touched.
    pub fn handler(&self, op_code: u8) -> Result<Handler<F>> {
        let op = OpCode::try_from(op_code)?;
        Ok(self.handlers[op.index()])
    }

    pub fn dispatch(&self, fs: &F, request: &Packet) -> Result<Packet> {
        let handler = self.handler(request.header.op_code)?;
        Ok(handler(fs, request))
    }
}

/// Uniform answer for ops without an implementation.
pub fn not_supported<F>(_fs: &F, request: &Packet) -> Packet {
    Packet::error_reply(request.header.op_code, libc::ENOSYS)
}

/// Parse the request shape, run `effect`, frame its reply bytes. Failures at
/// any step become an error reply.
fn respond(
    request: &Packet,
    shape: &[Tag],
    effect: impl FnOnce(Args) -> Result<Vec<u8>>,
) -> Packet {
    let op_code = request.header.op_code;
    let outcome = parse_request(&request.payload, shape)
        .and_then(effect)
        .and_then(|payload| Packet::reply(op_code, payload));
    match outcome {
        Ok(reply) => reply,
        Err(e) => {
            let errno = e.errno();
            debug!(
                target: "tether-pipe::server",
                op = %OpCode::from_u8(op_code).unwrap_or(OpCode::Invalid),
                errno,
                error = %e,
                "request failed"
            );
            Packet::error_reply(op_code, errno)
        }
    }
}

fn parse_request(payload: &[u8], shape: &[Tag]) -> Result<Args> {
    let mut offset = 0;
    let args = parse_payload(payload, &mut offset, shape)?;
    if offset != payload.len() {
        return Err(ProtocolError::TrailingBytes(payload.len() - offset));
    }
    Ok(args)
}

/// Encode a terminated value list as a reply payload.
fn reply(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    build_payload(&mut out, values)?;
    Ok(out)
}

fn empty_reply() -> Result<Vec<u8>> {
    reply(&[Value::End])
}

fn einval() -> ProtocolError {
    ProtocolError::Io(std::io::Error::from_raw_os_error(libc::EINVAL))
}

fn size_arg(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| einval())
}

/// uid/gid argument; `-1` (either width) leaves the id unchanged.
fn id_arg(value: i64) -> Option<u32> {
    if value < 0 || value == u32::MAX as i64 {
        None
    } else {
        Some(value as u32)
    }
}

fn next_path(args: &mut Args) -> Result<PathBuf> {
    args.next_path().map(PathBuf::from)
}

fn next_name(args: &mut Args) -> Result<OsString> {
    args.next_path()
}

fn getattr<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let stat = fs.getattr(&path)?;
        reply(&[Value::Stat(stat), Value::End])
    })
}

fn readlink<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let size = size_arg(args.next_int()?)?;
        let mut target = fs.readlink(&path)?;
        // Reply holds min(len + 1, size) bytes, NUL included.
        if size == 0 {
            target.clear();
        } else {
            target.truncate(size - 1);
            target.push(0);
        }
        reply(&[Value::Buffer(target), Value::End])
    })
}

fn mkdir<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let mode = args.next_int()? as u32;
        fs.mkdir(&path, mode)?;
        empty_reply()
    })
}

fn open<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::FileInfo, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let fi = args.next_file_info()?;
        let fi = fs.open(&path, &fi)?;
        reply(&[Value::FileInfo(fi), Value::End])
    })
}

fn release<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::FileInfo, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let fi = args.next_file_info()?;
        fs.release(&path, &fi)?;
        reply(&[Value::FileInfo(fi), Value::End])
    })
}

fn read<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Int, Tag::Int, Tag::FileInfo, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let size = size_arg(args.next_int()?)?.min(MAX_READ_SIZE);
        let offset = args.next_int()?;
        let fi = args.next_file_info()?;
        let data = fs.read(&path, size, offset, &fi)?;
        reply(&[Value::Buffer(data), Value::End])
    })
}

fn write<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Buffer, Tag::Int, Tag::FileInfo, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let data = args.next_buffer()?;
        let offset = args.next_int()?;
        let fi = args.next_file_info()?;
        let written = fs.write(&path, &data, offset, &fi)?;
        reply(&[Value::Int(written as i64), Value::End])
    })
}

fn unlink<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::End], |mut args| {
        fs.unlink(&next_path(&mut args)?)?;
        empty_reply()
    })
}

fn rmdir<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::End], |mut args| {
        fs.rmdir(&next_path(&mut args)?)?;
        empty_reply()
    })
}

fn truncate<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let size = args.next_int()?;
        fs.truncate(&path, size)?;
        empty_reply()
    })
}

fn rename<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Buffer, Tag::End], |mut args| {
        let from = next_path(&mut args)?;
        let to = next_path(&mut args)?;
        fs.rename(&from, &to)?;
        empty_reply()
    })
}

fn chmod<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let mode = args.next_int()? as u32;
        fs.chmod(&path, mode)?;
        empty_reply()
    })
}

fn chown<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let uid = id_arg(args.next_int()?);
        let gid = id_arg(args.next_int()?);
        fs.chown(&path, uid, gid)?;
        empty_reply()
    })
}

fn access<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let mask = args.next_int()? as i32;
        fs.access(&path, mask)?;
        empty_reply()
    })
}

fn symlink<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Buffer, Tag::End], |mut args| {
        let target = next_name(&mut args)?;
        let link = next_path(&mut args)?;
        fs.symlink(&target, &link)?;
        empty_reply()
    })
}

fn link<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Buffer, Tag::End], |mut args| {
        let from = next_path(&mut args)?;
        let to = next_path(&mut args)?;
        fs.link(&from, &to)?;
        empty_reply()
    })
}

fn mknod<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let mode = args.next_int()? as u32;
        let rdev = args.next_int()? as u64;
        fs.mknod(&path, mode, rdev)?;
        empty_reply()
    })
}

fn utimens<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Timespec, Tag::Timespec, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let atime = args.next_timespec()?;
        let mtime = args.next_timespec()?;
        fs.utimens(&path, atime, mtime)?;
        empty_reply()
    })
}

fn statfs<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::End], |mut args| {
        let stat = fs.statfs(&next_path(&mut args)?)?;
        reply(&[Value::Statvfs(stat), Value::End])
    })
}

fn fsync<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Int, Tag::FileInfo, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let datasync = args.next_int()? != 0;
        let fi = args.next_file_info()?;
        fs.fsync(&path, datasync, &fi)?;
        empty_reply()
    })
}

fn fallocate<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [
        Tag::Buffer,
        Tag::Int,
        Tag::Int,
        Tag::Int,
        Tag::FileInfo,
        Tag::End,
    ];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let mode = args.next_int()? as i32;
        let offset = args.next_int()?;
        let len = args.next_int()?;
        let fi = args.next_file_info()?;
        fs.fallocate(&path, mode, offset, len, &fi)?;
        empty_reply()
    })
}

fn setxattr<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Buffer, Tag::Buffer, Tag::Int, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let name = next_name(&mut args)?;
        let value = args.next_buffer()?;
        let flags = args.next_int()? as i32;
        fs.setxattr(&path, &name, &value, flags)?;
        empty_reply()
    })
}

fn xattr_reply(result: XattrReply) -> Result<Vec<u8>> {
    let total = result.total_size() as i64;
    let data = match result {
        XattrReply::Size(_) => Vec::new(),
        XattrReply::Data(data) => data,
    };
    reply(&[Value::Int(total), Value::Buffer(data), Value::End])
}

fn getxattr<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Buffer, Tag::Int, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let name = next_name(&mut args)?;
        let size = size_arg(args.next_int()?)?.min(MAX_READ_SIZE);
        xattr_reply(fs.getxattr(&path, &name, size)?)
    })
}

fn listxattr<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Int, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let size = size_arg(args.next_int()?)?.min(MAX_READ_SIZE);
        xattr_reply(fs.listxattr(&path, size)?)
    })
}

fn removexattr<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::Buffer, Tag::Buffer, Tag::End], |mut args| {
        let path = next_path(&mut args)?;
        let name = next_name(&mut args)?;
        fs.removexattr(&path, &name)?;
        empty_reply()
    })
}

/// Streamed reply: the echoed file info, one (name, stat) group per entry,
/// then a lone `End`.
fn readdir<F: LocalFs>(fs: &F, request: &Packet) -> Packet {
    let shape = [Tag::Buffer, Tag::Int, Tag::FileInfo, Tag::End];
    respond(request, &shape, |mut args| {
        let path = next_path(&mut args)?;
        let offset = args.next_int()?;
        let fi = args.next_file_info()?;

        let mut out = Vec::new();
        build_payload(&mut out, &[Value::FileInfo(fi), Value::BlockEnd])?;

        let mut failure = None;
        let mut entries = 0usize;
        fs.readdir(&path, offset, &fi, &mut |name, stat| {
            let group = [Value::path(name), Value::Stat(stat), Value::BlockEnd];
            match build_payload(&mut out, &group) {
                Ok(_) => {
                    entries += 1;
                    // Past the cap the reply is refused as too large.
                    out.len() > MAX_PAYLOAD_SIZE
                }
                Err(e) => {
                    failure = Some(e);
                    true
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        build_payload(&mut out, &[Value::End])?;
        debug!(target: "tether-pipe::server", path = %path.display(), entries, "readdir");
        Ok(out)
    })
}

/// Acknowledge `quit`; the session loop ends after sending it.
fn quit<F: LocalFs>(_fs: &F, request: &Packet) -> Packet {
    respond(request, &[Tag::End], |_| empty_reply())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{has_more_groups, FileInfo, FileStat};
    use std::io;
    use std::path::Path;

    struct NoopFs;
    impl LocalFs for NoopFs {}

    /// Serves a fixed file and a two-entry directory.
    struct FixedFs;

    impl LocalFs for FixedFs {
        fn getattr(&self, path: &Path) -> io::Result<FileStat> {
            if path == Path::new("/tmp/a") {
                Ok(FileStat {
                    size: 42,
                    mode: libc::S_IFREG | 0o644,
                    ..Default::default()
                })
            } else {
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            }
        }

        fn readlink(&self, _path: &Path) -> io::Result<Vec<u8>> {
            Ok(b"target".to_vec())
        }

        fn readdir(
            &self,
            _path: &Path,
            _offset: i64,
            _fi: &FileInfo,
            filler: &mut crate::server::DirFiller<'_>,
        ) -> io::Result<()> {
            for (ino, name) in [(1, "a"), (2, "b")] {
                if filler(std::ffi::OsStr::new(name), FileStat::dir_entry(ino, libc::DT_REG)) {
                    break;
                }
            }
            Ok(())
        }
    }

    fn request(op: OpCode, values: &[Value]) -> Packet {
        let mut payload = Vec::new();
        build_payload(&mut payload, values).unwrap();
        Packet::request(op, payload).unwrap()
    }

    #[test]
    fn test_every_op_code_has_a_handler() {
        let table = DispatchTable::<NoopFs>::new();
        for op in OpCode::ALL {
            let reply = table.dispatch(&NoopFs, &request(op, &[Value::End])).unwrap();
            assert_eq!(reply.header.op_code, op.as_u8());
            assert!(!reply.header.is_host());
            if op == OpCode::Quit {
                assert_eq!(reply.header.error, 0);
            } else {
                assert_ne!(reply.header.error, 0, "{} should fail", op);
            }
        }
    }

    #[test]
    fn test_out_of_range_rejected_before_lookup() {
        let table = DispatchTable::<NoopFs>::new();
        for code in [OpCode::COUNT as u8, 100, 255] {
            let mut packet = request(OpCode::Getattr, &[Value::End]);
            packet.header.op_code = code;
            assert!(matches!(
                table.dispatch(&NoopFs, &packet),
                Err(ProtocolError::UnknownOp(c)) if c == code
            ));
        }
    }

    #[test]
    fn test_not_supported_reply() {
        let table = DispatchTable::<NoopFs>::new();
        let reply = table
            .dispatch(&NoopFs, &request(OpCode::Invalid, &[Value::End]))
            .unwrap();
        assert_eq!(reply.header.error, libc::ENOSYS as u16);
        assert_eq!(reply.error_message(), "Function not implemented");
    }

    #[test]
    fn test_getattr_success_and_failure() {
        let table = DispatchTable::new();
        let ok = table
            .dispatch(&FixedFs, &request(OpCode::Getattr, &[Value::path("/tmp/a"), Value::End]))
            .unwrap();
        assert_eq!(ok.header.error, 0);
        let mut offset = 0;
        let st = parse_payload(&ok.payload, &mut offset, &[Tag::Stat, Tag::End])
            .unwrap()
            .next_stat()
            .unwrap();
        assert_eq!(st.size, 42);

        let missing = table
            .dispatch(&FixedFs, &request(OpCode::Getattr, &[Value::path("/nope"), Value::End]))
            .unwrap();
        assert_eq!(missing.header.error, libc::ENOENT as u16);
        assert_eq!(missing.error_message(), "No such file or directory");
    }

    #[test]
    fn test_malformed_arguments_become_error_reply() {
        let table = DispatchTable::new();
        let reply = table
            .dispatch(&FixedFs, &request(OpCode::Getattr, &[Value::Int(1), Value::End]))
            .unwrap();
        assert_eq!(reply.header.error, libc::EPROTO as u16);

        let mut truncated = request(OpCode::Getattr, &[Value::path("/tmp/a"), Value::End]);
        truncated.payload.truncate(5);
        truncated.header.payload_size = 5;
        let reply = table.dispatch(&FixedFs, &truncated).unwrap();
        assert_eq!(reply.header.error, libc::EPROTO as u16);
    }

    #[test]
    fn test_readlink_truncates_to_size() {
        let table = DispatchTable::new();
        for (size, expected) in [
            (100, &b"target\0"[..]),
            (4, &b"tar\0"[..]),
            (0, &b""[..]),
        ] {
            let reply = table
                .dispatch(
                    &FixedFs,
                    &request(
                        OpCode::Readlink,
                        &[Value::path("/l"), Value::Int(size), Value::End],
                    ),
                )
                .unwrap();
            let mut offset = 0;
            let buf = parse_payload(&reply.payload, &mut offset, &[Tag::Buffer, Tag::End])
                .unwrap()
                .next_buffer()
                .unwrap();
            assert_eq!(buf, expected);
        }
    }

    #[test]
    fn test_readdir_stream_layout() {
        let table = DispatchTable::new();
        let fi = FileInfo::with_handle(9);
        let reply = table
            .dispatch(
                &FixedFs,
                &request(
                    OpCode::Readdir,
                    &[Value::path("/"), Value::Int(0), Value::FileInfo(fi), Value::End],
                ),
            )
            .unwrap();
        assert_eq!(reply.header.error, 0);

        let payload = &reply.payload;
        let mut offset = 0;
        let echoed = parse_payload(payload, &mut offset, &[Tag::FileInfo, Tag::BlockEnd])
            .unwrap()
            .next_file_info()
            .unwrap();
        assert_eq!(echoed, fi);

        let mut names = Vec::new();
        while has_more_groups(payload, offset) {
            let mut group =
                parse_payload(payload, &mut offset, &[Tag::Buffer, Tag::Stat, Tag::BlockEnd])
                    .unwrap();
            names.push(group.next_path().unwrap());
        }
        parse_payload(payload, &mut offset, &[Tag::End]).unwrap();
        assert_eq!(offset, payload.len());
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_disable_routes_to_not_supported() {
        let mut table = DispatchTable::new();
        table.disable(OpCode::Getattr);
        let reply = table
            .dispatch(&FixedFs, &request(OpCode::Getattr, &[Value::path("/tmp/a"), Value::End]))
            .unwrap();
        assert_eq!(reply.header.error, libc::ENOSYS as u16);
    }

    #[test]
    fn test_id_arg() {
        assert_eq!(id_arg(-1), None);
        assert_eq!(id_arg(u32::MAX as i64), None);
        assert_eq!(id_arg(1000), Some(1000));
    }
}
