//! Operation codes carried in the packet header.

use std::fmt;

use super::error::ProtocolError;

/// Filesystem call proxied by a packet.
///
/// The discriminant is the wire value. `Invalid` is never sent; it is the
/// fallback slot of the device dispatch table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Invalid = 0,
    Readdir = 1,
    Getattr = 2,
    Readlink = 3,
    Mkdir = 4,
    Open = 5,
    Release = 6,
    Read = 7,
    Write = 8,
    Unlink = 9,
    Rmdir = 10,
    Truncate = 11,
    Rename = 12,
    Chmod = 13,
    Chown = 14,
    Access = 15,
    Symlink = 16,
    Link = 17,
    Mknod = 18,
    Utimens = 19,
    Statfs = 20,
    Fsync = 21,
    Fallocate = 22,
    Setxattr = 23,
    Getxattr = 24,
    Listxattr = 25,
    Removexattr = 26,
    Quit = 27,
}

impl OpCode {
    /// Number of op codes, i.e. one past the highest ordinal.
    pub const COUNT: usize = 28;

    /// Every op code, indexed by ordinal.
    pub const ALL: [OpCode; OpCode::COUNT] = [
        OpCode::Invalid,
        OpCode::Readdir,
        OpCode::Getattr,
        OpCode::Readlink,
        OpCode::Mkdir,
        OpCode::Open,
        OpCode::Release,
        OpCode::Read,
        OpCode::Write,
        OpCode::Unlink,
        OpCode::Rmdir,
        OpCode::Truncate,
        OpCode::Rename,
        OpCode::Chmod,
        OpCode::Chown,
        OpCode::Access,
        OpCode::Symlink,
        OpCode::Link,
        OpCode::Mknod,
        OpCode::Utimens,
        OpCode::Statfs,
        OpCode::Fsync,
        OpCode::Fallocate,
        OpCode::Setxattr,
        OpCode::Getxattr,
        OpCode::Listxattr,
        OpCode::Removexattr,
        OpCode::Quit,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Invalid => "invalid",
            OpCode::Readdir => "readdir",
            OpCode::Getattr => "getattr",
            OpCode::Readlink => "readlink",
            OpCode::Mkdir => "mkdir",
            OpCode::Open => "open",
            OpCode::Release => "release",
            OpCode::Read => "read",
            OpCode::Write => "write",
            OpCode::Unlink => "unlink",
            OpCode::Rmdir => "rmdir",
            OpCode::Truncate => "truncate",
            OpCode::Rename => "rename",
            OpCode::Chmod => "chmod",
            OpCode::Chown => "chown",
            OpCode::Access => "access",
            OpCode::Symlink => "symlink",
            OpCode::Link => "link",
            OpCode::Mknod => "mknod",
            OpCode::Utimens => "utimens",
            OpCode::Statfs => "statfs",
            OpCode::Fsync => "fsync",
            OpCode::Fallocate => "fallocate",
            OpCode::Setxattr => "setxattr",
            OpCode::Getxattr => "getxattr",
            OpCode::Listxattr => "listxattr",
            OpCode::Removexattr => "removexattr",
            OpCode::Quit => "quit",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OpCode::from_u8(value).ok_or(ProtocolError::UnknownOp(value))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_match_table() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
            assert_eq!(OpCode::from_u8(i as u8), Some(*op));
        }
        assert_eq!(OpCode::Quit.as_u8(), 27);
        assert_eq!(OpCode::Getattr.as_u8(), 2);
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(OpCode::from_u8(OpCode::COUNT as u8), None);
        assert_eq!(OpCode::from_u8(255), None);
        assert!(matches!(
            OpCode::try_from(200),
            Err(ProtocolError::UnknownOp(200))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(OpCode::Removexattr.to_string(), "removexattr");
    }
}
