//! Tagged-value payload codec.
//!
//! A payload is a flat sequence of self-describing values. Each value is an
//! 8-byte big-endian [`Tag`] followed by a body whose shape the tag fixes:
//!
//! | tag         | body                                  |
//! |-------------|---------------------------------------|
//! | `End`       | none; terminates the argument list    |
//! | `Buffer`    | i64 length, then that many raw bytes  |
//! | `Int`       | one i64                               |
//! | `FileInfo`  | 6 i64 words                           |
//! | `Stat`      | 13 i64 words                          |
//! | `Statvfs`   | 11 i64 words                          |
//! | `Timespec`  | 2 i64 words                           |
//!
//! `BlockEnd` never reaches the wire. In a build list it stops appending
//! without writing a terminator, and in a parse list it stops reading without
//! consuming one. This is how repeated groups of unknown count (directory
//! entries) are framed: the sender appends one group per entry, each closed
//! by `BlockEnd`, and finally a lone `End`; the receiver keeps parsing groups
//! while more than one tag's worth of bytes remains, then parses the `End`.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use super::error::{ProtocolError, Result};
use super::marshal::{
    FileInfo, FileStat, FsStat, TimeSpec, FILE_INFO_FIELDS, STATVFS_FIELDS, STAT_FIELDS,
    TIMESPEC_FIELDS,
};

/// Size of one tag, one int, or one record word on the wire.
pub const WORD: usize = 8;

/// Type discriminant preceding every value in a payload.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    End = 0,
    BlockEnd = 1,
    Buffer = 2,
    FileInfo = 3,
    Int = 4,
    Stat = 5,
    Statvfs = 6,
    Timespec = 7,
}

impl Tag {
    pub fn from_wire(value: u64) -> Option<Self> {
        Some(match value {
            0 => Tag::End,
            1 => Tag::BlockEnd,
            2 => Tag::Buffer,
            3 => Tag::FileInfo,
            4 => Tag::Int,
            5 => Tag::Stat,
            6 => Tag::Statvfs,
            7 => Tag::Timespec,
            _ => return None,
        })
    }

    fn is_terminator(self) -> bool {
        matches!(self, Tag::End | Tag::BlockEnd)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::End => "end",
            Tag::BlockEnd => "block-end",
            Tag::Buffer => "buffer",
            Tag::FileInfo => "file-info",
            Tag::Int => "int",
            Tag::Stat => "stat",
            Tag::Statvfs => "statvfs",
            Tag::Timespec => "timespec",
        };
        f.write_str(name)
    }
}

/// One decoded (or to-be-encoded) payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    End,
    BlockEnd,
    Buffer(Vec<u8>),
    FileInfo(FileInfo),
    Int(i64),
    Stat(FileStat),
    Statvfs(FsStat),
    Timespec(TimeSpec),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::End => Tag::End,
            Value::BlockEnd => Tag::BlockEnd,
            Value::Buffer(_) => Tag::Buffer,
            Value::FileInfo(_) => Tag::FileInfo,
            Value::Int(_) => Tag::Int,
            Value::Stat(_) => Tag::Stat,
            Value::Statvfs(_) => Tag::Statvfs,
            Value::Timespec(_) => Tag::Timespec,
        }
    }

    /// A path or name as a NUL-terminated buffer.
    pub fn path(path: impl AsRef<OsStr>) -> Self {
        let bytes = path.as_ref().as_bytes();
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        Value::Buffer(buf)
    }

    /// Bytes this value occupies in a payload.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::BlockEnd => 0,
            Value::End => WORD,
            Value::Int(_) => 2 * WORD,
            Value::Buffer(b) => 2 * WORD + b.len(),
            Value::FileInfo(_) => WORD * (1 + FILE_INFO_FIELDS),
            Value::Stat(_) => WORD * (1 + STAT_FIELDS),
            Value::Statvfs(_) => WORD * (1 + STATVFS_FIELDS),
            Value::Timespec(_) => WORD * (1 + TIMESPEC_FIELDS),
        }
    }
}

fn put_words(buf: &mut Vec<u8>, words: &[i64]) {
    // Words are already big-endian from the marshaller.
    for w in words {
        buf.extend_from_slice(&w.to_ne_bytes());
    }
}

/// Append `values` to `buf`, stopping at the first `End` or `BlockEnd`.
///
/// Returns the number of bytes appended. The list must contain a
/// terminator; on error `buf` is left untouched.
pub fn build_payload(buf: &mut Vec<u8>, values: &[Value]) -> Result<usize> {
    let stop = values
        .iter()
        .position(|v| v.tag().is_terminator())
        .ok_or(ProtocolError::Unterminated)?;
    let values = &values[..=stop];

    let needed: usize = values.iter().map(Value::encoded_len).sum();
    buf.try_reserve(needed)
        .map_err(|_| ProtocolError::Alloc(needed))?;

    let start = buf.len();
    for value in values {
        if let Value::BlockEnd = value {
            break;
        }
        buf.extend_from_slice(&(value.tag() as u64).to_be_bytes());
        match value {
            Value::End | Value::BlockEnd => {}
            Value::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Buffer(b) => {
                buf.extend_from_slice(&(b.len() as i64).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Value::FileInfo(ffi) => put_words(buf, &ffi.marshal()),
            Value::Stat(st) => put_words(buf, &st.marshal()),
            Value::Statvfs(stv) => put_words(buf, &stv.marshal()),
            Value::Timespec(ts) => put_words(buf, &ts.marshal()),
        }
    }
    Ok(buf.len() - start)
}

/// Bounds-checked read cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len().saturating_sub(self.pos);
        if len > remaining {
            return Err(ProtocolError::OutOfBounds {
                needed: len as u64,
                remaining,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn word(&mut self) -> Result<[u8; WORD]> {
        let mut out = [0u8; WORD];
        out.copy_from_slice(self.take(WORD)?);
        Ok(out)
    }

    fn int(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.word()?))
    }

    fn words<const N: usize>(&mut self) -> Result<[i64; N]> {
        let bytes = self.take(N * WORD)?;
        let mut out = [0i64; N];
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(WORD)) {
            let mut w = [0u8; WORD];
            w.copy_from_slice(chunk);
            *slot = i64::from_ne_bytes(w);
        }
        Ok(out)
    }

    fn buffer(&mut self) -> Result<Vec<u8>> {
        let len = self.int()?;
        let remaining = self.buf.len().saturating_sub(self.pos);
        let len = usize::try_from(len).map_err(|_| ProtocolError::OutOfBounds {
            needed: len as u64,
            remaining,
        })?;
        let bytes = self.take(len)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| ProtocolError::Alloc(len))?;
        out.extend_from_slice(bytes);
        Ok(out)
    }
}

/// Parse values of the `expected` shapes from `payload`, starting at `offset`.
///
/// Stops after consuming `End`, or before `BlockEnd` without consuming
/// anything. `offset` only advances when the whole list parsed; on error it
/// is left where it was.
pub fn parse_payload(payload: &[u8], offset: &mut usize, expected: &[Tag]) -> Result<Args> {
    if !expected.iter().any(|t| t.is_terminator()) {
        return Err(ProtocolError::Unterminated);
    }

    let mut reader = Reader {
        buf: payload,
        pos: *offset,
    };
    let mut values = Vec::with_capacity(expected.len());

    for &tag in expected {
        if tag == Tag::BlockEnd {
            break;
        }
        let found = u64::from_be_bytes(reader.word()?);
        if found != tag as u64 {
            return Err(ProtocolError::TypeMismatch {
                expected: tag,
                found,
            });
        }
        let value = match tag {
            Tag::End => break,
            Tag::BlockEnd => unreachable!("handled above"),
            Tag::Int => Value::Int(reader.int()?),
            Tag::Buffer => Value::Buffer(reader.buffer()?),
            Tag::FileInfo => Value::FileInfo(FileInfo::unmarshal(&reader.words()?)),
            Tag::Stat => Value::Stat(FileStat::unmarshal(&reader.words()?)),
            Tag::Statvfs => Value::Statvfs(FsStat::unmarshal(&reader.words()?)),
            Tag::Timespec => Value::Timespec(TimeSpec::unmarshal(&reader.words()?)),
        };
        values.push(value);
    }

    *offset = reader.pos;
    Ok(Args::new(values))
}

/// True while a streamed payload still holds another group after `offset`.
///
/// A lone trailing `End` is exactly one word, so more than one word left
/// means another group follows.
pub fn has_more_groups(payload: &[u8], offset: usize) -> bool {
    offset + WORD < payload.len()
}

/// Strip the NUL terminator (and anything after it) from a path buffer.
pub fn buffer_to_os_string(mut buf: Vec<u8>) -> OsString {
    if let Some(nul) = buf.iter().position(|&b| b == 0) {
        buf.truncate(nul);
    }
    OsString::from_vec(buf)
}

/// Parsed values, consumed front to back with typed accessors.
#[derive(Debug)]
pub struct Args {
    values: std::vec::IntoIter<Value>,
}

macro_rules! typed_next {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            match self.values.next() {
                Some(Value::$variant(v)) => Ok(v),
                Some(other) => Err(ProtocolError::TypeMismatch {
                    expected: Tag::$variant,
                    found: other.tag() as u64,
                }),
                None => Err(ProtocolError::TypeMismatch {
                    expected: Tag::$variant,
                    found: Tag::End as u64,
                }),
            }
        }
    };
}

impl Args {
    fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    typed_next!(next_int, Int, i64);
    typed_next!(next_buffer, Buffer, Vec<u8>);
    typed_next!(next_file_info, FileInfo, FileInfo);
    typed_next!(next_stat, Stat, FileStat);
    typed_next!(next_statvfs, Statvfs, FsStat);
    typed_next!(next_timespec, Timespec, TimeSpec);

    /// Next buffer, interpreted as a NUL-terminated path or name.
    pub fn next_path(&mut self) -> Result<OsString> {
        self.next_buffer().map(buffer_to_os_string)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.len() == 0
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<Value> {
        vec![
            Value::path("/tmp/a"),
            Value::Int(-5),
            Value::Buffer(Vec::new()),
            Value::FileInfo(FileInfo::with_handle(3)),
            Value::Stat(FileStat {
                size: 99,
                ..Default::default()
            }),
            Value::Statvfs(FsStat {
                namemax: 255,
                ..Default::default()
            }),
            Value::Timespec(TimeSpec::new(1, 2)),
            Value::End,
        ]
    }

    fn tags(values: &[Value]) -> Vec<Tag> {
        values.iter().map(Value::tag).collect()
    }

    #[test]
    fn test_build_then_parse() {
        let values = sample_values();
        let mut buf = Vec::new();
        let written = build_payload(&mut buf, &values).unwrap();
        assert_eq!(written, buf.len());

        let mut offset = 0;
        let args = parse_payload(&buf, &mut offset, &tags(&values)).unwrap();
        assert_eq!(offset, buf.len());
        assert_eq!(args.into_vec(), values[..values.len() - 1].to_vec());
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = Vec::new();
        build_payload(&mut buf, &[Value::Int(0x0102), Value::path("x"), Value::End]).unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            0, 0, 0, 0, 0, 0, 0, 4,     // int tag
            0, 0, 0, 0, 0, 0, 1, 2,     // value
            0, 0, 0, 0, 0, 0, 0, 2,     // buffer tag
            0, 0, 0, 0, 0, 0, 0, 2,     // length
            b'x', 0,
            0, 0, 0, 0, 0, 0, 0, 0,     // end tag
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_build_appends_to_existing() {
        let mut buf = vec![0xAA];
        let written = build_payload(&mut buf, &[Value::End]).unwrap();
        assert_eq!(written, WORD);
        assert_eq!(buf.len(), 1 + WORD);
        assert_eq!(buf[0], 0xAA);
    }

    #[test]
    fn test_block_end_writes_nothing() {
        let mut buf = Vec::new();
        let written =
            build_payload(&mut buf, &[Value::Int(1), Value::BlockEnd, Value::Int(2)]).unwrap();
        assert_eq!(written, 2 * WORD);
        assert_eq!(buf.len(), 2 * WORD);
    }

    #[test]
    fn test_unterminated_lists_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            build_payload(&mut buf, &[Value::Int(1)]),
            Err(ProtocolError::Unterminated)
        ));
        assert!(buf.is_empty());

        let mut offset = 0;
        assert!(matches!(
            parse_payload(&[], &mut offset, &[Tag::Int]),
            Err(ProtocolError::Unterminated)
        ));
    }

    #[test]
    fn test_tag_mismatch_keeps_offset() {
        let mut buf = Vec::new();
        build_payload(&mut buf, &[Value::Int(7), Value::End]).unwrap();
        let mut offset = 0;
        let err = parse_payload(&buf, &mut offset, &[Tag::Buffer, Tag::End]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TypeMismatch {
                expected: Tag::Buffer,
                found: 4
            }
        ));
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_truncated_payload_never_overreads() {
        let values = sample_values();
        let mut buf = Vec::new();
        build_payload(&mut buf, &values).unwrap();
        let expected = tags(&values);

        for cut in 0..buf.len() {
            let mut offset = 0;
            let result = parse_payload(&buf[..cut], &mut offset, &expected);
            assert!(result.is_err(), "prefix of {} bytes parsed", cut);
            assert_eq!(offset, 0);
        }
    }

    #[test]
    fn test_negative_and_huge_buffer_lengths() {
        for len in [-1i64, i64::MAX] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&(Tag::Buffer as u64).to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&[0u8; 4]);
            let mut offset = 0;
            let err = parse_payload(&buf, &mut offset, &[Tag::Buffer, Tag::End]).unwrap_err();
            assert!(matches!(err, ProtocolError::OutOfBounds { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_empty_buffer_is_valid() {
        let mut buf = Vec::new();
        build_payload(&mut buf, &[Value::Buffer(vec![]), Value::End]).unwrap();
        let mut offset = 0;
        let mut args = parse_payload(&buf, &mut offset, &[Tag::Buffer, Tag::End]).unwrap();
        assert!(args.next_buffer().unwrap().is_empty());
    }

    fn build_listing(names: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        build_payload(
            &mut buf,
            &[Value::FileInfo(FileInfo::default()), Value::BlockEnd],
        )
        .unwrap();
        for (i, name) in names.iter().enumerate() {
            build_payload(
                &mut buf,
                &[
                    Value::path(name),
                    Value::Stat(FileStat::dir_entry(i as u64 + 1, libc::DT_REG)),
                    Value::BlockEnd,
                ],
            )
            .unwrap();
        }
        build_payload(&mut buf, &[Value::End]).unwrap();
        buf
    }

    fn parse_listing(buf: &[u8]) -> Vec<(OsString, u64)> {
        let mut offset = 0;
        parse_payload(buf, &mut offset, &[Tag::FileInfo, Tag::BlockEnd])
            .unwrap()
            .next_file_info()
            .unwrap();
        let mut entries = Vec::new();
        while has_more_groups(buf, offset) {
            let mut group =
                parse_payload(buf, &mut offset, &[Tag::Buffer, Tag::Stat, Tag::BlockEnd]).unwrap();
            let name = group.next_path().unwrap();
            let st = group.next_stat().unwrap();
            entries.push((name, st.ino));
        }
        let end = parse_payload(buf, &mut offset, &[Tag::End]).unwrap();
        assert!(end.is_empty());
        assert_eq!(offset, buf.len());
        entries
    }

    #[test]
    fn test_streamed_groups() {
        for names in [&[][..], &["only"][..], &["a", "b", "c", "d"][..]] {
            let entries = parse_listing(&build_listing(names));
            let got: Vec<_> = entries
                .iter()
                .map(|(n, _)| n.to_str().unwrap().to_string())
                .collect();
            assert_eq!(got, names);
            for (i, (_, ino)) in entries.iter().enumerate() {
                assert_eq!(*ino, i as u64 + 1);
            }
        }
    }

    #[test]
    fn test_args_type_checks() {
        let mut buf = Vec::new();
        build_payload(&mut buf, &[Value::Int(1), Value::End]).unwrap();
        let mut offset = 0;
        let mut args = parse_payload(&buf, &mut offset, &[Tag::Int, Tag::End]).unwrap();
        assert!(args.next_buffer().is_err());
        assert!(args.next_int().is_err());
    }

    #[test]
    fn test_path_strips_nul() {
        assert_eq!(buffer_to_os_string(b"abc\0junk".to_vec()), OsString::from("abc"));
        assert_eq!(buffer_to_os_string(b"abc".to_vec()), OsString::from("abc"));
    }
}
