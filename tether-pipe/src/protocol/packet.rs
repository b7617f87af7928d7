//! Packet framing and the version handshake.
//!
//! Every packet is an 8-byte header followed by exactly `payload_size` bytes:
//!
//! ```text
//! +----------------+--------+----------------+-------------+
//! | payload_size   | op     | is_host_packet | error       |
//! | u32 BE         | u8     | u8             | u16         |
//! +----------------+--------+----------------+-------------+
//! ```
//!
//! The error field is big-endian on host packets and little-endian on device
//! replies. Devices historically wrote it in their native byte order; it is
//! fixed to little-endian here so reply headers are the same bytes on every
//! device.

use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::error::{describe_errno, ProtocolError, Result};
use super::op::OpCode;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 8;

/// Version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload accepted from the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues requests.
    Host,
    /// Executes requests.
    Device,
}

/// Decoded packet header, in host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_size: u32,
    pub op_code: u8,
    pub is_host_packet: u8,
    pub error: u16,
}

impl PacketHeader {
    pub fn request(op: OpCode, payload_size: u32) -> Self {
        Self {
            payload_size,
            op_code: op.as_u8(),
            is_host_packet: 1,
            error: 0,
        }
    }

    pub fn reply(op_code: u8, error: u16, payload_size: u32) -> Self {
        Self {
            payload_size,
            op_code,
            is_host_packet: 0,
            error,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host_packet != 0
    }

    pub fn op(&self) -> Result<OpCode> {
        OpCode::try_from(self.op_code)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.payload_size.to_be_bytes());
        out[4] = self.op_code;
        out[5] = self.is_host_packet;
        let error = if self.is_host() {
            self.error.to_be_bytes()
        } else {
            self.error.to_le_bytes()
        };
        out[6..8].copy_from_slice(&error);
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let is_host_packet = bytes[5];
        let error = [bytes[6], bytes[7]];
        Self {
            payload_size: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            op_code: bytes[4],
            is_host_packet,
            error: if is_host_packet != 0 {
                u16::from_be_bytes(error)
            } else {
                u16::from_le_bytes(error)
            },
        }
    }
}

/// A header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    Ok(payload.len() as u32)
}

impl Packet {
    /// Host request carrying an encoded argument list.
    pub fn request(op: OpCode, payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            header: PacketHeader::request(op, payload_len(&payload)?),
            payload,
        })
    }

    /// Successful device reply.
    pub fn reply(op_code: u8, payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            header: PacketHeader::reply(op_code, 0, payload_len(&payload)?),
            payload,
        })
    }

    /// Device error reply: errno in the header, its description plus a NUL
    /// as the raw payload.
    pub fn error_reply(op_code: u8, errno: i32) -> Self {
        let mut payload = describe_errno(errno).as_bytes().to_vec();
        payload.push(0);
        Self {
            header: PacketHeader::reply(op_code, errno as u16, payload.len() as u32),
            payload,
        }
    }

    /// Description carried by an error reply, without the trailing NUL.
    pub fn error_message(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

/// Fill `buf` completely, retrying on `Interrupted`.
///
/// A zero-byte read means the peer went away: [`ProtocolError::Closed`].
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ProtocolError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_full<W: Write>(writer: &mut W, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn check_payload(header: &PacketHeader, payload: &[u8]) -> Result<()> {
    if header.payload_size as usize != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "header announces {} payload bytes, got {}",
                header.payload_size,
                payload.len()
            ),
        )
        .into());
    }
    Ok(())
}

fn check_incoming(header: &PacketHeader) -> Result<usize> {
    let size = header.payload_size as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(size));
    }
    Ok(size)
}

/// Write a header and its payload.
pub fn write_message<W: Write>(writer: &mut W, header: &PacketHeader, payload: &[u8]) -> Result<()> {
    check_payload(header, payload)?;
    write_full(writer, &header.encode())?;
    write_full(writer, payload)?;
    writer.flush()?;
    trace!(target: "tether-pipe::protocol", op = header.op_code, bytes = payload.len(), "packet sent");
    Ok(())
}

/// Read one header and exactly the payload it announces.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Packet> {
    let mut raw = [0u8; HEADER_SIZE];
    read_full(reader, &mut raw)?;
    let header = PacketHeader::decode(&raw);
    let size = check_incoming(&header)?;

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(size)
        .map_err(|_| ProtocolError::Alloc(size))?;
    payload.resize(size, 0);
    read_full(reader, &mut payload)?;
    trace!(target: "tether-pipe::protocol", op = header.op_code, bytes = size, "packet received");
    Ok(Packet { header, payload })
}

/// Send our protocol version.
pub fn send_handshake<W: Write>(writer: &mut W, version: u32) -> Result<()> {
    write_full(writer, &version.to_be_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read the peer's protocol version.
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    read_full(reader, &mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

/// Exchange versions in role order (the device speaks first) and require
/// them to match.
pub fn negotiate<S: Read + Write>(stream: &mut S, role: Role, version: u32) -> Result<u32> {
    let remote = match role {
        Role::Device => {
            send_handshake(stream, version)?;
            read_handshake(stream)?
        }
        Role::Host => {
            let remote = read_handshake(stream)?;
            send_handshake(stream, version)?;
            remote
        }
    };
    check_version(role, version, remote)
}

fn check_version(role: Role, local: u32, remote: u32) -> Result<u32> {
    if local != remote {
        return Err(ProtocolError::VersionMismatch { local, remote });
    }
    debug!(target: "tether-pipe::protocol", ?role, version = local, "handshake complete");
    Ok(local)
}

fn map_async_eof(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Closed
    } else {
        ProtocolError::Io(e)
    }
}

/// Async variant of [`read_message`].
pub async fn read_message_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await.map_err(map_async_eof)?;
    let header = PacketHeader::decode(&raw);
    let size = check_incoming(&header)?;

    let mut payload = vec![0u8; size];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_async_eof)?;
    Ok(Packet { header, payload })
}

/// Async variant of [`write_message`].
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &PacketHeader,
    payload: &[u8],
) -> Result<()> {
    check_payload(header, payload)?;
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Async variant of [`negotiate`].
pub async fn negotiate_async<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    role: Role,
    version: u32,
) -> Result<u32> {
    let mut raw = [0u8; 4];
    let remote = match role {
        Role::Device => {
            stream.write_all(&version.to_be_bytes()).await?;
            stream.flush().await?;
            stream.read_exact(&mut raw).await.map_err(map_async_eof)?;
            u32::from_be_bytes(raw)
        }
        Role::Host => {
            stream.read_exact(&mut raw).await.map_err(map_async_eof)?;
            stream.write_all(&version.to_be_bytes()).await?;
            stream.flush().await?;
            u32::from_be_bytes(raw)
        }
    };
    check_version(role, version, remote)
}
