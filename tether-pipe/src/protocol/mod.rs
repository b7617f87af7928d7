//! Wire protocol between a host front-end and a device.
//!
//! Layers, leaves first:
//!
//! - [`marshal`]: fixed-shape POSIX records as big-endian `i64` arrays
//! - [`codec`]: self-describing tagged-value payloads
//! - [`packet`]: 8-byte header framing and the version handshake
//!
//! # Session
//!
//! ```text
//! host                                device
//!   |  <------- version (u32 BE) -------  |
//!   |  -------- version (u32 BE) ------>  |
//!   |  -------- request packet -------->  |
//!   |  <------- reply packet -----------  |
//!   |              ...                    |
//!   |  -------- quit ------------------>  |
//! ```
//!
//! Exactly one request is outstanding at a time, so replies need no
//! correlation id.

pub mod codec;
mod error;
pub mod marshal;
mod op;
pub mod packet;

pub use codec::{build_payload, has_more_groups, parse_payload, Args, Tag, Value};
pub use error::{describe_errno, status_of, ProtocolError, Result};
pub use marshal::{FileInfo, FileStat, FsStat, TimeSpec};
pub use op::OpCode;
pub use packet::{
    negotiate, negotiate_async, read_handshake, read_message, read_message_async,
    send_handshake, write_message, write_message_async, Packet, PacketHeader, Role,
    HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_through_every_layer() {
        let mut payload = Vec::new();
        build_payload(
            &mut payload,
            &[Value::path("/tmp/a"), Value::Int(0o755), Value::End],
        )
        .unwrap();
        let packet = Packet::request(OpCode::Mkdir, payload).unwrap();

        let mut wire = Vec::new();
        write_message(&mut wire, &packet.header, &packet.payload).unwrap();

        let received = read_message(&mut std::io::Cursor::new(wire)).unwrap();
        assert!(received.header.is_host());
        assert_eq!(received.header.op().unwrap(), OpCode::Mkdir);

        let mut offset = 0;
        let mut args =
            parse_payload(&received.payload, &mut offset, &[Tag::Buffer, Tag::Int, Tag::End])
                .unwrap();
        assert_eq!(args.next_path().unwrap(), "/tmp/a");
        assert_eq!(args.next_int().unwrap(), 0o755);
        assert_eq!(offset, received.payload.len());
    }
}
