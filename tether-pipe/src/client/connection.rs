//! Host end of a session: handshake, `remote_call` and `remote_answer`.

use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::protocol::{
    build_payload, negotiate, parse_payload, read_message, write_message, Args, OpCode, Packet,
    ProtocolError, Result, Role, Tag, Value, PROTOCOL_VERSION,
};
use crate::transport::{Endpoint, Transport};

/// Host-side connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Version announced in the handshake.
    pub protocol_version: u32,
    /// Read/write timeout applied to the socket. `None` blocks forever.
    /// A timed out exchange leaves the connection unusable.
    pub io_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            io_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// A negotiated connection to a device.
///
/// Strictly one request in flight: every [`remote_call`](Self::remote_call)
/// must be followed by reading its reply before the next call. Once a
/// request or reply fails part way through, every later call fails with
/// [`ProtocolError::Desynced`].
pub struct Connection<S = Box<dyn Transport>> {
    stream: S,
    version: u32,
    desynced: bool,
}

/// Connect to `endpoint` and run the handshake.
pub fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Connection> {
    let stream = endpoint.connect().map_err(io::Error::from)?;
    stream.set_io_timeout(config.io_timeout)?;
    info!(target: "tether-pipe::client", %endpoint, "connected to device");
    Connection::establish(stream, config)
}

impl<S: Read + Write> Connection<S> {
    /// Run the handshake over an already connected stream.
    pub fn establish(mut stream: S, config: &ClientConfig) -> Result<Self> {
        let version = negotiate(&mut stream, Role::Host, config.protocol_version)?;
        debug!(target: "tether-pipe::client", version, "handshake complete");
        Ok(Self {
            stream,
            version,
            desynced: false,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// False once a failed exchange has left a reply unaccounted for.
    pub fn is_usable(&self) -> bool {
        !self.desynced
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.desynced {
            return Err(ProtocolError::Desynced);
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            debug!(target: "tether-pipe::client", error = %e, "connection out of sync");
            self.desynced = true;
        }
        result
    }

    /// Send one request. `End` is appended when `args` lacks it.
    pub fn remote_call(&mut self, op: OpCode, mut args: Vec<Value>) -> Result<()> {
        self.ensure_usable()?;
        if !matches!(args.last(), Some(Value::End)) {
            args.push(Value::End);
        }
        let mut payload = Vec::new();
        build_payload(&mut payload, &args)?;
        let request = Packet::request(op, payload)?;
        trace!(target: "tether-pipe::client", %op, size = request.payload.len(), "remote_call");
        let sent = write_message(&mut self.stream, &request.header, &request.payload);
        self.track(sent)
    }

    /// Read the reply to `op`. A non-zero error field fails with
    /// [`ProtocolError::Remote`] before any parsing.
    pub fn read_reply(&mut self, op: OpCode) -> Result<Packet> {
        self.ensure_usable()?;
        let received = read_message(&mut self.stream);
        let reply = self.track(received)?;
        let header = reply.header;
        if header.op_code != op.as_u8() || header.is_host() {
            return self.track(Err(ProtocolError::UnexpectedReply {
                sent: op,
                received: header.op_code,
                host_flag: header.is_host_packet,
            }));
        }
        if header.error != 0 {
            return Err(ProtocolError::Remote {
                op,
                errno: header.error as i32,
                message: reply.error_message(),
            });
        }
        Ok(reply)
    }

    /// Read the reply to `op` and parse it against `expected`.
    pub fn remote_answer(&mut self, op: OpCode, expected: &[Tag]) -> Result<Args> {
        let reply = self.read_reply(op)?;
        let mut offset = 0;
        let args = parse_payload(&reply.payload, &mut offset, expected)?;
        if offset != reply.payload.len() {
            return Err(ProtocolError::TrailingBytes(reply.payload.len() - offset));
        }
        Ok(args)
    }

    /// `remote_call` followed by `remote_answer`.
    pub fn call(&mut self, op: OpCode, args: Vec<Value>, expected: &[Tag]) -> Result<Args> {
        self.remote_call(op, args)?;
        self.remote_answer(op, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_handshake, send_handshake, FileStat, PacketHeader};
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Runs `device` against the device end of a socket pair.
    fn with_device<F>(device: F) -> Connection<UnixStream>
    where
        F: FnOnce(&mut UnixStream) + Send + 'static,
    {
        let (host, mut dev) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            send_handshake(&mut dev, PROTOCOL_VERSION).unwrap();
            read_handshake(&mut dev).unwrap();
            device(&mut dev);
        });
        Connection::establish(host, &ClientConfig::default()).unwrap()
    }

    fn answer(dev: &mut UnixStream, op_code: u8, values: &[Value]) {
        let mut payload = Vec::new();
        build_payload(&mut payload, values).unwrap();
        let reply = Packet::reply(op_code, payload).unwrap();
        write_message(dev, &reply.header, &reply.payload).unwrap();
    }

    #[test]
    fn test_call_appends_end() {
        let mut conn = with_device(|dev| {
            let request = read_message(dev).unwrap();
            assert!(request.header.is_host());
            let mut offset = 0;
            let mut args =
                parse_payload(&request.payload, &mut offset, &[Tag::Buffer, Tag::End]).unwrap();
            assert_eq!(args.next_path().unwrap(), "/tmp/a");
            assert_eq!(offset, request.payload.len());

            let stat = FileStat {
                size: 7,
                ..Default::default()
            };
            answer(dev, request.header.op_code, &[Value::Stat(stat), Value::End]);
        });

        let mut args = conn
            .call(OpCode::Getattr, vec![Value::path("/tmp/a")], &[Tag::Stat, Tag::End])
            .unwrap();
        assert_eq!(args.next_stat().unwrap().size, 7);
    }

    #[test]
    fn test_error_reply_fails_before_parsing() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            let reply = Packet::error_reply(OpCode::Getattr.as_u8(), libc::ENOENT);
            write_message(dev, &reply.header, &reply.payload).unwrap();
        });

        let err = conn
            .call(OpCode::Getattr, vec![Value::path("/nope")], &[Tag::Stat, Tag::End])
            .unwrap_err();
        match err {
            ProtocolError::Remote { op, errno, message } => {
                assert_eq!(op, OpCode::Getattr);
                assert_eq!(errno, libc::ENOENT);
                assert_eq!(message, "No such file or directory");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reply_for_other_op_rejected() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            answer(dev, OpCode::Unlink.as_u8(), &[Value::End]);
        });

        let err = conn
            .call(OpCode::Rmdir, vec![Value::path("/d")], &[Tag::End])
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedReply {
                sent: OpCode::Rmdir,
                ..
            }
        ));
        assert!(!conn.is_usable());
        let err = conn
            .call(OpCode::Rmdir, vec![Value::path("/d")], &[Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Desynced));
    }

    #[test]
    fn test_late_reply_not_taken_for_next_request() {
        let (host, mut dev) = UnixStream::pair().unwrap();
        host.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let device = thread::spawn(move || {
            send_handshake(&mut dev, PROTOCOL_VERSION).unwrap();
            read_handshake(&mut dev).unwrap();
            read_message(&mut dev).unwrap();
            thread::sleep(Duration::from_millis(300));

            let mut stale = FileStat::default();
            for size in 1..=2 {
                stale.size = size;
                let mut payload = Vec::new();
                build_payload(&mut payload, &[Value::Stat(stale), Value::End]).unwrap();
                let reply = Packet::reply(OpCode::Getattr.as_u8(), payload).unwrap();
                if write_message(&mut dev, &reply.header, &reply.payload).is_err()
                    || read_message(&mut dev).is_err()
                {
                    break;
                }
            }
        });
        let mut conn = Connection::establish(host, &ClientConfig::default()).unwrap();

        let err = conn
            .call(OpCode::Getattr, vec![Value::path("/a")], &[Tag::Stat, Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)), "{err:?}");

        // Let the late reply for /a land in the socket buffer.
        thread::sleep(Duration::from_millis(400));
        let err = conn
            .call(OpCode::Getattr, vec![Value::path("/b")], &[Tag::Stat, Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Desynced), "{err:?}");
        assert_eq!(err.errno(), libc::ENOTCONN);

        drop(conn);
        device.join().unwrap();
    }

    #[test]
    fn test_remote_error_keeps_connection_usable() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            let reply = Packet::error_reply(OpCode::Unlink.as_u8(), libc::ENOENT);
            write_message(dev, &reply.header, &reply.payload).unwrap();
            read_message(dev).unwrap();
            answer(dev, OpCode::Unlink.as_u8(), &[Value::End]);
        });

        let err = conn
            .call(OpCode::Unlink, vec![Value::path("/gone")], &[Tag::End])
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(conn.is_usable());
        conn.call(OpCode::Unlink, vec![Value::path("/f")], &[Tag::End])
            .unwrap();
    }

    #[test]
    fn test_default_config_has_no_timeout() {
        assert_eq!(ClientConfig::default().io_timeout, None);
    }

    #[test]
    fn test_reply_flagged_as_host_rejected() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            let header = PacketHeader::request(OpCode::Rmdir, 8);
            write_message(dev, &header, &(Tag::End as u64).to_be_bytes()).unwrap();
        });

        let err = conn
            .call(OpCode::Rmdir, vec![Value::path("/d")], &[Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { host_flag: 1, .. }));
    }

    #[test]
    fn test_reply_shape_mismatch() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            answer(dev, OpCode::Unlink.as_u8(), &[Value::Int(1), Value::End]);
        });

        // Device sent [Int, End]; a bare [End] shape does not match.
        let err = conn
            .call(OpCode::Unlink, vec![Value::path("/f")], &[Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));
    }

    #[test]
    fn test_extra_bytes_after_end_rejected() {
        let mut conn = with_device(|dev| {
            read_message(dev).unwrap();
            let mut payload = (Tag::End as u64).to_be_bytes().to_vec();
            payload.extend_from_slice(&[0u8; 8]);
            let reply = Packet::reply(OpCode::Unlink.as_u8(), payload).unwrap();
            write_message(dev, &reply.header, &reply.payload).unwrap();
        });

        let err = conn
            .call(OpCode::Unlink, vec![Value::path("/f")], &[Tag::End])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TrailingBytes(8)));
    }

    #[test]
    fn test_version_mismatch() {
        let (host, mut dev) = UnixStream::pair().unwrap();
        let device = thread::spawn(move || {
            send_handshake(&mut dev, 2).unwrap();
            read_handshake(&mut dev).unwrap()
        });

        let err = Connection::establish(host, &ClientConfig::default()).err().unwrap();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch {
                local: 1,
                remote: 2
            }
        ));
        assert_eq!(device.join().unwrap(), 1);
    }
}
