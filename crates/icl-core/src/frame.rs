//! Request/response framing
//!
//! Every packet starts with a fixed 16-byte header:
//!
//! ```text
//! 0      1      2       4              8        10       12             16
//! +------+------+-------+--------------+--------+--------+--------------+------
//! | tag  |level | flags | total length | task   | rsvd   | server id    | body
//! | 0xD7 |      |       | u32 BE       | u16 BE |        | u32 BE       |
//! +------+------+-------+--------------+--------+--------+--------------+------
//! ```
//!
//! The first `PREFIX_LEN` bytes are enough to learn the total length, so
//! workers receive the prefix first and then the remainder.

use core::fmt;

use crate::error::FrameError;

/// Protocol tag carried in byte 0 of every packet
pub const PROTOCOL_TAG: u8 = 0xD7;

/// Interface level this server speaks
pub const INTERFACE_LEVEL: u8 = 1;

/// Bytes needed to learn the total packet length
pub const PREFIX_LEN: usize = 8;

/// Full fixed header length
pub const HEADER_LEN: usize = 16;

/// Length of a synthesized error response (header + u32 status)
pub const ERROR_RESPONSE_LEN: usize = HEADER_LEN + 4;

const OFF_TAG: usize = 0;
const OFF_LEVEL: usize = 1;
const OFF_FLAGS: usize = 2;
const OFF_LENGTH: usize = 4;
const OFF_TASK: usize = 8;
const OFF_SERVER_ID: usize = 12;

/// Task code carried at offset 8
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaskCode(pub u16);

impl TaskCode {
    /// Pre-authentication credentials exchange
    pub const CREDENTIALS: TaskCode = TaskCode(0x0001);

    /// Pre-authentication session begin
    pub const BEGIN: TaskCode = TaskCode(0x0002);

    /// Tasks that arrive before a server-instance id is known
    #[inline]
    pub const fn is_pre_auth(self) -> bool {
        self.0 == Self::CREDENTIALS.0 || self.0 == Self::BEGIN.0
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TaskCode::CREDENTIALS => write!(f, "CREDENTIALS"),
            TaskCode::BEGIN => write!(f, "BEGIN"),
            TaskCode(other) => write!(f, "TaskCode({:#06x})", other),
        }
    }
}

impl fmt::Display for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status codes carried by synthesized error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseStatus {
    LevelMismatch = 1001,
    ServerIdMismatch = 1002,
    InvalidRequest = 1003,
}

impl ResponseStatus {
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1001 => Some(ResponseStatus::LevelMismatch),
            1002 => Some(ResponseStatus::ServerIdMismatch),
            1003 => Some(ResponseStatus::InvalidRequest),
            _ => None,
        }
    }
}

/// The first `PREFIX_LEN` bytes of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPrefix {
    pub tag: u8,
    pub level: u8,
    pub flags: u16,
    pub length: u32,
}

impl PacketPrefix {
    /// Parse the prefix. Does not judge tag or length.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let b = buf.get(..PREFIX_LEN).ok_or(FrameError::Truncated {
            have: buf.len(),
            need: PREFIX_LEN,
        })?;
        Ok(PacketPrefix {
            tag: b[OFF_TAG],
            level: b[OFF_LEVEL],
            flags: u16::from_be_bytes([b[OFF_FLAGS], b[OFF_FLAGS + 1]]),
            length: u32::from_be_bytes([
                b[OFF_LENGTH],
                b[OFF_LENGTH + 1],
                b[OFF_LENGTH + 2],
                b[OFF_LENGTH + 3],
            ]),
        })
    }

    #[inline]
    pub fn check_tag(&self) -> Result<(), FrameError> {
        if self.tag == PROTOCOL_TAG {
            Ok(())
        } else {
            Err(FrameError::BadTag { found: self.tag, declared_len: self.length })
        }
    }

    /// Declared length must cover the header and stay within `max`
    #[inline]
    pub fn check_length(&self, max: usize) -> Result<usize, FrameError> {
        let len = self.length as usize;
        if len < HEADER_LEN || len > max {
            return Err(FrameError::LengthOutOfRange {
                len: self.length,
                min: HEADER_LEN as u32,
                max: max.min(u32::MAX as usize) as u32,
            });
        }
        Ok(len)
    }

    /// A bad-tag packet still deserves a reply if its length looks like
    /// a first contact
    #[inline]
    pub fn plausible_first_contact(&self, first_contact_max: usize) -> bool {
        let len = self.length as usize;
        len >= PREFIX_LEN && len <= first_contact_max
    }
}

/// Task code of a packet that holds at least a full header
#[inline]
pub fn task_code(packet: &[u8]) -> Option<TaskCode> {
    packet
        .get(OFF_TASK..OFF_TASK + 2)
        .map(|b| TaskCode(u16::from_be_bytes([b[0], b[1]])))
}

/// Server instance id embedded in the header
#[inline]
pub fn server_id(packet: &[u8]) -> Option<u32> {
    packet
        .get(OFF_SERVER_ID..OFF_SERVER_ID + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Status of a synthesized error response
#[inline]
pub fn response_status(packet: &[u8]) -> Option<u32> {
    packet
        .get(HEADER_LEN..HEADER_LEN + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Write the fixed header into `out`, replacing its content
pub fn encode_header(out: &mut Vec<u8>, task: TaskCode, server_id: u32, total_len: u32) {
    out.clear();
    out.push(PROTOCOL_TAG);
    out.push(INTERFACE_LEVEL);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&task.0.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&server_id.to_be_bytes());
}

/// Synthesize an error response echoing `task`
pub fn encode_error_response(
    out: &mut Vec<u8>,
    task: TaskCode,
    server_id: u32,
    status: ResponseStatus,
) {
    encode_header(out, task, server_id, ERROR_RESPONSE_LEN as u32);
    out.extend_from_slice(&status.code().to_be_bytes());
}

/// Builds request packets. Used by clients, tests and benchmarks.
///
/// ```ignore
/// let pkt = RequestBuilder::new(TaskCode::CREDENTIALS)
///     .string("alice")
///     .bytes(b"secret")
///     .string("L1")
///     .unicode("en_US")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    tag: u8,
    task: TaskCode,
    server_id: u32,
    declared_len: Option<u32>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(task: TaskCode) -> Self {
        Self {
            tag: PROTOCOL_TAG,
            task,
            server_id: 0,
            declared_len: None,
            body: Vec::new(),
        }
    }

    pub fn server_id(mut self, id: u32) -> Self {
        self.server_id = id;
        self
    }

    /// Override the protocol tag (for negative tests)
    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    /// Override the declared total length (for negative tests)
    pub fn declared_len(mut self, len: u32) -> Self {
        self.declared_len = Some(len);
        self
    }

    pub fn string(self, s: &str) -> Self {
        self.bytes(s.as_bytes())
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.body.extend_from_slice(&(b.len() as i32).to_be_bytes());
        self.body.extend_from_slice(b);
        self
    }

    /// UTF-16 encoded; the length prefix counts code units
    pub fn unicode(mut self, s: &str) -> Self {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.body.extend_from_slice(&(units.len() as i32).to_be_bytes());
        for u in units {
            self.body.extend_from_slice(&u.to_be_bytes());
        }
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Raw length prefix without content
    pub fn length_prefix(mut self, len: i32) -> Self {
        self.body.extend_from_slice(&len.to_be_bytes());
        self
    }

    /// Raw body bytes
    pub fn raw(mut self, b: &[u8]) -> Self {
        self.body.extend_from_slice(b);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = (HEADER_LEN + self.body.len()) as u32;
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        encode_header(&mut out, self.task, self.server_id, self.declared_len.unwrap_or(total));
        out[OFF_TAG] = self.tag;
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_parse() {
        let pkt = RequestBuilder::new(TaskCode(0x10)).raw(b"abcd").build();
        let p = PacketPrefix::parse(&pkt).unwrap();
        assert_eq!(p.tag, PROTOCOL_TAG);
        assert_eq!(p.level, INTERFACE_LEVEL);
        assert_eq!(p.length as usize, HEADER_LEN + 4);
        assert!(p.check_tag().is_ok());
        assert_eq!(p.check_length(1024).unwrap(), 20);
        assert_eq!(task_code(&pkt), Some(TaskCode(0x10)));
    }

    #[test]
    fn test_prefix_truncated() {
        assert_eq!(
            PacketPrefix::parse(&[PROTOCOL_TAG, 1, 0]),
            Err(FrameError::Truncated { have: 3, need: PREFIX_LEN })
        );
    }

    #[test]
    fn test_length_bounds() {
        let short = PacketPrefix { tag: PROTOCOL_TAG, level: 1, flags: 0, length: 15 };
        assert!(matches!(short.check_length(100), Err(FrameError::LengthOutOfRange { .. })));

        let long = PacketPrefix { length: 101, ..short };
        assert!(long.check_length(100).is_err());
        assert_eq!(PacketPrefix { length: 100, ..short }.check_length(100), Ok(100));
    }

    #[test]
    fn test_bad_tag_first_contact() {
        let pkt = RequestBuilder::new(TaskCode::CREDENTIALS).tag(0x10).raw(&[0; 8]).build();
        let p = PacketPrefix::parse(&pkt).unwrap();
        assert!(matches!(p.check_tag(), Err(FrameError::BadTag { found: 0x10, .. })));
        assert!(p.plausible_first_contact(256));
        assert!(!p.plausible_first_contact(16));
    }

    #[test]
    fn test_error_response_layout() {
        let mut out = vec![0xFF; 3];
        encode_error_response(&mut out, TaskCode(0x42), 7, ResponseStatus::ServerIdMismatch);
        assert_eq!(out.len(), ERROR_RESPONSE_LEN);
        let p = PacketPrefix::parse(&out).unwrap();
        assert_eq!(p.length as usize, ERROR_RESPONSE_LEN);
        assert_eq!(task_code(&out), Some(TaskCode(0x42)));
        assert_eq!(server_id(&out), Some(7));
        assert_eq!(response_status(&out), Some(1002));
        assert_eq!(ResponseStatus::from_code(1002), Some(ResponseStatus::ServerIdMismatch));
    }

    #[test]
    fn test_builder_unicode_units() {
        let pkt = RequestBuilder::new(TaskCode::BEGIN).unicode("h\u{e9}").build();
        // 4-byte count + 2 units * 2 bytes
        assert_eq!(pkt.len(), HEADER_LEN + 4 + 4);
        assert_eq!(&pkt[HEADER_LEN..HEADER_LEN + 4], &2i32.to_be_bytes());
    }

    #[test]
    fn test_task_code_display() {
        assert_eq!(TaskCode::CREDENTIALS.to_string(), "CREDENTIALS");
        assert_eq!(format!("{:?}", TaskCode(0xFF)), "TaskCode(0x00ff)");
        assert!(TaskCode::BEGIN.is_pre_auth());
        assert!(!TaskCode(3).is_pre_auth());
    }
}
