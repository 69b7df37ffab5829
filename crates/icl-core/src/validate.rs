//! Shape validation of pre-authentication requests
//!
//! CREDENTIALS and BEGIN arrive before the client is known, so their
//! variable-length fields are checked against the buffer and against
//! plausible maximum sizes before anything else looks at them. Every read
//! goes through `slice::get`; a malformed request yields an error, never a
//! panic or an out-of-bounds read.

use crate::error::ValidationError;
use crate::frame::{PacketPrefix, TaskCode, HEADER_LEN};

/// Maximum plausible field sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLimits {
    /// Byte length of a `Str` field
    pub max_string_len: usize,
    /// Byte length of a `Bytes` field
    pub max_bytes_len: usize,
    /// UTF-16 unit count of a `Unicode` field
    pub max_unicode_chars: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            max_string_len: 1024,
            max_bytes_len: 65536,
            max_unicode_chars: 1024,
        }
    }
}

/// A validated pre-authentication request, borrowing from the packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedRequest<'a> {
    Credentials {
        user_id: &'a [u8],
        credential: &'a [u8],
        client_level: &'a [u8],
        /// UTF-16 BE code units
        locale: &'a [u8],
    },
    Begin {
        database: &'a [u8],
        user_id: &'a [u8],
        access_mode: u16,
        /// UTF-16 BE code units
        client_name: &'a [u8],
        options: &'a [u8],
    },
}

/// Bounds-checked cursor over the request body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: &'a FieldLimits,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], ValidationError> {
        let end = self.pos.checked_add(n).ok_or(ValidationError::Overrun {
            field,
            len: n,
            remaining: self.remaining(),
        })?;
        let out = self.buf.get(self.pos..end).ok_or(ValidationError::Overrun {
            field,
            len: n,
            remaining: self.remaining(),
        })?;
        self.pos = end;
        Ok(out)
    }

    fn fixed<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ValidationError> {
        if self.remaining() < N {
            return Err(ValidationError::Missing { field });
        }
        let b = self.take(field, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, ValidationError> {
        Ok(u16::from_be_bytes(self.fixed::<2>(field)?))
    }

    fn length(&mut self, field: &'static str) -> Result<usize, ValidationError> {
        let len = i32::from_be_bytes(self.fixed::<4>(field)?);
        if len < 0 {
            return Err(ValidationError::NegativeLength { field, len });
        }
        Ok(len as usize)
    }

    fn counted(
        &mut self,
        field: &'static str,
        limit: usize,
        unit: usize,
    ) -> Result<&'a [u8], ValidationError> {
        let count = self.length(field)?;
        if count > limit {
            return Err(ValidationError::TooLarge { field, len: count, limit });
        }
        let bytes = count.checked_mul(unit).ok_or(ValidationError::TooLarge {
            field,
            len: count,
            limit,
        })?;
        if bytes > self.remaining() {
            return Err(ValidationError::Overrun { field, len: bytes, remaining: self.remaining() });
        }
        self.take(field, bytes)
    }

    fn string(&mut self, field: &'static str) -> Result<&'a [u8], ValidationError> {
        self.counted(field, self.limits.max_string_len, 1)
    }

    fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], ValidationError> {
        self.counted(field, self.limits.max_bytes_len, 1)
    }

    fn unicode(&mut self, field: &'static str) -> Result<&'a [u8], ValidationError> {
        self.counted(field, self.limits.max_unicode_chars, 2)
    }

    fn finish(&self) -> Result<(), ValidationError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ValidationError::TrailingBytes { extra }),
        }
    }
}

/// Validate a complete CREDENTIALS or BEGIN packet (header included)
pub fn validate_request<'a>(
    packet: &'a [u8],
    limits: &'a FieldLimits,
) -> Result<ValidatedRequest<'a>, ValidationError> {
    let prefix = PacketPrefix::parse(packet).map_err(|_| ValidationError::Missing { field: "header" })?;
    if prefix.length as usize != packet.len() {
        return Err(ValidationError::LengthMismatch {
            declared: prefix.length,
            actual: packet.len(),
        });
    }
    let task = crate::frame::task_code(packet).ok_or(ValidationError::Missing { field: "task" })?;
    let body = packet.get(HEADER_LEN..).ok_or(ValidationError::Missing { field: "header" })?;
    let mut r = Reader { buf: body, pos: 0, limits };

    let req = match task {
        TaskCode::CREDENTIALS => ValidatedRequest::Credentials {
            user_id: r.string("user_id")?,
            credential: r.bytes("credential")?,
            client_level: r.string("client_level")?,
            locale: r.unicode("locale")?,
        },
        TaskCode::BEGIN => ValidatedRequest::Begin {
            database: r.string("database")?,
            user_id: r.string("user_id")?,
            access_mode: r.u16("access_mode")?,
            client_name: r.unicode("client_name")?,
            options: r.bytes("options")?,
        },
        other => return Err(ValidationError::NotPreAuth(other.as_u16())),
    };
    r.finish()?;
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RequestBuilder;
    use proptest::prelude::*;

    fn credentials() -> Vec<u8> {
        RequestBuilder::new(TaskCode::CREDENTIALS)
            .string("alice")
            .bytes(b"s3cret")
            .string("L7")
            .unicode("en_US")
            .build()
    }

    fn begin() -> Vec<u8> {
        RequestBuilder::new(TaskCode::BEGIN)
            .string("sales")
            .string("alice")
            .u16(3)
            .unicode("report-tool")
            .bytes(&[1, 2, 3])
            .build()
    }

    #[test]
    fn test_valid_credentials() {
        let pkt = credentials();
        let limits = FieldLimits::default();
        match validate_request(&pkt, &limits).unwrap() {
            ValidatedRequest::Credentials { user_id, credential, client_level, locale } => {
                assert_eq!(user_id, b"alice");
                assert_eq!(credential, b"s3cret");
                assert_eq!(client_level, b"L7");
                assert_eq!(locale.len(), 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_valid_begin() {
        let pkt = begin();
        let limits = FieldLimits::default();
        let req = validate_request(&pkt, &limits).unwrap();
        assert!(matches!(req, ValidatedRequest::Begin { access_mode: 3, .. }));
    }

    #[test]
    fn test_declared_length_mismatch() {
        let mut pkt = credentials();
        pkt.push(0);
        let limits = FieldLimits::default();
        assert!(matches!(
            validate_request(&pkt, &limits),
            Err(ValidationError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_negative_length() {
        let pkt = RequestBuilder::new(TaskCode::CREDENTIALS).length_prefix(-1).build();
        let limits = FieldLimits::default();
        assert_eq!(
            validate_request(&pkt, &limits),
            Err(ValidationError::NegativeLength { field: "user_id", len: -1 })
        );
    }

    #[test]
    fn test_over_limit() {
        let limits = FieldLimits { max_string_len: 4, ..FieldLimits::default() };
        let pkt = credentials();
        assert!(matches!(
            validate_request(&pkt, &limits),
            Err(ValidationError::TooLarge { field: "user_id", len: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_not_pre_auth() {
        let pkt = RequestBuilder::new(TaskCode(9)).build();
        let limits = FieldLimits::default();
        assert_eq!(validate_request(&pkt, &limits), Err(ValidationError::NotPreAuth(9)));
    }

    #[test]
    fn test_trailing_bytes() {
        let pkt = RequestBuilder::new(TaskCode::CREDENTIALS)
            .string("a")
            .bytes(b"")
            .string("")
            .unicode("")
            .raw(&[0, 0])
            .build();
        let limits = FieldLimits::default();
        assert_eq!(
            validate_request(&pkt, &limits),
            Err(ValidationError::TrailingBytes { extra: 2 })
        );
    }

    /// Offsets of every length prefix in `credentials()` / `begin()`
    fn length_offsets(pkt: &[u8], task: TaskCode) -> Vec<usize> {
        let read = |at: usize| i32::from_be_bytes(pkt[at..at + 4].try_into().unwrap()) as usize;
        let mut at = HEADER_LEN;
        let mut out = Vec::new();
        let kinds: &[u8] = if task == TaskCode::CREDENTIALS {
            b"sbsu"
        } else {
            b"ssfub"
        };
        for k in kinds {
            match k {
                b'f' => at += 2,
                b'u' => {
                    out.push(at);
                    at += 4 + 2 * read(at);
                }
                _ => {
                    out.push(at);
                    at += 4 + read(at);
                }
            }
        }
        out
    }

    proptest! {
        #[test]
        fn prop_malformed_sub_length_rejected(
            use_begin in any::<bool>(),
            which in 0usize..5,
            kind in 0u8..4,
            delta in 1i32..10_000,
        ) {
            let (mut pkt, task) = if use_begin {
                (begin(), TaskCode::BEGIN)
            } else {
                (credentials(), TaskCode::CREDENTIALS)
            };
            let offsets = length_offsets(&pkt, task);
            let at = offsets[which % offsets.len()];
            let orig = i32::from_be_bytes(pkt[at..at + 4].try_into().unwrap());
            let remaining = (pkt.len() - at - 4) as i32;
            let bad = match kind {
                0 => -delta,
                1 => remaining + delta,
                2 => i32::MAX - delta,
                _ => (orig - delta).max(0),
            };
            prop_assume!(bad != orig);
            pkt[at..at + 4].copy_from_slice(&bad.to_be_bytes());
            let limits = FieldLimits::default();
            prop_assert!(validate_request(&pkt, &limits).is_err());
        }

        #[test]
        fn prop_arbitrary_body_never_panics(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            use_begin in any::<bool>(),
        ) {
            let task = if use_begin { TaskCode::BEGIN } else { TaskCode::CREDENTIALS };
            let pkt = RequestBuilder::new(task).raw(&body).build();
            let limits = FieldLimits::default();
            let _ = validate_request(&pkt, &limits);
        }

        #[test]
        fn prop_truncated_packet_rejected(cut in 1usize..20) {
            let pkt = credentials();
            let cut = cut.min(pkt.len() - 1);
            let short = &pkt[..pkt.len() - cut];
            let limits = FieldLimits::default();
            prop_assert!(validate_request(short, &limits).is_err());
        }
    }
}
