//! Binary wire codec for [`SyncMessage`]
//!
//! Layout: `[tag: u8][fields...]`. Integers are big-endian `i64`, strings are
//! a big-endian `u16` byte length followed by UTF-8. Every message must fit in
//! [`MAX_MESSAGE_SIZE`] bytes and carry a sender id of at most
//! [`MAX_SENDER_ID_LEN`] bytes.

use crate::error::{EncodingLimit, Malformed, Result};
use crate::types::SyncMessage;

/// Channel identifier shared by every node, relay, and client
pub const CHANNEL: &str = "timesync:clock";

/// Upper bound on an encoded message
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Upper bound on a sender id, in bytes
pub const MAX_SENDER_ID_LEN: usize = 64;

const TAG_MASTER_TIME_UPDATE: u8 = 0;
const TAG_TIME_REQUEST: u8 = 1;
const TAG_TIME_RESPONSE: u8 = 2;
const TAG_DRIFT_REPORT: u8 = 3;
const TAG_HEARTBEAT: u8 = 4;

impl SyncMessage {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = WireWriter::with_capacity(64);

        match self {
            SyncMessage::MasterTimeUpdate { master_time_ms } => {
                out.put_u8(TAG_MASTER_TIME_UPDATE);
                out.put_i64(*master_time_ms);
            }
            SyncMessage::TimeRequest {
                sender_id,
                local_time_ms,
            } => {
                check_sender_id(sender_id)?;
                out.put_u8(TAG_TIME_REQUEST);
                out.put_str(sender_id);
                out.put_i64(*local_time_ms);
            }
            SyncMessage::TimeResponse {
                sender_id,
                master_time_ms,
                original_request_time_ms,
            } => {
                check_sender_id(sender_id)?;
                out.put_u8(TAG_TIME_RESPONSE);
                out.put_str(sender_id);
                out.put_i64(*master_time_ms);
                out.put_i64(*original_request_time_ms);
            }
            SyncMessage::DriftReport {
                sender_id,
                local_time_ms,
                estimated_master_time_ms,
                drift_ms,
            } => {
                check_sender_id(sender_id)?;
                out.put_u8(TAG_DRIFT_REPORT);
                out.put_str(sender_id);
                out.put_i64(*local_time_ms);
                out.put_i64(*estimated_master_time_ms);
                out.put_i64(*drift_ms);
            }
            SyncMessage::Heartbeat => out.put_u8(TAG_HEARTBEAT),
        }

        let bytes = out.finish();
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(EncodingLimit::MessageTooLarge(bytes.len()).into());
        }
        Ok(bytes)
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Malformed::Empty.into());
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Malformed::Oversized(data.len()).into());
        }

        let mut input = WireReader::new(data);
        let message = match input.u8()? {
            TAG_MASTER_TIME_UPDATE => SyncMessage::MasterTimeUpdate {
                master_time_ms: input.i64()?,
            },
            TAG_TIME_REQUEST => SyncMessage::TimeRequest {
                sender_id: input.sender_id()?,
                local_time_ms: input.i64()?,
            },
            TAG_TIME_RESPONSE => SyncMessage::TimeResponse {
                sender_id: input.sender_id()?,
                master_time_ms: input.i64()?,
                original_request_time_ms: input.i64()?,
            },
            TAG_DRIFT_REPORT => SyncMessage::DriftReport {
                sender_id: input.sender_id()?,
                local_time_ms: input.i64()?,
                estimated_master_time_ms: input.i64()?,
                drift_ms: input.i64()?,
            },
            TAG_HEARTBEAT => SyncMessage::Heartbeat,
            tag => return Err(Malformed::UnknownTag(tag).into()),
        };

        input.finish()?;
        Ok(message)
    }
}

/// First text frame a peer sends after connecting: `"<CHANNEL> <id>"`
pub fn handshake(id: &str) -> String {
    format!("{} {}", CHANNEL, id)
}

/// Extract the peer id from a handshake frame
pub fn parse_handshake(text: &str) -> Option<&str> {
    let id = text.strip_prefix(CHANNEL)?.strip_prefix(' ')?;
    is_valid_sender_id(id).then_some(id)
}

/// Non-blank and at most [`MAX_SENDER_ID_LEN`] bytes
pub fn is_valid_sender_id(sender_id: &str) -> bool {
    !sender_id.trim().is_empty() && sender_id.len() <= MAX_SENDER_ID_LEN
}

fn check_sender_id(sender_id: &str) -> Result<()> {
    if sender_id.trim().is_empty() {
        return Err(EncodingLimit::BlankSenderId.into());
    }
    if sender_id.len() > MAX_SENDER_ID_LEN {
        return Err(EncodingLimit::SenderIdTooLong(sender_id.len()).into());
    }
    Ok(())
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    // Callers validate the length first; sender ids are far below u16::MAX.
    fn put_str(&mut self, value: &str) {
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], Malformed> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(Malformed::Truncated {
                needed: len,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, Malformed> {
        Ok(self.take(1)?[0])
    }

    fn i64(&mut self) -> std::result::Result<i64, Malformed> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn string(&mut self) -> std::result::Result<String, Malformed> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        let len = u16::from_be_bytes(raw) as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Malformed::InvalidUtf8)
    }

    fn sender_id(&mut self) -> std::result::Result<String, Malformed> {
        let id = self.string()?;
        if !is_valid_sender_id(&id) {
            return Err(Malformed::InvalidSenderId);
        }
        Ok(id)
    }

    fn finish(self) -> std::result::Result<(), Malformed> {
        let trailing = self.data.len() - self.pos;
        if trailing > 0 {
            return Err(Malformed::TrailingBytes(trailing));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn all_variants() -> Vec<SyncMessage> {
        vec![
            SyncMessage::MasterTimeUpdate {
                master_time_ms: 1_000_000,
            },
            SyncMessage::TimeRequest {
                sender_id: "lobby".to_string(),
                local_time_ms: 500,
            },
            SyncMessage::TimeResponse {
                sender_id: "lobby".to_string(),
                master_time_ms: 900,
                original_request_time_ms: 500,
            },
            SyncMessage::DriftReport {
                sender_id: "survival-2".to_string(),
                local_time_ms: 999_900,
                estimated_master_time_ms: 1_000_020,
                drift_ms: -120,
            },
            SyncMessage::Heartbeat,
        ]
    }

    #[test]
    fn test_round_trip_all_variants() {
        for message in all_variants() {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_master_time_update_layout() {
        let bytes = SyncMessage::MasterTimeUpdate { master_time_ms: 1 }
            .to_bytes()
            .unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_time_request_layout_is_big_endian() {
        let bytes = SyncMessage::TimeRequest {
            sender_id: "ab".to_string(),
            local_time_ms: 258,
        }
        .to_bytes()
        .unwrap();
        assert_eq!(bytes, vec![1, 0, 2, b'a', b'b', 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_encode_rejects_bad_sender_ids() {
        let empty = SyncMessage::TimeRequest {
            sender_id: String::new(),
            local_time_ms: 0,
        };
        assert_eq!(
            empty.to_bytes(),
            Err(SyncError::EncodingLimitExceeded(EncodingLimit::BlankSenderId))
        );

        let blank = SyncMessage::TimeRequest {
            sender_id: "   ".to_string(),
            local_time_ms: 0,
        };
        assert_eq!(
            blank.to_bytes(),
            Err(SyncError::EncodingLimitExceeded(EncodingLimit::BlankSenderId))
        );

        let long = SyncMessage::DriftReport {
            sender_id: "x".repeat(65),
            local_time_ms: 0,
            estimated_master_time_ms: 0,
            drift_ms: 0,
        };
        assert_eq!(
            long.to_bytes(),
            Err(SyncError::EncodingLimitExceeded(
                EncodingLimit::SenderIdTooLong(65)
            ))
        );

        let max = SyncMessage::TimeRequest {
            sender_id: "x".repeat(64),
            local_time_ms: 0,
        };
        assert!(max.to_bytes().is_ok());
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let cases: Vec<(Vec<u8>, Malformed)> = vec![
            (vec![], Malformed::Empty),
            (vec![9, 1, 2], Malformed::UnknownTag(9)),
            (
                vec![0, 1, 2, 3],
                Malformed::Truncated {
                    needed: 8,
                    remaining: 3,
                },
            ),
            (vec![1, 0, 2, 0xff, 0xfe, 0, 0, 0, 0, 0, 0, 0, 1], Malformed::InvalidUtf8),
            (vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], Malformed::InvalidSenderId),
            (vec![4, 0], Malformed::TrailingBytes(1)),
        ];

        for (bytes, expected) in cases {
            assert_eq!(
                SyncMessage::from_bytes(&bytes),
                Err(SyncError::MalformedMessage(expected))
            );
        }
    }

    #[test]
    fn test_decode_rejects_oversized_buffer() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            SyncMessage::from_bytes(&bytes),
            Err(SyncError::MalformedMessage(Malformed::Oversized(
                MAX_MESSAGE_SIZE + 1
            )))
        );
    }

    #[test]
    fn test_handshake() {
        assert_eq!(parse_handshake(&handshake("lobby")), Some("lobby"));
        assert_eq!(parse_handshake("timesync:clock "), None);
        assert_eq!(parse_handshake("other:channel lobby"), None);
        assert_eq!(parse_handshake(&handshake(&"x".repeat(65))), None);
    }

    #[test]
    fn test_decode_rejects_overlong_sender_id() {
        let mut bytes = vec![TAG_TIME_REQUEST, 0, 65];
        bytes.extend(std::iter::repeat(b'x').take(65));
        bytes.extend_from_slice(&0i64.to_be_bytes());
        assert_eq!(
            SyncMessage::from_bytes(&bytes),
            Err(SyncError::MalformedMessage(Malformed::InvalidSenderId))
        );
    }
}
