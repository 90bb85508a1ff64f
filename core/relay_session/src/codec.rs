//! Wire codec for the relay control protocol
//!
//! Frame layout:
//!
//! ```text
//! +----------------+-------------+--------------------------------+
//! | length u32 BE  | tag u16 BE  | type-specific fields           |
//! +----------------+-------------+--------------------------------+
//!                  |<-------------- length bytes --------------->|
//! ```
//!
//! Variable-length fields are `[u32 BE length][bytes]`. The relay is
//! big-endian by definition, so every integer is read through
//! `from_be_bytes` whatever the host order is.

use crate::error::{DecodeError, EncodeError};

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (4 bytes for body length)
pub const HEADER_LEN: usize = 4;

/// Largest frame body accepted in either direction (1 MiB)
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Capacity of identifier fields (account, device, cloud, address, status)
pub const MAX_ID_LEN: usize = 255;

/// Capacity of the routing token carried by MESSAGE_TO_SET / MESSAGE_FROM
pub const MAX_TOKEN_LEN: usize = 1024;

/// Capacity of packed lists and opaque message bodies (64 KiB)
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

// ============================================================================
// Message Types
// ============================================================================

/// Numeric type tags understood by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    AccountLogin = 1,
    AccountLoginReply = 2,
    DevicePair = 3,
    DevicePairReply = 4,
    MessageToSet = 5,
    MessageToSetReply = 6,
    MessageFrom = 7,
    OfflineSet = 8,
    TrafficGet = 9,
    TrafficGetReply = 10,
    TrafficMi = 11,
    AccountSet = 12,
    AccountSetReply = 13,
    AccountExists = 14,
    AccountExistsReply = 15,
}

impl MessageType {
    /// Map a wire tag to a known type
    pub fn from_tag(tag: u16) -> Option<Self> {
        let ty = match tag {
            1 => MessageType::AccountLogin,
            2 => MessageType::AccountLoginReply,
            3 => MessageType::DevicePair,
            4 => MessageType::DevicePairReply,
            5 => MessageType::MessageToSet,
            6 => MessageType::MessageToSetReply,
            7 => MessageType::MessageFrom,
            8 => MessageType::OfflineSet,
            9 => MessageType::TrafficGet,
            10 => MessageType::TrafficGetReply,
            11 => MessageType::TrafficMi,
            12 => MessageType::AccountSet,
            13 => MessageType::AccountSetReply,
            14 => MessageType::AccountExists,
            15 => MessageType::AccountExistsReply,
            _ => return None,
        };
        Some(ty)
    }

    pub fn tag(self) -> u16 {
        self as u16
    }
}

/// How a pairing came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PairKind {
    /// Requested by this client for a configured tunnel
    #[default]
    Normal,
    /// Assigned by the relay without a matching configured tunnel
    Forced,
}

impl PairKind {
    fn to_wire(self) -> u8 {
        match self {
            PairKind::Normal => 0,
            PairKind::Forced => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(PairKind::Normal),
            1 => Ok(PairKind::Forced),
            other => Err(DecodeError::InvalidField {
                field: "pair_kind",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A decoded or to-be-encoded control message
///
/// String and byte fields borrow from the frame they were decoded from, so a
/// decoded message cannot outlive its receive buffer. Anything that must be
/// kept (a pairing id, say) has to be copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    AccountLogin {
        username: &'a str,
        password: &'a str,
        device: &'a str,
    },
    AccountLoginReply {
        error: &'a str,
    },
    DevicePair {
        cloud: &'a str,
        device: &'a str,
        local_port: u16,
        remote_port: u16,
        pair_kind: PairKind,
    },
    DevicePairReply {
        error: &'a str,
        cloud: &'a str,
        pair_kind: PairKind,
        list: &'a [u8],
    },
    MessageToSet {
        to_cloud: &'a str,
        to_device: &'a str,
        to_address: &'a str,
        tp: &'a str,
        body: &'a [u8],
    },
    MessageToSetReply {
        error: &'a str,
    },
    MessageFrom {
        from_cloud: &'a str,
        from_device: &'a str,
        from_address: &'a str,
        tp: &'a str,
        body: &'a [u8],
    },
    OfflineSet {
        cloud: &'a str,
        device: &'a str,
        address: &'a str,
    },
    TrafficGet {
        cloud: &'a str,
    },
    TrafficGetReply {
        error: &'a str,
        list: &'a [u8],
    },
    TrafficMi {
        cloud: &'a str,
        device: &'a str,
        upload: u64,
        download: u64,
    },
    AccountSet {
        email: &'a str,
        password: &'a str,
    },
    AccountSetReply {
        error: &'a str,
    },
    AccountExists {
        email: &'a str,
    },
    AccountExistsReply {
        error: &'a str,
    },
    /// Tag this client does not know; payload is not interpreted
    Unknown {
        tag: u16,
    },
}

impl Message<'_> {
    /// Wire tag of this message
    pub fn tag(&self) -> u16 {
        match self {
            Message::Unknown { tag } => *tag,
            known => known.message_type().map_or(0, MessageType::tag),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        let ty = match self {
            Message::AccountLogin { .. } => MessageType::AccountLogin,
            Message::AccountLoginReply { .. } => MessageType::AccountLoginReply,
            Message::DevicePair { .. } => MessageType::DevicePair,
            Message::DevicePairReply { .. } => MessageType::DevicePairReply,
            Message::MessageToSet { .. } => MessageType::MessageToSet,
            Message::MessageToSetReply { .. } => MessageType::MessageToSetReply,
            Message::MessageFrom { .. } => MessageType::MessageFrom,
            Message::OfflineSet { .. } => MessageType::OfflineSet,
            Message::TrafficGet { .. } => MessageType::TrafficGet,
            Message::TrafficGetReply { .. } => MessageType::TrafficGetReply,
            Message::TrafficMi { .. } => MessageType::TrafficMi,
            Message::AccountSet { .. } => MessageType::AccountSet,
            Message::AccountSetReply { .. } => MessageType::AccountSetReply,
            Message::AccountExists { .. } => MessageType::AccountExists,
            Message::AccountExistsReply { .. } => MessageType::AccountExistsReply,
            Message::Unknown { tag } => return MessageType::from_tag(*tag),
        };
        Some(ty)
    }
}

// ============================================================================
// Byte Order
// ============================================================================

/// Relay-order (big-endian) u32 to host order
pub fn be_u32(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

// ============================================================================
// Encoding
// ============================================================================

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0u8; HEADER_LEN]);
        buf.extend_from_slice(&tag.to_be_bytes());
        Writer { buf }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, field: &'static str, value: &[u8], max: usize) -> Result<(), EncodeError> {
        if value.len() > max {
            return Err(EncodeError::FieldTooLong {
                field,
                len: value.len(),
                max,
            });
        }
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn put_str(&mut self, field: &'static str, value: &str, max: usize) -> Result<(), EncodeError> {
        self.put_bytes(field, value.as_bytes(), max)
    }

    fn finish(mut self) -> Result<Vec<u8>, EncodeError> {
        let body = self.buf.len() - HEADER_LEN;
        if body > MAX_FRAME_LEN {
            return Err(EncodeError::FrameTooLarge(body));
        }
        self.buf[..HEADER_LEN].copy_from_slice(&(body as u32).to_be_bytes());
        Ok(self.buf)
    }
}

/// Serialize a message into a complete frame (header included)
pub fn encode(msg: &Message<'_>) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new(msg.tag());

    match *msg {
        Message::AccountLogin {
            username,
            password,
            device,
        } => {
            w.put_str("username", username, MAX_ID_LEN)?;
            w.put_str("password", password, MAX_ID_LEN)?;
            w.put_str("device", device, MAX_ID_LEN)?;
        }
        Message::AccountLoginReply { error }
        | Message::MessageToSetReply { error }
        | Message::AccountSetReply { error }
        | Message::AccountExistsReply { error } => {
            w.put_str("error", error, MAX_ID_LEN)?;
        }
        Message::DevicePair {
            cloud,
            device,
            local_port,
            remote_port,
            pair_kind,
        } => {
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
            w.put_str("device", device, MAX_ID_LEN)?;
            w.put_u16(local_port);
            w.put_u16(remote_port);
            w.put_u8(pair_kind.to_wire());
        }
        Message::DevicePairReply {
            error,
            cloud,
            pair_kind,
            list,
        } => {
            w.put_str("error", error, MAX_ID_LEN)?;
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
            w.put_u8(pair_kind.to_wire());
            w.put_bytes("list", list, MAX_PAYLOAD_LEN)?;
        }
        Message::MessageToSet {
            to_cloud: cloud,
            to_device: device,
            to_address: address,
            tp,
            body,
        }
        | Message::MessageFrom {
            from_cloud: cloud,
            from_device: device,
            from_address: address,
            tp,
            body,
        } => {
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
            w.put_str("device", device, MAX_ID_LEN)?;
            w.put_str("address", address, MAX_ID_LEN)?;
            w.put_str("tp", tp, MAX_TOKEN_LEN)?;
            w.put_bytes("body", body, MAX_PAYLOAD_LEN)?;
        }
        Message::OfflineSet {
            cloud,
            device,
            address,
        } => {
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
            w.put_str("device", device, MAX_ID_LEN)?;
            w.put_str("address", address, MAX_ID_LEN)?;
        }
        Message::TrafficGet { cloud } => {
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
        }
        Message::TrafficGetReply { error, list } => {
            w.put_str("error", error, MAX_ID_LEN)?;
            w.put_bytes("list", list, MAX_PAYLOAD_LEN)?;
        }
        Message::TrafficMi {
            cloud,
            device,
            upload,
            download,
        } => {
            w.put_str("cloud", cloud, MAX_ID_LEN)?;
            w.put_str("device", device, MAX_ID_LEN)?;
            w.put_u64(upload);
            w.put_u64(download);
        }
        Message::AccountSet { email, password } => {
            w.put_str("email", email, MAX_ID_LEN)?;
            w.put_str("password", password, MAX_ID_LEN)?;
        }
        Message::AccountExists { email } => {
            w.put_str("email", email, MAX_ID_LEN)?;
        }
        Message::Unknown { .. } => {}
    }

    w.finish()
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked cursor over a frame body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                field,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.array::<1>(field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = be_u32(self.array(field)?) as usize;
        self.take(field, len)
    }

    fn str(&mut self, field: &'static str) -> Result<&'a str, DecodeError> {
        let raw = self.bytes(field)?;
        std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            rest => Err(DecodeError::TrailingBytes(rest)),
        }
    }
}

/// Decode one complete frame (header included)
///
/// Unknown tags decode to [`Message::Unknown`] so the caller can log and
/// drop them; only malformed frames are errors.
pub fn decode(frame: &[u8]) -> Result<Message<'_>, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            field: "frame header",
            needed: HEADER_LEN,
            available: frame.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let declared = be_u32(header) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(declared));
    }
    let actual = frame.len() - HEADER_LEN;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual });
    }

    let mut r = Reader::new(&frame[HEADER_LEN..]);
    let tag = r.u16("type tag")?;
    let Some(ty) = MessageType::from_tag(tag) else {
        return Ok(Message::Unknown { tag });
    };

    let msg = match ty {
        MessageType::AccountLogin => Message::AccountLogin {
            username: r.str("username")?,
            password: r.str("password")?,
            device: r.str("device")?,
        },
        MessageType::AccountLoginReply => Message::AccountLoginReply {
            error: r.str("error")?,
        },
        MessageType::DevicePair => Message::DevicePair {
            cloud: r.str("cloud")?,
            device: r.str("device")?,
            local_port: r.u16("local_port")?,
            remote_port: r.u16("remote_port")?,
            pair_kind: PairKind::from_wire(r.u8("pair_kind")?)?,
        },
        MessageType::DevicePairReply => Message::DevicePairReply {
            error: r.str("error")?,
            cloud: r.str("cloud")?,
            pair_kind: PairKind::from_wire(r.u8("pair_kind")?)?,
            list: r.bytes("list")?,
        },
        MessageType::MessageToSet => Message::MessageToSet {
            to_cloud: r.str("cloud")?,
            to_device: r.str("device")?,
            to_address: r.str("address")?,
            tp: r.str("tp")?,
            body: r.bytes("body")?,
        },
        MessageType::MessageToSetReply => Message::MessageToSetReply {
            error: r.str("error")?,
        },
        MessageType::MessageFrom => Message::MessageFrom {
            from_cloud: r.str("cloud")?,
            from_device: r.str("device")?,
            from_address: r.str("address")?,
            tp: r.str("tp")?,
            body: r.bytes("body")?,
        },
        MessageType::OfflineSet => Message::OfflineSet {
            cloud: r.str("cloud")?,
            device: r.str("device")?,
            address: r.str("address")?,
        },
        MessageType::TrafficGet => Message::TrafficGet {
            cloud: r.str("cloud")?,
        },
        MessageType::TrafficGetReply => Message::TrafficGetReply {
            error: r.str("error")?,
            list: r.bytes("list")?,
        },
        MessageType::TrafficMi => Message::TrafficMi {
            cloud: r.str("cloud")?,
            device: r.str("device")?,
            upload: r.u64("upload")?,
            download: r.u64("download")?,
        },
        MessageType::AccountSet => Message::AccountSet {
            email: r.str("email")?,
            password: r.str("password")?,
        },
        MessageType::AccountSetReply => Message::AccountSetReply {
            error: r.str("error")?,
        },
        MessageType::AccountExists => Message::AccountExists {
            email: r.str("email")?,
        },
        MessageType::AccountExistsReply => Message::AccountExistsReply {
            error: r.str("error")?,
        },
    };

    r.finish()?;
    Ok(msg)
}

// ============================================================================
// Packed Lists
// ============================================================================

/// Iterator over the `(length u32 BE, bytes)` fields of a packed list
pub struct ListFields<'a> {
    list: &'a [u8],
    pos: usize,
}

/// Walk a packed list field by field
pub fn list_fields(list: &[u8]) -> ListFields<'_> {
    ListFields { list, pos: 0 }
}

impl<'a> Iterator for ListFields<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.list[self.pos..];
        if rest.is_empty() {
            return None;
        }

        // Any error ends the walk
        self.pos = self.list.len();

        if rest.len() < 4 {
            return Some(Err(DecodeError::MalformedList(format!(
                "{} bytes left, length prefix needs 4",
                rest.len()
            ))));
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&rest[..4]);
        let len = be_u32(prefix) as usize;
        if rest.len() - 4 < len {
            return Some(Err(DecodeError::MalformedList(format!(
                "field declares {} bytes, {} left",
                len,
                rest.len() - 4
            ))));
        }

        self.pos = self.list.len() - rest.len() + 4 + len;
        Some(Ok(&rest[4..4 + len]))
    }
}

/// Build a packed list from raw fields
pub fn pack_list<'a, I>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

// ============================================================================
// Stream Reassembly
// ============================================================================

/// Receive buffer that splits a byte stream into frames
///
/// Frames come out in arrival order. A returned frame borrows the buffer;
/// it is only valid until the next call on the buffer.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    consumed: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the connection
    pub fn extend(&mut self, data: &[u8]) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, header included
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, DecodeError> {
        let pending = &self.buf[self.consumed..];
        if pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&pending[..HEADER_LEN]);
        let declared = be_u32(header) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(declared));
        }

        let total = HEADER_LEN + declared;
        if pending.len() < total {
            return Ok(None);
        }

        let start = self.consumed;
        self.consumed += total;
        Ok(Some(&self.buf[start..start + total]))
    }

    /// Bytes received but not yet returned as a frame
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.consumed = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message<'_>) {
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let list = pack_list([
            b"pid-1".as_slice(),
            b"dev".as_slice(),
            b"8080".as_slice(),
            b"80".as_slice(),
        ]);
        roundtrip(Message::AccountLogin {
            username: "alice",
            password: "secret",
            device: "laptop",
        });
        roundtrip(Message::AccountLoginReply { error: "ok" });
        roundtrip(Message::DevicePair {
            cloud: "alice",
            device: "pi",
            local_port: 2222,
            remote_port: 22,
            pair_kind: PairKind::Normal,
        });
        roundtrip(Message::DevicePairReply {
            error: "ok",
            cloud: "alice",
            pair_kind: PairKind::Forced,
            list: &list,
        });
        roundtrip(Message::MessageToSet {
            to_cloud: "alice",
            to_device: "pi",
            to_address: "10.0.0.1:4000",
            tp: "tunnel_response/pid-1/22/ok",
            body: b"",
        });
        roundtrip(Message::MessageToSetReply { error: "ok" });
        roundtrip(Message::MessageFrom {
            from_cloud: "alice",
            from_device: "pi",
            from_address: "10.0.0.1:4000",
            tp: "tunnel_request/pid-1/22",
            body: b"\x00\x01",
        });
        roundtrip(Message::OfflineSet {
            cloud: "alice",
            device: "pi",
            address: "",
        });
        roundtrip(Message::TrafficGet { cloud: "alice" });
        roundtrip(Message::TrafficGetReply {
            error: "ok",
            list: &list,
        });
        roundtrip(Message::TrafficMi {
            cloud: "alice",
            device: "pi",
            upload: u64::MAX,
            download: 7,
        });
        roundtrip(Message::AccountSet {
            email: "a@example.com",
            password: "pw",
        });
        roundtrip(Message::AccountSetReply { error: "ok" });
        roundtrip(Message::AccountExists {
            email: "a@example.com",
        });
        roundtrip(Message::AccountExistsReply { error: "exists" });
        roundtrip(Message::Unknown { tag: 999 });
    }

    #[test]
    fn test_header_is_big_endian_body_length() {
        let frame = encode(&Message::AccountLoginReply { error: "ok" }).unwrap();
        // tag(2) + len(4) + "ok"(2)
        assert_eq!(&frame[..4], &[0, 0, 0, 8]);
        assert_eq!(&frame[4..6], &[0, 2]);
        assert_eq!(&frame[6..10], &[0, 0, 0, 2]);
        assert_eq!(&frame[10..], b"ok");
    }

    #[test]
    fn test_encode_rejects_oversized_field() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        let err = encode(&Message::AccountExists { email: &long }).unwrap_err();
        assert_eq!(
            err,
            EncodeError::FieldTooLong {
                field: "email",
                len: MAX_ID_LEN + 1,
                max: MAX_ID_LEN,
            }
        );
    }

    #[test]
    fn test_decode_unknown_tag_is_not_an_error() {
        let frame = [0, 0, 0, 5, 0x01, 0x00, 0xde, 0xad, 0xbe];
        assert_eq!(decode(&frame).unwrap(), Message::Unknown { tag: 256 });
    }

    #[test]
    fn test_decode_truncated_field() {
        // AccountLoginReply whose error field claims 10 bytes but carries 2
        let frame = [0, 0, 0, 8, 0, 2, 0, 0, 0, 10, b'o', b'k'];
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::Truncated { field: "error", needed: 10, available: 2 })
        ));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut frame = encode(&Message::AccountLoginReply { error: "ok" }).unwrap();
        frame.push(0);
        assert_eq!(
            decode(&frame),
            Err(DecodeError::LengthMismatch {
                declared: 8,
                actual: 9
            })
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        // Valid AccountLoginReply body followed by one stray byte, header counts it
        let frame = [0, 0, 0, 9, 0, 2, 0, 0, 0, 2, b'o', b'k', 0xff];
        assert_eq!(decode(&frame), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_rejects_bad_utf8() {
        let frame = [0, 0, 0, 7, 0, 2, 0, 0, 0, 1, 0xff];
        assert_eq!(decode(&frame), Err(DecodeError::InvalidUtf8("error")));
    }

    #[test]
    fn test_list_fields_walks_big_endian_prefixes() {
        // 0x00000003 must read as 3 on any host; little-endian would be 50331648
        let list = [0, 0, 0, 3, b'a', b'b', b'c', 0, 0, 0, 0, 0, 0, 0, 1, b'z'];
        let fields: Vec<&[u8]> = list_fields(&list).collect::<Result<_, _>>().unwrap();
        assert_eq!(fields, vec![b"abc".as_slice(), b"".as_slice(), b"z".as_slice()]);
    }

    #[test]
    fn test_list_fields_rejects_partial_record() {
        let list = [0, 0, 0, 3, b'a', b'b', b'c', 0, 0];
        let result: Result<Vec<&[u8]>, _> = list_fields(&list).collect();
        assert!(matches!(result, Err(DecodeError::MalformedList(_))));

        let list = [0, 0, 0, 9, b'a'];
        let result: Result<Vec<&[u8]>, _> = list_fields(&list).collect();
        assert!(matches!(result, Err(DecodeError::MalformedList(_))));
    }

    #[test]
    fn test_frame_buffer_reassembles_split_frames() {
        let a = encode(&Message::AccountLoginReply { error: "ok" }).unwrap();
        let b = encode(&Message::OfflineSet {
            cloud: "c",
            device: "d",
            address: "x",
        })
        .unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut buf = FrameBuffer::new();
        buf.extend(&stream[..3]);
        assert_eq!(buf.next_frame().unwrap(), None);

        buf.extend(&stream[3..a.len() + 5]);
        assert_eq!(buf.next_frame().unwrap(), Some(a.as_slice()));
        assert_eq!(buf.next_frame().unwrap(), None);

        buf.extend(&stream[a.len() + 5..]);
        assert_eq!(buf.next_frame().unwrap(), Some(b.as_slice()));
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_rejects_huge_header() {
        let mut buf = FrameBuffer::new();
        buf.extend(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(buf.next_frame(), Err(DecodeError::FrameTooLarge(_))));
    }
}
