//! The in-memory message model: header, metadata, payload, and the optional
//! error block carried by `ERROR` messages. This is the unit every
//! serializer and transport passes around; it owns no transport state.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::crc32::crc32;

/// Fixed header size on the wire (56 bytes, see spec §3/§6).
pub const HEADER_SIZE: usize = 56;

/// Maximum total message size, header included (16 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum payload size after the header is accounted for.
pub const MAX_PAYLOAD_SIZE: u32 = MAX_MESSAGE_SIZE - HEADER_SIZE as u32;

/// The only protocol version this crate understands.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default call/request timeout, matching the original's constant.
pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;

/// Primary message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
    Event = 0x03,
    Error = 0x04,
    Heartbeat = 0x05,
    Control = 0x06,
    Unknown = 0xFF,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => MessageType::Request,
            0x02 => MessageType::Response,
            0x03 => MessageType::Event,
            0x04 => MessageType::Error,
            0x05 => MessageType::Heartbeat,
            0x06 => MessageType::Control,
            _ => MessageType::Unknown,
        }
    }
}

/// Scheduling priority hint. Carried on the wire but not interpreted by the
/// transports in this crate -- consumers may use it to prioritize handler
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl MessagePriority {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => MessagePriority::Low,
            2 => MessagePriority::High,
            3 => MessagePriority::Critical,
            _ => MessagePriority::Normal,
        }
    }
}

/// Lifecycle status, used by callers tracking a message outside the wire
/// protocol itself (e.g. proxy-side statistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageStatus {
    Created = 0,
    Queued = 1,
    Sent = 2,
    Delivered = 3,
    Processed = 4,
    SendFailed = 100,
    DeliveryFailed = 101,
    ProcessingFailed = 102,
    Timeout = 103,
    Rejected = 104,
    InvalidFormat = 105,
    SizeExceeded = 106,
}

/// Wire serialization format selector, carried in the header's `format`
/// byte so a receiver can dispatch to the matching codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializationFormat {
    Binary = 0x01,
    Json = 0x02,
    Protobuf = 0x03,
    MessagePack = 0x04,
    Custom = 0xFF,
}

impl SerializationFormat {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => SerializationFormat::Binary,
            0x02 => SerializationFormat::Json,
            0x03 => SerializationFormat::Protobuf,
            0x04 => SerializationFormat::MessagePack,
            _ => SerializationFormat::Custom,
        }
    }
}

/// Bitset of header flags. A thin `u32` newtype rather than a full enum,
/// since flags combine freely (`flags |= COMPRESSED | ORDERED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(pub u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0x0000_0000);
    pub const REQUIRE_ACK: MessageFlags = MessageFlags(0x0000_0001);
    pub const COMPRESSED: MessageFlags = MessageFlags(0x0000_0002);
    pub const ENCRYPTED: MessageFlags = MessageFlags(0x0000_0004);
    pub const FRAGMENTED: MessageFlags = MessageFlags(0x0000_0008);
    pub const LAST_FRAGMENT: MessageFlags = MessageFlags(0x0000_0010);
    pub const PERSISTENT: MessageFlags = MessageFlags(0x0000_0020);
    pub const ORDERED: MessageFlags = MessageFlags(0x0000_0040);
    pub const EXPIRES: MessageFlags = MessageFlags(0x0000_0080);

    pub fn has(&self, flag: MessageFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: MessageFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: MessageFlags) {
        self.0 &= !flag.0;
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Fixed 56-byte header. See spec §6 for the exact byte layout this must
/// serialize to/from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: u64,
    pub msg_type: MessageType,
    pub priority: MessagePriority,
    pub format: SerializationFormat,
    pub version: u8,
    pub flags: MessageFlags,
    pub payload_size: u32,
    pub checksum: u32,
}

impl MessageHeader {
    fn new(msg_type: MessageType, format: SerializationFormat) -> Self {
        MessageHeader {
            message_id: Uuid::new_v4(),
            correlation_id: Uuid::nil(),
            timestamp: now_micros(),
            msg_type,
            priority: MessagePriority::Normal,
            format,
            version: PROTOCOL_VERSION,
            flags: MessageFlags::NONE,
            payload_size: 0,
            checksum: 0,
        }
    }

    pub fn has_flag(&self, flag: MessageFlags) -> bool {
        self.flags.has(flag)
    }

    pub fn set_flag(&mut self, flag: MessageFlags) {
        self.flags.set(flag)
    }

    pub fn clear_flag(&mut self, flag: MessageFlags) {
        self.flags.clear(flag)
    }

    /// Structural validation only -- does not touch the checksum, see
    /// `Message::verify_checksum` for that.
    pub fn validate(&self) -> bool {
        self.version == PROTOCOL_VERSION
            && self.msg_type != MessageType::Unknown
            && self.payload_size <= MAX_PAYLOAD_SIZE
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Variable-length metadata carried after the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub source_endpoint: String,
    pub destination_endpoint: String,
    pub subject: String,
    pub content_type: String,
    pub expiration: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl MessageMetadata {
    pub fn is_expired(&self) -> bool {
        self.expiration != 0 && now_micros() > self.expiration
    }
}

/// Detailed error information, present only on `ERROR` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub error_code: u32,
    pub error_message: String,
    pub error_category: String,
    pub error_context: String,
}

impl ErrorInfo {
    pub fn new(error_code: u32, error_message: impl Into<String>) -> Self {
        ErrorInfo {
            error_code,
            error_message: error_message.into(),
            error_category: String::new(),
            error_context: String::new(),
        }
    }
}

/// The full in-memory message: header + metadata + payload + optional error
/// block. Owned exclusively by whichever side holds it at a given moment
/// (creator, then the queue/transport it is handed to).
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub metadata: MessageMetadata,
    pub payload: Vec<u8>,
    pub error: Option<ErrorInfo>,
    /// Proxy-local one-way marker; not part of the wire format (see
    /// `is_oneway`). Excluded from wire round-trip comparisons by design.
    pub oneway: bool,
}

/// Wire identity only -- `oneway` is proxy-local call discipline, not a
/// serialized property, so it is deliberately excluded here.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.metadata == other.metadata
            && self.payload == other.payload
            && self.error == other.error
    }
}
impl Eq for Message {}

impl Message {
    /// Builds a fresh REQUEST message, as a `ServiceProxy::call` would.
    pub fn new_request(
        subject: impl Into<String>,
        source_endpoint: impl Into<String>,
        destination_endpoint: impl Into<String>,
        payload: Vec<u8>,
        format: SerializationFormat,
    ) -> Self {
        let mut msg = Message {
            header: MessageHeader::new(MessageType::Request, format),
            metadata: MessageMetadata {
                source_endpoint: source_endpoint.into(),
                destination_endpoint: destination_endpoint.into(),
                subject: subject.into(),
                ..Default::default()
            },
            payload,
            error: None,
            oneway: false,
        };
        msg.update_checksum();
        msg
    }

    /// Builds a RESPONSE message correlated to `self` (a REQUEST).
    pub fn create_response(&self, payload: Vec<u8>) -> Self {
        let mut header = MessageHeader::new(MessageType::Response, self.header.format);
        header.correlation_id = self.header.message_id;
        header.priority = self.header.priority;
        let mut msg = Message {
            header,
            metadata: MessageMetadata {
                source_endpoint: self.metadata.destination_endpoint.clone(),
                destination_endpoint: self.metadata.source_endpoint.clone(),
                subject: self.metadata.subject.clone(),
                ..Default::default()
            },
            payload,
            error: None,
            oneway: false,
        };
        msg.update_checksum();
        msg
    }

    /// Builds an ERROR message correlated to `self` (a REQUEST).
    pub fn create_error_response(
        &self,
        error_code: u32,
        error_message: impl Into<String>,
    ) -> Self {
        let mut header = MessageHeader::new(MessageType::Error, self.header.format);
        header.correlation_id = self.header.message_id;
        let mut msg = Message {
            header,
            metadata: MessageMetadata {
                source_endpoint: self.metadata.destination_endpoint.clone(),
                destination_endpoint: self.metadata.source_endpoint.clone(),
                subject: self.metadata.subject.clone(),
                ..Default::default()
            },
            payload: Vec::new(),
            error: Some(ErrorInfo::new(error_code, error_message)),
            oneway: false,
        };
        msg.update_checksum();
        msg
    }

    /// Recomputes `payload_size` and `checksum` from the current payload.
    pub fn update_checksum(&mut self) {
        self.header.payload_size = self.payload.len() as u32;
        self.header.checksum = if self.payload.is_empty() {
            0
        } else {
            crc32(&self.payload)
        };
    }

    /// True iff the stored checksum matches the current payload.
    pub fn verify_checksum(&self) -> bool {
        let expected = if self.payload.is_empty() {
            0
        } else {
            crc32(&self.payload)
        };
        self.header.checksum == expected
    }

    /// A REQUEST marked one-way expects no RESPONSE; `ServiceProxy` must not
    /// create a pending-call record for it. Carried out-of-band from the
    /// formal flag bitset since it is a proxy-local call discipline, not a
    /// wire-visible property -- see `callOneWay` in §4.F.
    pub fn is_oneway(&self) -> bool {
        self.header.msg_type == MessageType::Request && self.oneway
    }

    pub fn mark_oneway(&mut self) {
        self.oneway = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trip() {
        let mut m = Message::new_request("echo", "a", "b", b"hello".to_vec(), SerializationFormat::Binary);
        assert!(m.verify_checksum());
        m.payload[0] ^= 0xFF;
        assert!(!m.verify_checksum());
    }

    #[test]
    fn response_carries_correlation_id() {
        let req = Message::new_request("echo", "a", "b", b"hi".to_vec(), SerializationFormat::Binary);
        let resp = req.create_response(b"hi".to_vec());
        assert_eq!(resp.header.correlation_id, req.header.message_id);
        assert_eq!(resp.header.msg_type, MessageType::Response);
    }

    #[test]
    fn error_response_carries_error_block() {
        let req = Message::new_request("nonexistent", "a", "b", vec![], SerializationFormat::Binary);
        let err = req.create_error_response(1001, "method not found");
        assert_eq!(err.header.msg_type, MessageType::Error);
        assert_eq!(err.error.as_ref().unwrap().error_code, 1001);
    }

    #[test]
    fn header_validate_rejects_unknown_type() {
        let mut header = MessageHeader::new(MessageType::Request, SerializationFormat::Binary);
        assert!(header.validate());
        header.msg_type = MessageType::Unknown;
        assert!(!header.validate());
    }
}
