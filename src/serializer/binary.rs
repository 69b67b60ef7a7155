//! The BINARY wire format -- the only format required for interoperability
//! across the transports in this crate (spec §4.A/§6). Field layout and
//! the length-prefixed string convention are taken verbatim from the
//! reference serializer this crate is modeled on.

use uuid::Uuid;

use super::Serializer;
use crate::error::{SerializerError, SerializerResult};
use crate::message::{
    ErrorInfo, Message, MessageFlags, MessageHeader, MessageMetadata, MessageType,
    MessagePriority, SerializationFormat, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> SerializerResult<u32> {
    if bytes.len() < *pos + 4 {
        return Err(SerializerError::InsufficientData {
            needed: *pos + 4,
            have: bytes.len(),
        });
    }
    let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> SerializerResult<u64> {
    if bytes.len() < *pos + 8 {
        return Err(SerializerError::InsufficientData {
            needed: *pos + 8,
            have: bytes.len(),
        });
    }
    let v = u64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_string(bytes: &[u8], pos: &mut usize) -> SerializerResult<String> {
    let len = read_u32(bytes, pos)? as usize;
    if bytes.len() < *pos + len {
        return Err(SerializerError::InsufficientData {
            needed: *pos + len,
            have: bytes.len(),
        });
    }
    let s = String::from_utf8(bytes[*pos..*pos + len].to_vec())
        .map_err(|e| SerializerError::DeserializationError(e.to_string()))?;
    *pos += len;
    Ok(s)
}

fn serialize_metadata(meta: &MessageMetadata) -> Vec<u8> {
    let mut buf = Vec::new();
    write_string(&mut buf, &meta.source_endpoint);
    write_string(&mut buf, &meta.destination_endpoint);
    write_string(&mut buf, &meta.subject);
    write_string(&mut buf, &meta.content_type);
    write_u64(&mut buf, meta.expiration);
    write_u32(&mut buf, meta.retry_count);
    write_u32(&mut buf, meta.max_retries);
    buf
}

fn deserialize_metadata(bytes: &[u8]) -> SerializerResult<MessageMetadata> {
    let mut pos = 0;
    Ok(MessageMetadata {
        source_endpoint: read_string(bytes, &mut pos)?,
        destination_endpoint: read_string(bytes, &mut pos)?,
        subject: read_string(bytes, &mut pos)?,
        content_type: read_string(bytes, &mut pos)?,
        expiration: read_u64(bytes, &mut pos)?,
        retry_count: read_u32(bytes, &mut pos)?,
        max_retries: read_u32(bytes, &mut pos)?,
    })
}

fn serialize_error_info(err: &ErrorInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    write_u32(&mut buf, err.error_code);
    write_string(&mut buf, &err.error_message);
    write_string(&mut buf, &err.error_category);
    write_string(&mut buf, &err.error_context);
    buf
}

fn deserialize_error_info(bytes: &[u8]) -> SerializerResult<ErrorInfo> {
    let mut pos = 0;
    Ok(ErrorInfo {
        error_code: read_u32(bytes, &mut pos)?,
        error_message: read_string(bytes, &mut pos)?,
        error_category: read_string(bytes, &mut pos)?,
        error_context: read_string(bytes, &mut pos)?,
    })
}

pub(crate) fn write_header(buf: &mut Vec<u8>, header: &MessageHeader) {
    buf.extend_from_slice(header.message_id.as_bytes());
    buf.extend_from_slice(header.correlation_id.as_bytes());
    write_u64(buf, header.timestamp);
    buf.push(header.msg_type as u8);
    buf.push(header.priority as u8);
    buf.push(header.format as u8);
    buf.push(header.version);
    write_u32(buf, header.flags.0);
    write_u32(buf, header.payload_size);
    write_u32(buf, header.checksum);
}

pub(crate) fn read_header(bytes: &[u8]) -> SerializerResult<MessageHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(SerializerError::InsufficientData {
            needed: HEADER_SIZE,
            have: bytes.len(),
        });
    }
    let message_id = Uuid::from_bytes(bytes[0..16].try_into().unwrap());
    let correlation_id = Uuid::from_bytes(bytes[16..32].try_into().unwrap());
    let mut pos = 32usize;
    let timestamp = read_u64(bytes, &mut pos)?;
    let msg_type = MessageType::from_u8(bytes[pos]);
    let priority = MessagePriority::from_u8(bytes[pos + 1]);
    let format = SerializationFormat::from_u8(bytes[pos + 2]);
    let version = bytes[pos + 3];
    pos += 4;
    let flags = MessageFlags(read_u32(bytes, &mut pos)?);
    let payload_size = read_u32(bytes, &mut pos)?;
    let checksum = read_u32(bytes, &mut pos)?;

    if version != PROTOCOL_VERSION {
        return Err(SerializerError::UnsupportedVersion(version));
    }
    if msg_type == MessageType::Unknown {
        return Err(SerializerError::InvalidFormat);
    }
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(SerializerError::SizeExceeded(
            payload_size as usize,
            MAX_PAYLOAD_SIZE as usize,
        ));
    }

    Ok(MessageHeader {
        message_id,
        correlation_id,
        timestamp,
        msg_type,
        priority,
        format,
        version,
        flags,
        payload_size,
        checksum,
    })
}

/// The canonical binary codec (spec §4.A). Stateless: every call owns its
/// buffers, so a single instance can be shared across every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn serialize(&self, message: &Message) -> SerializerResult<Vec<u8>> {
        if message.header.msg_type == MessageType::Unknown {
            return Err(SerializerError::InvalidMessage(
                "cannot serialize a message of type UNKNOWN".into(),
            ));
        }
        if message.payload.len() as u32 > MAX_PAYLOAD_SIZE {
            return Err(SerializerError::SizeExceeded(
                message.payload.len(),
                MAX_PAYLOAD_SIZE as usize,
            ));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + message.payload.len() + 64);
        write_header(&mut buf, &message.header);

        let meta_bytes = serialize_metadata(&message.metadata);
        write_u32(&mut buf, meta_bytes.len() as u32);
        buf.extend_from_slice(&meta_bytes);

        buf.extend_from_slice(&message.payload);

        if message.header.msg_type == MessageType::Error {
            let err = message
                .error
                .as_ref()
                .ok_or_else(|| SerializerError::InvalidMessage("ERROR message missing error block".into()))?;
            let err_bytes = serialize_error_info(err);
            write_u32(&mut buf, err_bytes.len() as u32);
            buf.extend_from_slice(&err_bytes);
        }

        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializerResult<Message> {
        let header = read_header(bytes)?;
        let mut pos = HEADER_SIZE;

        let meta_len = read_u32(bytes, &mut pos)? as usize;
        if bytes.len() < pos + meta_len {
            return Err(SerializerError::InsufficientData {
                needed: pos + meta_len,
                have: bytes.len(),
            });
        }
        let metadata = deserialize_metadata(&bytes[pos..pos + meta_len])?;
        pos += meta_len;

        let payload_size = header.payload_size as usize;
        if bytes.len() < pos + payload_size {
            return Err(SerializerError::InsufficientData {
                needed: pos + payload_size,
                have: bytes.len(),
            });
        }
        let payload = bytes[pos..pos + payload_size].to_vec();
        pos += payload_size;

        let expected_checksum = if payload.is_empty() {
            0
        } else {
            crate::crc32::crc32(&payload)
        };
        if expected_checksum != header.checksum {
            return Err(SerializerError::ChecksumMismatch);
        }

        let error = if header.msg_type == MessageType::Error {
            let err_len = read_u32(bytes, &mut pos)? as usize;
            if bytes.len() < pos + err_len {
                return Err(SerializerError::InsufficientData {
                    needed: pos + err_len,
                    have: bytes.len(),
                });
            }
            Some(deserialize_error_info(&bytes[pos..pos + err_len])?)
        } else {
            None
        };

        Ok(Message {
            header,
            metadata,
            payload,
            error,
            oneway: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SerializationFormat;

    #[test]
    fn round_trips_a_request() {
        let ser = BinarySerializer;
        let msg = Message::new_request("add", "client", "server", vec![1, 2, 3, 4], SerializationFormat::Binary);
        let bytes = ser.serialize(&msg).unwrap();
        let decoded = ser.deserialize(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_an_error_response() {
        let ser = BinarySerializer;
        let req = Message::new_request("x", "c", "s", vec![], SerializationFormat::Binary);
        let err = req.create_error_response(1001, "method not found");
        let bytes = ser.serialize(&err).unwrap();
        let decoded = ser.deserialize(&bytes).unwrap();
        assert_eq!(err, decoded);
        assert_eq!(decoded.error.unwrap().error_code, 1001);
    }

    #[test]
    fn detects_checksum_mismatch() {
        let ser = BinarySerializer;
        let msg = Message::new_request("echo", "c", "s", b"hello".to_vec(), SerializationFormat::Binary);
        let mut bytes = ser.serialize(&msg).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // corrupt a payload byte
        assert_eq!(ser.deserialize(&bytes), Err(SerializerError::ChecksumMismatch));
    }

    #[test]
    fn rejects_truncated_frame() {
        let ser = BinarySerializer;
        let msg = Message::new_request("echo", "c", "s", b"hello world".to_vec(), SerializationFormat::Binary);
        let bytes = ser.serialize(&msg).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(ser.deserialize(truncated).is_err());
    }

    #[test]
    fn large_payload_round_trip() {
        let ser = BinarySerializer;
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 256) as u8).collect();
        let msg = Message::new_request("echo", "c", "s", payload.clone(), SerializationFormat::Binary);
        let bytes = ser.serialize(&msg).unwrap();
        let decoded = ser.deserialize(&bytes).unwrap();
        assert_eq!(decoded.payload, payload);
    }
}
