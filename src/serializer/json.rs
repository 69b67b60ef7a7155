//! JSON wire format. The header stays in the same fixed 56-byte binary
//! layout (size-prefix/checksum framing is format-agnostic, spec §4.A);
//! only the metadata+payload+error region is re-encoded as a single JSON
//! document carried where the binary format would put its own sections.

use serde::{Deserialize, Serialize};

use super::binary::{self};
use super::Serializer;
use crate::error::{SerializerError, SerializerResult};
use crate::message::{ErrorInfo, Message, MessageMetadata, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};

#[derive(Serialize, Deserialize)]
struct JsonBody {
    source_endpoint: String,
    destination_endpoint: String,
    subject: String,
    content_type: String,
    expiration: u64,
    retry_count: u32,
    max_retries: u32,
    #[serde(with = "hex_bytes")]
    payload: Vec<u8>,
    error_code: Option<u32>,
    error_message: Option<String>,
    error_category: Option<String>,
    error_context: Option<String>,
}

// Plain hex encoding keeps this module dependency-free beyond serde_json;
// JSON can't carry arbitrary binary directly.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        hex.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(d)?;
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// JSON codec for `format = SerializationFormat::Json` (spec §4.A ADDED).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
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

        let body = JsonBody {
            source_endpoint: message.metadata.source_endpoint.clone(),
            destination_endpoint: message.metadata.destination_endpoint.clone(),
            subject: message.metadata.subject.clone(),
            content_type: message.metadata.content_type.clone(),
            expiration: message.metadata.expiration,
            retry_count: message.metadata.retry_count,
            max_retries: message.metadata.max_retries,
            payload: message.payload.clone(),
            error_code: message.error.as_ref().map(|e| e.error_code),
            error_message: message.error.as_ref().map(|e| e.error_message.clone()),
            error_category: message.error.as_ref().map(|e| e.error_category.clone()),
            error_context: message.error.as_ref().map(|e| e.error_context.clone()),
        };
        let json = serde_json::to_vec(&body)
            .map_err(|e| SerializerError::SerializationError(e.to_string()))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
        binary::write_header(&mut buf, &message.header);
        buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializerResult<Message> {
        let header = binary::read_header(bytes)?;
        let mut pos = HEADER_SIZE;
        if bytes.len() < pos + 4 {
            return Err(SerializerError::InsufficientData { needed: pos + 4, have: bytes.len() });
        }
        let json_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if bytes.len() < pos + json_len {
            return Err(SerializerError::InsufficientData { needed: pos + json_len, have: bytes.len() });
        }
        let body: JsonBody = serde_json::from_slice(&bytes[pos..pos + json_len])
            .map_err(|e| SerializerError::DeserializationError(e.to_string()))?;

        let error = body.error_code.map(|code| ErrorInfo {
            error_code: code,
            error_message: body.error_message.unwrap_or_default(),
            error_category: body.error_category.unwrap_or_default(),
            error_context: body.error_context.unwrap_or_default(),
        });

        Ok(Message {
            header,
            metadata: MessageMetadata {
                source_endpoint: body.source_endpoint,
                destination_endpoint: body.destination_endpoint,
                subject: body.subject,
                content_type: body.content_type,
                expiration: body.expiration,
                retry_count: body.retry_count,
                max_retries: body.max_retries,
            },
            payload: body.payload,
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
    fn round_trips_through_json() {
        let ser = JsonSerializer;
        let mut msg = Message::new_request("echo", "c", "s", b"hello".to_vec(), SerializationFormat::Json);
        msg.header.format = SerializationFormat::Json;
        let bytes = ser.serialize(&msg).unwrap();
        let decoded = ser.deserialize(&bytes).unwrap();
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.metadata.subject, "echo");
    }
}
