//! JSON control-plane envelope for sandboxed-child IPC (spec §6).
//!
//! The reference `SandboxMessage` rides the same `ipc::Message` wire format
//! as every other request/response, serialized into its `payload` as JSON.
//! This crate carries the envelope shape only: it does not interpret
//! `module_id`/`payload` semantics (module loading is out of scope per
//! spec §1) -- a consumer building a sandbox loader on top of this crate
//! plugs its own meaning into those fields and uses `ServiceProxy`/
//! `ServiceStub` to move them.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::message::Message;

/// Control-plane message kind, carried as `type` in the JSON envelope.
///
/// Serializes as its numeric code (not the variant name) to match the wire
/// shape in spec §6; serde's derived enum representation would otherwise
/// emit the variant name as a JSON string, so this is hand-rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SandboxMessageType {
    LoadModule = 1,
    ModuleLoaded = 2,
    StartModule = 3,
    ModuleStarted = 4,
    StopModule = 5,
    ModuleStopped = 6,

    CallService = 10,
    ServiceResponse = 11,

    Heartbeat = 20,
    StatusQuery = 21,
    StatusReport = 22,

    Shutdown = 30,
    Error = 31,
}

impl SandboxMessageType {
    fn from_code(code: u32) -> Option<Self> {
        use SandboxMessageType::*;
        Some(match code {
            1 => LoadModule,
            2 => ModuleLoaded,
            3 => StartModule,
            4 => ModuleStarted,
            5 => StopModule,
            6 => ModuleStopped,
            10 => CallService,
            11 => ServiceResponse,
            20 => Heartbeat,
            21 => StatusQuery,
            22 => StatusReport,
            30 => Shutdown,
            31 => Error,
            _ => return None,
        })
    }
}

impl Serialize for SandboxMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(*self as u32)
    }
}

impl<'de> Deserialize<'de> for SandboxMessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        SandboxMessageType::from_code(code)
            .ok_or_else(|| D::Error::custom(format!("unknown sandbox message type code: {code}")))
    }
}

/// JSON control-plane envelope exchanged between a parent process and a
/// sandboxed child (spec §6 `SandboxMessage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEnvelope {
    #[serde(rename = "type")]
    pub message_type: SandboxMessageType,
    #[serde(rename = "moduleId")]
    pub module_id: String,
    /// Opaque JSON-encoded payload (module path, service call args, ...);
    /// this crate does not look inside it.
    pub payload: String,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    /// 0 = success, non-zero = error.
    #[serde(rename = "errorCode")]
    pub error_code: i32,
}

impl SandboxEnvelope {
    pub fn new(message_type: SandboxMessageType, module_id: impl Into<String>) -> Self {
        SandboxEnvelope {
            message_type,
            module_id: module_id.into(),
            payload: String::new(),
            request_id: 0,
            error_code: 0,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn load_module(module_id: impl Into<String>, module_path: impl Into<String>, request_id: u64) -> Self {
        SandboxEnvelope::new(SandboxMessageType::LoadModule, module_id)
            .with_payload(module_path)
            .with_request_id(request_id)
    }

    pub fn call_service(module_id: impl Into<String>, call_args_json: impl Into<String>, request_id: u64) -> Self {
        SandboxEnvelope::new(SandboxMessageType::CallService, module_id)
            .with_payload(call_args_json)
            .with_request_id(request_id)
    }

    pub fn heartbeat(module_id: impl Into<String>) -> Self {
        SandboxEnvelope::new(SandboxMessageType::Heartbeat, module_id)
    }

    /// Builds an `ERROR` response envelope correlated to `request_id`.
    pub fn error(module_id: impl Into<String>, request_id: u64, error_code: i32, detail: impl Into<String>) -> Self {
        let mut envelope = SandboxEnvelope::new(SandboxMessageType::Error, module_id)
            .with_payload(detail)
            .with_request_id(request_id);
        envelope.error_code = error_code;
        envelope
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Serializes to the JSON wire form this envelope uses as an
    /// `ipc::Message` payload.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Extracts and decodes the JSON payload carried by an `ipc::Message`.
    pub fn from_message(message: &Message) -> serde_json::Result<Self> {
        SandboxEnvelope::from_json(&message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let envelope = SandboxEnvelope::load_module("hello-service", "/modules/hello.so", 42);
        let bytes = envelope.to_json().unwrap();
        let decoded = SandboxEnvelope::from_json(&bytes).unwrap();

        assert_eq!(decoded.message_type, SandboxMessageType::LoadModule);
        assert_eq!(decoded.module_id, "hello-service");
        assert_eq!(decoded.payload, "/modules/hello.so");
        assert_eq!(decoded.request_id, 42);
        assert_eq!(decoded.error_code, 0);
    }

    #[test]
    fn wire_format_uses_expected_field_names_and_codes() {
        let envelope = SandboxEnvelope::call_service("hello-service", "{}", 7);
        let bytes = envelope.to_json().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["type"], 10);
        assert_eq!(json["moduleId"], "hello-service");
        assert_eq!(json["requestId"], 7);
        assert_eq!(json["errorCode"], 0);
    }

    #[test]
    fn error_envelope_is_flagged() {
        let envelope = SandboxEnvelope::error("hello-service", 7, 3, "module not loaded");
        assert!(envelope.is_error());
        assert_eq!(envelope.message_type, SandboxMessageType::Error);
    }
}
