//! JSON envelope codec and inbound schema validation.
//!
//! Inbound frames are decoded in two steps: the envelope first, so a broken
//! payload can still be attributed to its event name, then the typed payload
//! followed by semantic checks. Nothing that fails here reaches the
//! coordinator's lock logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use banklock_common::ResourceKey;

use crate::messages::*;

/// A frame that failed decoding or validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tipo}: {error}")]
pub struct DecodeError {
    /// What was wrong.
    pub error: String,
    /// Event name of the offending frame, `"unknown"` if unreadable.
    pub tipo: String,
}

impl DecodeError {
    fn new(tipo: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            tipo: tipo.into(),
        }
    }

    /// Whether the frame was a heartbeat, which gets no error response.
    pub fn is_heartbeat(&self) -> bool {
        self.tipo == "HEARTBEAT"
    }

    /// Wire response for this failure.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::ValidationError(ValidationError {
            error: self.error.clone(),
            tipo: self.tipo.clone(),
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Encode any protocol message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decode and validate a frame sent by a worker.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| DecodeError::new("unknown", format!("malformed frame: {}", e)))?;

    let event = envelope
        .event
        .ok_or_else(|| DecodeError::new("unknown", "missing event name"))?;

    let message = match event.as_str() {
        "REGISTER_WORKER" => {
            let payload: RegisterWorker = payload(&event, envelope.data)?;
            validate_register(&payload).map_err(|e| DecodeError::new(&event, e))?;
            ClientMessage::RegisterWorker(payload)
        }
        "HEARTBEAT" => {
            let payload: Heartbeat = payload(&event, envelope.data)?;
            if !payload.worker_id.is_valid() {
                return Err(DecodeError::new(&event, "workerId is required"));
            }
            ClientMessage::Heartbeat(payload)
        }
        "LOCK_REQUEST" => {
            let payload: LockRequestMessage = payload(&event, envelope.data)?;
            validate_lock_request(&payload).map_err(|e| DecodeError::new(&event, e))?;
            ClientMessage::LockRequest(payload)
        }
        "LOCK_RELEASE" => {
            let payload: LockReleaseMessage = payload(&event, envelope.data)?;
            validate_ids(&payload.worker_id, &payload.request_id)
                .and_then(|_| validate_resources(&payload.resources))
                .map_err(|e| DecodeError::new(&event, e))?;
            ClientMessage::LockRelease(payload)
        }
        "CANCEL_REQUEST" => {
            let payload: CancelRequest = payload(&event, envelope.data)?;
            validate_ids(&payload.worker_id, &payload.request_id)
                .map_err(|e| DecodeError::new(&event, e))?;
            ClientMessage::CancelRequest(payload)
        }
        "status-request" => ClientMessage::StatusRequest,
        other => return Err(DecodeError::new(other, "unknown event")),
    };

    Ok(message)
}

/// Decode a frame sent by the coordinator.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, DecodeError> {
    serde_json::from_str(text).map_err(|e| DecodeError::new("unknown", e.to_string()))
}

fn payload<T: DeserializeOwned>(event: &str, data: Option<Value>) -> Result<T, DecodeError> {
    let data = data.ok_or_else(|| DecodeError::new(event, "missing data"))?;
    serde_json::from_value(data).map_err(|e| DecodeError::new(event, e.to_string()))
}

fn validate_register(payload: &RegisterWorker) -> Result<(), String> {
    if !payload.worker_id.is_valid() {
        return Err("workerId is required".to_string());
    }
    if payload.capacity == 0 {
        return Err("capacidad must be at least 1".to_string());
    }
    Ok(())
}

fn validate_lock_request(payload: &LockRequestMessage) -> Result<(), String> {
    validate_ids(&payload.worker_id, &payload.request_id)?;
    validate_resources(&payload.resources)?;
    if payload.timeout_ms == Some(0) {
        return Err("timeout must be positive".to_string());
    }
    Ok(())
}

fn validate_ids(
    worker_id: &banklock_common::WorkerId,
    request_id: &banklock_common::RequestId,
) -> Result<(), String> {
    if !worker_id.is_valid() {
        return Err("workerId is required".to_string());
    }
    if !request_id.is_valid() {
        return Err("requestId is required".to_string());
    }
    Ok(())
}

fn validate_resources(resources: &[ResourceKey]) -> Result<(), String> {
    if resources.is_empty() {
        return Err("recursos must name at least one resource".to_string());
    }
    if resources.iter().any(|r| r.id.trim().is_empty()) {
        return Err("resource id cannot be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use banklock_common::{Priority, RequestId, WorkerId};

    #[test]
    fn test_decode_lock_request_defaults() {
        let frame = r#"{"event":"LOCK_REQUEST","data":{"requestId":"r-1","workerId":"w-1",
            "recursos":[{"tipo":"CUENTA","id":"acc-1"}]}}"#;

        match decode_client_message(frame).unwrap() {
            ClientMessage::LockRequest(req) => {
                assert_eq!(req.priority, Priority::Normal);
                assert_eq!(req.timeout_ms, None);
                assert_eq!(req.resources, vec![ResourceKey::account("acc-1")]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_empty_resource_set_is_rejected() {
        let frame = r#"{"event":"LOCK_REQUEST","data":{"requestId":"r-1","workerId":"w-1","recursos":[]}}"#;
        let err = decode_client_message(frame).unwrap_err();
        assert_eq!(err.tipo, "LOCK_REQUEST");
        assert!(err.error.contains("recursos"));
    }

    #[test]
    fn test_bad_priority_is_rejected() {
        let frame = r#"{"event":"LOCK_REQUEST","data":{"requestId":"r-1","workerId":"w-1",
            "recursos":[{"tipo":"CUENTA","id":"a"}],"prioridad":9}}"#;
        assert!(decode_client_message(frame).is_err());
    }

    #[test]
    fn test_unknown_resource_kind_is_rejected() {
        let frame = r#"{"event":"LOCK_RELEASE","data":{"requestId":"r-1","workerId":"w-1",
            "recursos":[{"tipo":"BOVEDA","id":"a"}]}}"#;
        assert_eq!(decode_client_message(frame).unwrap_err().tipo, "LOCK_RELEASE");
    }

    #[test]
    fn test_register_without_token_decodes() {
        let frame = r#"{"event":"REGISTER_WORKER","data":{"workerId":"w-1","puerto":3001,"capacidad":5}}"#;
        match decode_client_message(frame).unwrap() {
            ClientMessage::RegisterWorker(reg) => assert!(reg.token.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_failure_is_flagged() {
        let err = decode_client_message(r#"{"event":"HEARTBEAT","data":{"workerId":"w"}}"#).unwrap_err();
        assert!(err.is_heartbeat());
    }

    #[test]
    fn test_garbage_and_unknown_events() {
        assert_eq!(decode_client_message("not json").unwrap_err().tipo, "unknown");
        assert_eq!(decode_client_message(r#"{"data":{}}"#).unwrap_err().tipo, "unknown");
        assert_eq!(
            decode_client_message(r#"{"event":"DROP_TABLES"}"#).unwrap_err().tipo,
            "DROP_TABLES"
        );
    }

    #[test]
    fn test_status_request_needs_no_data() {
        assert_eq!(
            decode_client_message(r#"{"event":"status-request"}"#).unwrap(),
            ClientMessage::StatusRequest
        );
    }

    #[test]
    fn test_encoded_client_frames_decode() {
        let msg = ClientMessage::CancelRequest(CancelRequest {
            request_id: RequestId::new("r-9"),
            worker_id: WorkerId::new("w-9"),
        });
        let frame = encode(&msg).unwrap();
        assert_eq!(decode_client_message(&frame).unwrap(), msg);
    }
}
