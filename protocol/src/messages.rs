//! Protocol message types.
//!
//! Every frame is a JSON envelope `{"event": "<NAME>", "data": {...}}`.
//! Field names follow the deployed worker fleet (`puerto`, `recursos`,
//! `razon`, ...), so they are renamed explicitly rather than derived.

use banklock_common::{Priority, RequestId, ResourceKey, WorkerId};
use serde::{Deserialize, Serialize};

use crate::stats::StatusSnapshot;

/// Worker-reported activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// No locks held.
    Idle,
    /// At least one lock held.
    Busy,
}

/// `REGISTER_WORKER` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWorker {
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    /// Port the worker serves its own clients on.
    #[serde(rename = "puerto")]
    pub listen_port: u16,
    /// Maximum number of grants the worker may hold at once.
    #[serde(rename = "capacidad")]
    pub capacity: usize,
    /// Pre-issued credential. Absence is an authentication failure, not a
    /// schema failure.
    #[serde(default)]
    pub token: Option<String>,
}

/// `HEARTBEAT` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "estado")]
    pub status: WorkerStatus,
    #[serde(rename = "locksActivos")]
    pub active_locks: usize,
}

/// `LOCK_REQUEST` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequestMessage {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "recursos")]
    pub resources: Vec<ResourceKey>,
    #[serde(rename = "prioridad", default)]
    pub priority: Priority,
    /// Requested hold time in milliseconds; clamped by the coordinator.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "operacion", default)]
    pub operation: String,
}

/// `LOCK_RELEASE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReleaseMessage {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "recursos")]
    pub resources: Vec<ResourceKey>,
}

/// `CANCEL_REQUEST` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
}

/// Messages sent by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "REGISTER_WORKER")]
    RegisterWorker(RegisterWorker),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "LOCK_REQUEST")]
    LockRequest(LockRequestMessage),
    #[serde(rename = "LOCK_RELEASE")]
    LockRelease(LockReleaseMessage),
    #[serde(rename = "CANCEL_REQUEST")]
    CancelRequest(CancelRequest),
    #[serde(rename = "status-request")]
    StatusRequest,
}

impl ClientMessage {
    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::RegisterWorker(_) => "REGISTER_WORKER",
            ClientMessage::Heartbeat(_) => "HEARTBEAT",
            ClientMessage::LockRequest(_) => "LOCK_REQUEST",
            ClientMessage::LockRelease(_) => "LOCK_RELEASE",
            ClientMessage::CancelRequest(_) => "CANCEL_REQUEST",
            ClientMessage::StatusRequest => "status-request",
        }
    }

    /// Worker the message claims to come from, if any.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            ClientMessage::RegisterWorker(m) => Some(&m.worker_id),
            ClientMessage::Heartbeat(m) => Some(&m.worker_id),
            ClientMessage::LockRequest(m) => Some(&m.worker_id),
            ClientMessage::LockRelease(m) => Some(&m.worker_id),
            ClientMessage::CancelRequest(m) => Some(&m.worker_id),
            ClientMessage::StatusRequest => None,
        }
    }
}

/// `WORKER_REGISTERED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistered {
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    /// Registration id assigned by the coordinator.
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
}

/// `auth-error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthError {
    pub error: String,
    #[serde(rename = "workerId", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// `validation-error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub error: String,
    /// Event name of the rejected message.
    pub tipo: String,
}

/// `LOCK_GRANTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockGranted {
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(rename = "recursos")]
    pub resources: Vec<ResourceKey>,
    /// Unix epoch milliseconds.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

/// `LOCK_DENIED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDenied {
    #[serde(rename = "workerId")]
    pub worker_id: WorkerId,
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(rename = "recursos")]
    pub resources: Vec<ResourceKey>,
    pub razon: String,
    #[serde(rename = "bloqueadoPor", default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<WorkerId>,
}

/// `FORCE_RELEASE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRelease {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
}

/// Messages sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "WORKER_REGISTERED")]
    WorkerRegistered(WorkerRegistered),
    #[serde(rename = "auth-error")]
    AuthError(AuthError),
    #[serde(rename = "validation-error")]
    ValidationError(ValidationError),
    #[serde(rename = "LOCK_GRANTED")]
    LockGranted(LockGranted),
    #[serde(rename = "LOCK_DENIED")]
    LockDenied(LockDenied),
    #[serde(rename = "FORCE_RELEASE")]
    ForceRelease(ForceRelease),
    #[serde(rename = "status-response")]
    StatusResponse(Box<StatusSnapshot>),
}

impl ServerMessage {
    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::WorkerRegistered(_) => "WORKER_REGISTERED",
            ServerMessage::AuthError(_) => "auth-error",
            ServerMessage::ValidationError(_) => "validation-error",
            ServerMessage::LockGranted(_) => "LOCK_GRANTED",
            ServerMessage::LockDenied(_) => "LOCK_DENIED",
            ServerMessage::ForceRelease(_) => "FORCE_RELEASE",
            ServerMessage::StatusResponse(_) => "status-response",
        }
    }

    /// Request this message concerns, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ServerMessage::WorkerRegistered(m) => Some(&m.request_id),
            ServerMessage::AuthError(m) => m.request_id.as_ref(),
            ServerMessage::LockGranted(m) => Some(&m.request_id),
            ServerMessage::LockDenied(m) => Some(&m.request_id),
            ServerMessage::ForceRelease(m) => Some(&m.request_id),
            ServerMessage::ValidationError(_) | ServerMessage::StatusResponse(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_request_wire_shape() {
        let msg = ClientMessage::LockRequest(LockRequestMessage {
            request_id: RequestId::new("r-1"),
            worker_id: WorkerId::new("worker-1"),
            resources: vec![ResourceKey::account("acc-1")],
            priority: Priority::High,
            timeout_ms: Some(10_000),
            operation: "transfer".to_string(),
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "LOCK_REQUEST");
        assert_eq!(json["data"]["requestId"], "r-1");
        assert_eq!(json["data"]["recursos"][0]["tipo"], "CUENTA");
        assert_eq!(json["data"]["prioridad"], 2);
        assert_eq!(json["data"]["operacion"], "transfer");
    }

    #[test]
    fn test_status_request_has_no_payload() {
        let json = serde_json::to_value(ClientMessage::StatusRequest).unwrap();
        assert_eq!(json, serde_json::json!({"event": "status-request"}));
    }

    #[test]
    fn test_denial_omits_missing_blocker() {
        let msg = ServerMessage::LockDenied(LockDenied {
            worker_id: WorkerId::new("w"),
            request_id: RequestId::new("r"),
            resources: vec![],
            razon: crate::reasons::DEADLOCK_VICTIM.to_string(),
            blocked_by: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["data"].get("bloqueadoPor").is_none());
        assert_eq!(msg.request_id(), Some(&RequestId::new("r")));
    }
}
