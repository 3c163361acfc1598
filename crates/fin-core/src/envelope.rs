use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ApprovalRequest, ApprovalStatus, RiskLevel};
use crate::error::EnvelopeError;
use crate::task::{TaskEvent, TaskState};

pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

/// Raw wire unit: `{type, data?, message?, timestamp}`. Decoding stops at
/// this stage for frames whose `type` the receiver does not know; they are
/// logged and dropped, never fatal. Encoding always stamps `timestamp`
/// (RFC 3339), which consumers use for display ordering only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Typed view of a classified envelope. One variant per known `type`, plus
/// an explicit unknown arm so dispatch never falls through silently.
#[derive(Debug, Clone)]
pub enum Frame {
    Status {
        message: String,
        decision: Option<ApprovalDecisionData>,
    },
    Screenshot {
        data: String,
    },
    ApprovalRequest(ApprovalRequestData),
    TaskUpdate(TaskEvent),
    Error {
        message: String,
    },
    Success {
        message: String,
        decision: Option<ApprovalDecisionData>,
    },
    VisionCall(VisionCallData),
    Command(CommandData),
    Approve(ApproveData),
    Unknown(String),
}

/// `approval_request` payload as the dashboard sees it. The daemon sends
/// the full [`ApprovalRequest`] record; only these fields are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestData {
    pub id: String,
    pub action: String,
    pub reason: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Resolution outcome rider on `success` (approved) and `status`
/// (denied/expired) envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecisionData {
    pub id: String,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionCallData {
    pub provider: String,
    pub purpose: String,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandData {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveData {
    pub request_id: String,
    pub approved: bool,
}

/// Decode one text frame. Total: every failure maps to an
/// [`EnvelopeError`] the caller can log without closing the connection.
pub fn decode(raw: &str) -> Result<Envelope, EnvelopeError> {
    if raw.len() > MAX_ENVELOPE_BYTES {
        return Err(EnvelopeError::Oversized {
            max: MAX_ENVELOPE_BYTES,
        });
    }
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
    if envelope.kind.trim().is_empty() {
        return Err(EnvelopeError::MissingField("type"));
    }
    Ok(envelope)
}

impl Envelope {
    fn stamped(kind: &str, data: Option<Value>, message: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            message,
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::stamped("status", None, Some(message.into()))
    }

    pub fn screenshot(data_b64: impl Into<String>) -> Self {
        Self::stamped(
            "screenshot",
            Some(Value::String(data_b64.into())),
            None,
        )
    }

    pub fn approval_request(request: &ApprovalRequest) -> Self {
        let data = serde_json::to_value(request).unwrap_or(Value::Null);
        Self::stamped("approval_request", Some(data), Some(request.action.clone()))
    }

    /// Exactly one of these is emitted per request id: `success` when
    /// approved, `status` when denied or expired.
    pub fn approval_resolution(id: &str, status: ApprovalStatus, message: &str) -> Self {
        let kind = if status.allows_execution() {
            "success"
        } else {
            "status"
        };
        let data = serde_json::json!({ "id": id, "status": status });
        Self::stamped(kind, Some(data), Some(message.to_string()))
    }

    pub fn task_update(event: &TaskEvent) -> Self {
        let data = serde_json::to_value(event).unwrap_or(Value::Null);
        Self::stamped("task_update", Some(data), Some(event.message.clone()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::stamped("error", None, Some(message.into()))
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::stamped("success", None, Some(message.into()))
    }

    pub fn vision_call(provider: &str, purpose: &str, latency_ms: Option<u64>) -> Self {
        let data = serde_json::json!({
            "provider": provider,
            "purpose": purpose,
            "latency_ms": latency_ms,
        });
        Self::stamped("vision_call", Some(data), None)
    }

    pub fn command(command: impl Into<String>) -> Self {
        let data = serde_json::json!({ "command": command.into() });
        Self::stamped("command", Some(data), None)
    }

    pub fn approve(request_id: &str, approved: bool) -> Self {
        let data = serde_json::json!({ "request_id": request_id, "approved": approved });
        Self::stamped("approve", Some(data), None)
    }

    pub fn to_text(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Classify into a typed [`Frame`]. Unknown `type` values yield
    /// [`Frame::Unknown`]; a known type with an unusable payload is a
    /// payload error, also non-fatal to the connection.
    pub fn classify(&self) -> Result<Frame, EnvelopeError> {
        let message = self.message.clone().unwrap_or_default();
        match self.kind.as_str() {
            "status" => Ok(Frame::Status {
                message,
                decision: self.decision_data(),
            }),
            "success" => Ok(Frame::Success {
                message,
                decision: self.decision_data(),
            }),
            "error" => Ok(Frame::Error { message }),
            "screenshot" => {
                let data = self
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .ok_or(EnvelopeError::MissingField("data"))?;
                Ok(Frame::Screenshot {
                    data: data.to_string(),
                })
            }
            "approval_request" => {
                let payload: ApprovalRequestData = self.typed_payload()?;
                if payload.id.is_empty() || payload.action.is_empty() {
                    return Err(EnvelopeError::MissingField("id"));
                }
                Ok(Frame::ApprovalRequest(payload))
            }
            "task_update" => {
                let payload: TaskEvent = self.typed_payload()?;
                if payload.task_id.is_empty() {
                    return Err(EnvelopeError::MissingField("task_id"));
                }
                Ok(Frame::TaskUpdate(payload))
            }
            "vision_call" => Ok(Frame::VisionCall(self.typed_payload()?)),
            "command" => {
                let payload: CommandData = self.typed_payload()?;
                if payload.command.trim().is_empty() {
                    return Err(EnvelopeError::MissingField("command"));
                }
                Ok(Frame::Command(payload))
            }
            "approve" => {
                let payload: ApproveData = self.typed_payload()?;
                if payload.request_id.is_empty() {
                    return Err(EnvelopeError::MissingField("request_id"));
                }
                Ok(Frame::Approve(payload))
            }
            other => Ok(Frame::Unknown(other.to_string())),
        }
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let data = self
            .data
            .clone()
            .ok_or(EnvelopeError::MissingField("data"))?;
        serde_json::from_value(data).map_err(|err| EnvelopeError::InvalidPayload {
            kind: self.kind.clone(),
            reason: err.to_string(),
        })
    }

    fn decision_data(&self) -> Option<ApprovalDecisionData> {
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}
