use super::{
    EndShiftPayload, LocationPayload, PushTokenPayload, SensorBatchPayload, StartShiftPayload,
    UploadPhotoPayload,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response envelope returned by the remote authority.
///
/// `status` follows HTTP semantics; `body` is the decoded JSON body when the
/// response carried one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub status: u16,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RemoteEnvelope {
    pub fn new(status: u16, body: Option<serde_json::Value>) -> Self {
        Self { status, body }
    }

    pub fn ok(body: serde_json::Value) -> Self {
        Self::new(200, Some(body))
    }

    pub fn no_content() -> Self {
        Self::new(204, None)
    }

    pub fn conflict(body: serde_json::Value) -> Self {
        Self::new(409, Some(body))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    /// Server-side and throttling statuses are worth another attempt; any
    /// other client error is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 408 | 429) || self.status >= 500
    }

    /// Identifier assigned by the authority, read from `id` or `serverId`.
    pub fn entity_id(&self) -> Option<String> {
        read_entity_id(self.body.as_ref()?.as_object()?)
    }

    /// Short description used as the failure reason on the mutation row.
    pub fn describe(&self) -> String {
        let message = self
            .body
            .as_ref()
            .and_then(|body| body.get("message"))
            .and_then(|message| message.as_str());
        match message {
            Some(message) => format!("HTTP {}: {}", self.status, message),
            None => format!("HTTP {}", self.status),
        }
    }
}

/// First of `id`, `serverId`, `serverEntityId` carrying a string or number.
pub(crate) fn read_entity_id(body: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    ["id", "serverId", "serverEntityId"]
        .iter()
        .find_map(|field| match body.get(*field)? {
            serde_json::Value::String(value) if !value.is_empty() => Some(value.clone()),
            serde_json::Value::Number(value) => Some(value.to_string()),
            _ => None,
        })
}

/// Failure below the envelope level: the request never produced a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

/// Remote API consumed by the commands, one call per command type.
///
/// Shift references are already resolved to authority identifiers when they
/// reach the transport. Implementations own request deadlines.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn start_shift(
        &self,
        request: &StartShiftPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;

    async fn end_shift(
        &self,
        server_shift_id: &str,
        request: &EndShiftPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;

    async fn upload_photo(
        &self,
        server_shift_id: Option<&str>,
        request: &UploadPhotoPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;

    async fn upload_sensor_batch(
        &self,
        server_shift_id: Option<&str>,
        request: &SensorBatchPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;

    async fn record_location(
        &self,
        server_shift_id: Option<&str>,
        request: &LocationPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;

    async fn update_push_token(
        &self,
        request: &PushTokenPayload,
    ) -> std::result::Result<RemoteEnvelope, TransportError>;
}
