//! Closed set of queued mutations and the contract for executing them.

pub mod transport;

use crate::core::{Result, SyncError};
use crate::local::LocalEntityStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use transport::{RemoteEnvelope, RemoteTransport, TransportError};

/// Stable type tag persisted with every mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    #[serde(rename = "START_SHIFT")]
    StartShift,
    #[serde(rename = "END_SHIFT")]
    EndShift,
    #[serde(rename = "UPLOAD_PHOTO")]
    UploadPhoto,
    #[serde(rename = "UPLOAD_SENSOR_BATCH")]
    UploadSensorBatch,
    #[serde(rename = "RECORD_LOCATION")]
    RecordLocation,
    #[serde(rename = "UPDATE_PUSH_TOKEN")]
    UpdatePushToken,
}

impl CommandType {
    pub const ALL: [CommandType; 6] = [
        CommandType::StartShift,
        CommandType::EndShift,
        CommandType::UploadPhoto,
        CommandType::UploadSensorBatch,
        CommandType::RecordLocation,
        CommandType::UpdatePushToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartShift => "START_SHIFT",
            Self::EndShift => "END_SHIFT",
            Self::UploadPhoto => "UPLOAD_PHOTO",
            Self::UploadSensorBatch => "UPLOAD_SENSOR_BATCH",
            Self::RecordLocation => "RECORD_LOCATION",
            Self::UpdatePushToken => "UPDATE_PUSH_TOKEN",
        }
    }

    /// Mutations whose conflicts are settled by taking the server's state.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::RecordLocation | Self::UploadSensorBatch)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|command_type| command_type.as_str() == value)
            .ok_or_else(|| SyncError::Decode(format!("unknown command type '{}'", value)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartShiftPayload {
    pub local_shift_id: String,
    pub site_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndShiftPayload {
    pub local_shift_id: String,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPhotoPayload {
    pub local_photo_id: String,
    #[serde(default)]
    pub local_shift_id: Option<String>,
    pub file_path: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorBatchPayload {
    pub batch_id: String,
    #[serde(default)]
    pub local_shift_id: Option<String>,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub sample_id: String,
    #[serde(default)]
    pub local_shift_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTokenPayload {
    pub token: String,
    pub platform: String,
}

/// A mutation the client wants the authority to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartShift(StartShiftPayload),
    EndShift(EndShiftPayload),
    UploadPhoto(UploadPhotoPayload),
    UploadSensorBatch(SensorBatchPayload),
    RecordLocation(LocationPayload),
    UpdatePushToken(PushTokenPayload),
}

/// Verdict of a single execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success {
        server_entity_id: Option<String>,
        reconciliation_data: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Failure {
        error: String,
        should_retry: bool,
    },
    /// The authority rejected the optimistic assumption; `server_data` is the
    /// raw conflict body.
    Conflict { server_data: String },
}

impl CommandResult {
    pub fn success() -> Self {
        Self::Success {
            server_entity_id: None,
            reconciliation_data: None,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            should_retry: true,
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            should_retry: false,
        }
    }

    /// Maps a transport response onto the engine's verdict.
    pub fn from_transport(
        response: std::result::Result<RemoteEnvelope, TransportError>,
    ) -> Self {
        let envelope = match response {
            Ok(envelope) => envelope,
            Err(err) => return Self::retryable(err.to_string()),
        };

        if envelope.is_success() {
            let reconciliation_data = envelope
                .body
                .as_ref()
                .and_then(|body| body.as_object())
                .cloned();
            return Self::Success {
                server_entity_id: envelope.entity_id(),
                reconciliation_data,
            };
        }

        if envelope.is_conflict() {
            let server_data = envelope
                .body
                .as_ref()
                .map(|body| body.to_string())
                .unwrap_or_default();
            return Self::Conflict { server_data };
        }

        Self::Failure {
            error: envelope.describe(),
            should_retry: envelope.is_retryable(),
        }
    }
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::StartShift(_) => CommandType::StartShift,
            Self::EndShift(_) => CommandType::EndShift,
            Self::UploadPhoto(_) => CommandType::UploadPhoto,
            Self::UploadSensorBatch(_) => CommandType::UploadSensorBatch,
            Self::RecordLocation(_) => CommandType::RecordLocation,
            Self::UpdatePushToken(_) => CommandType::UpdatePushToken,
        }
    }

    /// Key under which the queue admits this logical operation at most once.
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::StartShift(p) => format!("start_shift:{}", p.local_shift_id),
            Self::EndShift(p) => format!("end_shift:{}", p.local_shift_id),
            Self::UploadPhoto(p) => format!("upload_photo:{}", p.local_photo_id),
            Self::UploadSensorBatch(p) => format!("sensor_batch:{}", p.batch_id),
            Self::RecordLocation(p) => format!("location:{}", p.sample_id),
            Self::UpdatePushToken(p) => format!("push_token:{}", p.token),
        }
    }

    /// Placeholder id of the entity this command created locally, if any.
    pub fn temp_entity_id(&self) -> Option<String> {
        match self {
            Self::StartShift(p) => Some(p.local_shift_id.clone()),
            Self::UploadPhoto(p) => Some(p.local_photo_id.clone()),
            _ => None,
        }
    }

    pub fn encode_payload(&self) -> Result<String> {
        let json = match self {
            Self::StartShift(p) => serde_json::to_string(p),
            Self::EndShift(p) => serde_json::to_string(p),
            Self::UploadPhoto(p) => serde_json::to_string(p),
            Self::UploadSensorBatch(p) => serde_json::to_string(p),
            Self::RecordLocation(p) => serde_json::to_string(p),
            Self::UpdatePushToken(p) => serde_json::to_string(p),
        };
        json.map_err(|err| {
            SyncError::Serialization(format!("encode {} payload: {}", self.command_type(), err))
        })
    }

    /// Rebuilds a command from its persisted form.
    ///
    /// A failure here is structural: retrying cannot fix it.
    pub fn decode(command_type: CommandType, payload: &str) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(
            command_type: CommandType,
            payload: &str,
        ) -> Result<T> {
            serde_json::from_str(payload).map_err(|err| {
                SyncError::Decode(format!("{} payload: {}", command_type, err))
            })
        }

        Ok(match command_type {
            CommandType::StartShift => Self::StartShift(parse(command_type, payload)?),
            CommandType::EndShift => Self::EndShift(parse(command_type, payload)?),
            CommandType::UploadPhoto => Self::UploadPhoto(parse(command_type, payload)?),
            CommandType::UploadSensorBatch => {
                Self::UploadSensorBatch(parse(command_type, payload)?)
            }
            CommandType::RecordLocation => Self::RecordLocation(parse(command_type, payload)?),
            CommandType::UpdatePushToken => Self::UpdatePushToken(parse(command_type, payload)?),
        })
    }

    /// Runs the command against the authority.
    ///
    /// Shift references are resolved through `local` first; a shift the
    /// authority has not confirmed yet makes the attempt retryable.
    pub async fn execute(
        &self,
        transport: &dyn RemoteTransport,
        local: &dyn LocalEntityStore,
    ) -> CommandResult {
        match self {
            Self::StartShift(p) => CommandResult::from_transport(transport.start_shift(p).await),
            Self::EndShift(p) => {
                let server_shift_id = match resolve_required(local, &p.local_shift_id).await {
                    Ok(id) => id,
                    Err(result) => return result,
                };
                CommandResult::from_transport(transport.end_shift(&server_shift_id, p).await)
            }
            Self::UploadPhoto(p) => {
                let server_shift_id = match resolve_optional(local, &p.local_shift_id).await {
                    Ok(id) => id,
                    Err(result) => return result,
                };
                CommandResult::from_transport(
                    transport.upload_photo(server_shift_id.as_deref(), p).await,
                )
            }
            Self::UploadSensorBatch(p) => {
                let server_shift_id = match resolve_optional(local, &p.local_shift_id).await {
                    Ok(id) => id,
                    Err(result) => return result,
                };
                CommandResult::from_transport(
                    transport
                        .upload_sensor_batch(server_shift_id.as_deref(), p)
                        .await,
                )
            }
            Self::RecordLocation(p) => {
                let server_shift_id = match resolve_optional(local, &p.local_shift_id).await {
                    Ok(id) => id,
                    Err(result) => return result,
                };
                CommandResult::from_transport(
                    transport.record_location(server_shift_id.as_deref(), p).await,
                )
            }
            Self::UpdatePushToken(p) => {
                CommandResult::from_transport(transport.update_push_token(p).await)
            }
        }
    }
}

async fn resolve_required(
    local: &dyn LocalEntityStore,
    local_shift_id: &str,
) -> std::result::Result<String, CommandResult> {
    match local.resolve_server_id(local_shift_id).await {
        Ok(Some(server_id)) => Ok(server_id),
        Ok(None) => Err(CommandResult::retryable(format!(
            "shift '{}' not yet confirmed by server",
            local_shift_id
        ))),
        Err(err) => Err(CommandResult::retryable(err.to_string())),
    }
}

async fn resolve_optional(
    local: &dyn LocalEntityStore,
    local_shift_id: &Option<String>,
) -> std::result::Result<Option<String>, CommandResult> {
    match local_shift_id {
        Some(id) => resolve_required(local, id).await.map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_envelope_keeps_raw_body() {
        let result = CommandResult::from_transport(Ok(RemoteEnvelope::conflict(
            json!({"status": "ACTIVE", "serverEntityId": "9"}),
        )));
        match result {
            CommandResult::Conflict { server_data } => {
                let parsed: serde_json::Value = serde_json::from_str(&server_data).unwrap();
                assert_eq!(parsed["status"], "ACTIVE");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn transport_errors_are_retryable() {
        let result = CommandResult::from_transport(Err(TransportError::Timeout(30_000)));
        assert!(matches!(
            result,
            CommandResult::Failure {
                should_retry: true,
                ..
            }
        ));
    }

    #[test]
    fn client_errors_are_permanent() {
        let result = CommandResult::from_transport(Ok(RemoteEnvelope::new(400, None)));
        assert_eq!(result, CommandResult::permanent("HTTP 400"));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = Command::decode(CommandType::StartShift, "{\"siteId\": 1}").unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn type_tags_round_trip_through_from_str() {
        for command_type in CommandType::ALL {
            assert_eq!(command_type.as_str().parse::<CommandType>().unwrap(), command_type);
        }
        assert!("DELETE_EVERYTHING".parse::<CommandType>().is_err());
    }
}
