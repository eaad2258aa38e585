//! Per-command policy for conflicts reported by the authority.

use crate::command::transport::read_entity_id;
use crate::command::{Command, CommandType};
use crate::core::{Result, SyncError};
use crate::local::LocalEntityStore;
use crate::reconcile::{ReconcileOutcome, ReconciliationMapper};
use crate::store::QueuedMutation;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Level, event};

/// Structured part of a conflict body. Every field is optional; which ones
/// matter depends on the command type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictPayload {
    pub conflict_type: Option<String>,
    pub status: Option<String>,
    /// Read from `id`, `serverId` or `serverEntityId`, first match wins.
    pub server_entity_id: Option<String>,
    /// Read from `endedAt`, falling back to `closedAt`.
    pub ended_at: Option<DateTime<Utc>>,
}

impl ConflictPayload {
    pub fn parse(server_data: &str) -> Result<Self> {
        let body = serde_json::from_str::<serde_json::Value>(server_data)
            .map_err(|err| SyncError::Decode(format!("conflict payload: {}", err)))?;
        let Some(fields) = body.as_object() else {
            return Err(SyncError::Decode(
                "conflict payload: expected a JSON object".to_string(),
            ));
        };

        let text = |field: &str| {
            fields
                .get(field)
                .and_then(|value| value.as_str())
                .map(str::to_string)
        };

        let ended_at = match ["endedAt", "closedAt"]
            .iter()
            .find_map(|field| fields.get(*field).filter(|value| !value.is_null()))
        {
            Some(value) => Some(
                serde_json::from_value::<DateTime<Utc>>(value.clone()).map_err(|err| {
                    SyncError::Decode(format!("conflict payload endedAt: {}", err))
                })?,
            ),
            None => None,
        };

        Ok(Self {
            conflict_type: text("conflictType"),
            status: text("status"),
            server_entity_id: read_entity_id(fields),
            ended_at,
        })
    }

    /// True when either `conflictType` or `status` names one of `markers`.
    fn indicates(&self, markers: &[&str]) -> bool {
        [self.conflict_type.as_deref(), self.status.as_deref()]
            .into_iter()
            .flatten()
            .any(|value| markers.iter().any(|marker| value.eq_ignore_ascii_case(marker)))
    }

    fn server_id(&self) -> Option<String> {
        self.server_entity_id.clone()
    }
}

const ALREADY_ACTIVE: &[&str] = &["ACTIVE", "ALREADY_ACTIVE"];
const REJECTED: &[&str] = &["REJECTED", "DENIED"];
const NOT_FOUND: &[&str] = &["NOT_FOUND"];
const ALREADY_CLOSED: &[&str] = &["ALREADY_CLOSED", "ALREADY_ENDED", "CLOSED", "COMPLETED"];

/// Terminal action chosen for a conflicted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The authority already had the entity; local row bound to its id.
    Reconciled { server_entity_id: String },
    /// The authority refused the creation; local row cancelled.
    RolledBack,
    /// The authority never saw the entity; local row removed.
    DeletedLocal,
    /// Local closing fields replaced with the authority's.
    OverwrittenLocal,
    /// Best-effort mutation dropped in favour of server state.
    AcceptedServer,
    /// No safe automatic action; the mutation must be quarantined.
    Quarantine { reason: String },
}

impl ConflictResolution {
    pub fn is_quarantine(&self) -> bool {
        matches!(self, Self::Quarantine { .. })
    }
}

#[derive(Clone)]
pub struct ConflictResolver {
    local: Arc<dyn LocalEntityStore>,
    mapper: ReconciliationMapper,
}

impl ConflictResolver {
    pub fn new(local: Arc<dyn LocalEntityStore>, mapper: ReconciliationMapper) -> Self {
        Self { local, mapper }
    }

    /// Decides and applies the resolution for one conflict.
    ///
    /// Never fails: errors while resolving become a quarantine carrying the
    /// raw conflict body.
    pub async fn resolve(&self, mutation: &QueuedMutation, server_data: &str) -> ConflictResolution {
        let resolution = match self.try_resolve(mutation, server_data).await {
            Ok(Some(resolution)) => resolution,
            Ok(None) => ConflictResolution::Quarantine {
                reason: format!(
                    "unresolved {} conflict: {}",
                    mutation.command_type, server_data
                ),
            },
            Err(err) => ConflictResolution::Quarantine {
                reason: format!(
                    "conflict resolution failed for {}: {}; server data: {}",
                    mutation.command_type, err, server_data
                ),
            },
        };

        event!(
            Level::INFO,
            mutation_id = %mutation.id,
            command_type = %mutation.command_type,
            resolution = ?resolution,
            "conflict resolved"
        );
        resolution
    }

    async fn try_resolve(
        &self,
        mutation: &QueuedMutation,
        server_data: &str,
    ) -> Result<Option<ConflictResolution>> {
        if mutation.command_type.is_best_effort() {
            return Ok(Some(ConflictResolution::AcceptedServer));
        }

        let payload = ConflictPayload::parse(server_data)?;
        match mutation.command_type {
            CommandType::StartShift => self.resolve_creation(mutation, &payload).await,
            CommandType::EndShift => self.resolve_termination(mutation, &payload).await,
            _ => Ok(None),
        }
    }

    async fn resolve_creation(
        &self,
        mutation: &QueuedMutation,
        payload: &ConflictPayload,
    ) -> Result<Option<ConflictResolution>> {
        let temp_id = match mutation.temp_entity_id.clone() {
            Some(id) => id,
            None => match mutation.decode()? {
                Command::StartShift(start) => start.local_shift_id,
                _ => return Ok(None),
            },
        };

        if payload.indicates(REJECTED) {
            if !self.local.cancel_shift(&temp_id).await? {
                event!(Level::WARN, temp_entity_id = %temp_id, "rejected shift missing locally");
            }
            return Ok(Some(ConflictResolution::RolledBack));
        }

        if payload.indicates(ALREADY_ACTIVE) {
            let Some(server_id) = payload.server_id() else {
                return Ok(None);
            };
            let outcome = self
                .mapper
                .apply(mutation.command_type, &temp_id, &server_id)
                .await?;
            return Ok(match outcome {
                ReconcileOutcome::Applied | ReconcileOutcome::AlreadyApplied => {
                    Some(ConflictResolution::Reconciled {
                        server_entity_id: server_id,
                    })
                }
                ReconcileOutcome::Missing | ReconcileOutcome::Unsupported(_) => None,
            });
        }

        Ok(None)
    }

    async fn resolve_termination(
        &self,
        mutation: &QueuedMutation,
        payload: &ConflictPayload,
    ) -> Result<Option<ConflictResolution>> {
        let Command::EndShift(end) = mutation.decode()? else {
            return Ok(None);
        };

        if payload.indicates(NOT_FOUND) {
            self.local.delete_shift(&end.local_shift_id).await?;
            return Ok(Some(ConflictResolution::DeletedLocal));
        }

        if payload.indicates(ALREADY_CLOSED) {
            let Some(ended_at) = payload.ended_at else {
                return Ok(None);
            };
            if !self.local.close_shift(&end.local_shift_id, ended_at).await? {
                return Ok(None);
            }
            return Ok(Some(ConflictResolution::OverwrittenLocal));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accepts_server_id_aliases() {
        let payload = ConflictPayload::parse(r#"{"status":"ACTIVE","serverId":17}"#).unwrap();
        assert_eq!(payload.server_id(), Some("17".to_string()));

        let payload = ConflictPayload::parse(r#"{"status":"ACTIVE","id":"abc"}"#).unwrap();
        assert_eq!(payload.server_id(), Some("abc".to_string()));
    }

    #[test]
    fn payload_with_several_id_fields_takes_the_first() {
        let payload =
            ConflictPayload::parse(r#"{"status":"ACTIVE","id":"42","serverEntityId":"42"}"#)
                .unwrap();
        assert_eq!(payload.server_id(), Some("42".to_string()));

        let payload =
            ConflictPayload::parse(r#"{"serverEntityId":"9","serverId":8,"closedAt":null}"#)
                .unwrap();
        assert_eq!(payload.server_id(), Some("8".to_string()));
        assert_eq!(payload.ended_at, None);
    }

    #[test]
    fn markers_match_either_field_case_insensitively() {
        let payload = ConflictPayload::parse(r#"{"conflictType":"not_found"}"#).unwrap();
        assert!(payload.indicates(NOT_FOUND));
        assert!(!payload.indicates(ALREADY_CLOSED));

        let payload = ConflictPayload::parse(r#"{"status":"DENIED"}"#).unwrap();
        assert!(payload.indicates(REJECTED));
    }

    #[test]
    fn non_json_payload_is_a_decode_error() {
        assert!(matches!(
            ConflictPayload::parse("<html>conflict</html>"),
            Err(SyncError::Decode(_))
        ));
    }
}
