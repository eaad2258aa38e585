//! Binds authority-assigned ids to entities created offline.

use crate::command::CommandType;
use crate::core::Result;
use crate::local::{LocalEntityStore, SyncStatus};
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local row now carries the authority id and is marked synced.
    Applied,
    /// Local row already matched; nothing was written.
    AlreadyApplied,
    /// No local row exists under the temp id.
    Missing,
    /// No mapping is defined for this command type.
    Unsupported(CommandType),
}

impl ReconcileOutcome {
    /// Outcomes that must be recorded for inspection.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Missing | Self::Unsupported(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Applied => "applied".to_string(),
            Self::AlreadyApplied => "already applied".to_string(),
            Self::Missing => "local entity not found".to_string(),
            Self::Unsupported(command_type) => {
                format!("reconciliation is not implemented for {}", command_type)
            }
        }
    }
}

/// Applies `(temp id, server id)` pairs to local state.
///
/// The local row keeps its primary identity; the server id is attached
/// next to it so existing references stay valid.
#[derive(Clone)]
pub struct ReconciliationMapper {
    local: Arc<dyn LocalEntityStore>,
}

impl ReconciliationMapper {
    pub fn new(local: Arc<dyn LocalEntityStore>) -> Self {
        Self { local }
    }

    pub async fn apply(
        &self,
        command_type: CommandType,
        temp_entity_id: &str,
        server_entity_id: &str,
    ) -> Result<ReconcileOutcome> {
        let outcome = match command_type {
            CommandType::StartShift => self.apply_shift(temp_entity_id, server_entity_id).await?,
            // Photo records have no local mapping yet.
            other => ReconcileOutcome::Unsupported(other),
        };

        event!(
            Level::DEBUG,
            command_type = %command_type,
            temp_entity_id = %temp_entity_id,
            server_entity_id = %server_entity_id,
            outcome = %outcome.describe(),
            "reconciliation applied"
        );
        Ok(outcome)
    }

    async fn apply_shift(&self, temp_id: &str, server_id: &str) -> Result<ReconcileOutcome> {
        let Some(shift) = self.local.find_shift(temp_id).await? else {
            return Ok(ReconcileOutcome::Missing);
        };

        if shift.server_id.as_deref() == Some(server_id) && shift.sync_status == SyncStatus::Synced
        {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        if self.local.confirm_shift(&shift.local_id, server_id).await? {
            Ok(ReconcileOutcome::Applied)
        } else {
            Ok(ReconcileOutcome::Missing)
        }
    }
}
