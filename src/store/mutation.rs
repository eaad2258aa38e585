use crate::command::{Command, CommandType};
use crate::core::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a mutation is in its lifecycle.
///
/// `Pending -> Executing -> {Pending, Reconciling -> Reconciled, Quarantined}`;
/// every terminal success path ends with the row being deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    Executing { started_at: DateTime<Utc> },
    /// The authority assigned an id; local rows are being updated.
    Reconciling { server_entity_id: String },
    /// Local rows carry the authority id; the row is about to be deleted.
    Reconciled { server_entity_id: String },
    Quarantined { quarantined_at: DateTime<Utc> },
}

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub command_type: CommandType,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// Tie-breaker for mutations enqueued within the same instant.
    #[serde(default)]
    pub sequence: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: MutationState,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub temp_entity_id: Option<String>,
}

impl QueuedMutation {
    pub fn new(
        command: &Command,
        idempotency_key: Option<String>,
        temp_entity_id: Option<String>,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            command_type: command.command_type(),
            payload: command.encode_payload()?,
            created_at: Utc::now(),
            sequence: 0,
            retry_count: 0,
            max_retries: max_retries.max(1),
            state: MutationState::Pending,
            last_error: None,
            idempotency_key,
            temp_entity_id,
        })
    }

    pub fn decode(&self) -> Result<Command> {
        Command::decode(self.command_type, &self.payload)
    }

    pub fn is_pending(&self) -> bool {
        self.state == MutationState::Pending
    }

    pub fn is_executing(&self) -> bool {
        matches!(self.state, MutationState::Executing { .. })
    }

    pub fn is_reconciled(&self) -> bool {
        matches!(self.state, MutationState::Reconciled { .. })
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self.state, MutationState::Quarantined { .. })
    }

    pub fn server_entity_id(&self) -> Option<&str> {
        match &self.state {
            MutationState::Reconciling { server_entity_id }
            | MutationState::Reconciled { server_entity_id } => Some(server_entity_id),
            _ => None,
        }
    }

    pub fn executing_since(&self) -> Option<DateTime<Utc>> {
        match self.state {
            MutationState::Executing { started_at } => Some(started_at),
            _ => None,
        }
    }

    /// Whether this row still waits for an authority id for its temp entity.
    ///
    /// Quarantined rows count: their temp entity is still unmapped and repair
    /// tooling has to find them through the backlog.
    pub fn awaits_reconciliation(&self) -> bool {
        self.temp_entity_id.is_some() && self.server_entity_id().is_none()
    }

    pub(crate) fn begin_execution(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_state(MutationState::Pending, "begin execution")?;
        self.state = MutationState::Executing { started_at: now };
        Ok(())
    }

    /// Returns an interrupted or released claim to the pool without
    /// consuming a retry.
    pub(crate) fn release(&mut self) -> Result<()> {
        if !self.is_executing() {
            return Err(self.illegal("release"));
        }
        self.state = MutationState::Pending;
        Ok(())
    }

    /// Counts a failed attempt. Returns `false` when the retry budget is
    /// spent and the caller must quarantine instead.
    pub(crate) fn record_failed_attempt(&mut self, error: impl Into<String>) -> Result<bool> {
        if !self.is_executing() {
            return Err(self.illegal("record failed attempt"));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        if self.retry_count >= self.max_retries {
            return Ok(false);
        }
        self.state = MutationState::Pending;
        Ok(true)
    }

    pub(crate) fn begin_reconciliation(&mut self, server_entity_id: impl Into<String>) -> Result<()> {
        if !self.is_executing() {
            return Err(self.illegal("begin reconciliation"));
        }
        self.state = MutationState::Reconciling {
            server_entity_id: server_entity_id.into(),
        };
        Ok(())
    }

    pub(crate) fn mark_reconciled(&mut self) -> Result<()> {
        let MutationState::Reconciling { server_entity_id } = &self.state else {
            return Err(self.illegal("mark reconciled"));
        };
        self.state = MutationState::Reconciled {
            server_entity_id: server_entity_id.clone(),
        };
        Ok(())
    }

    /// Moves the row to quarantine with the retry counter pinned past its bound.
    pub(crate) fn quarantine(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count = self.max_retries.saturating_add(1);
        self.last_error = Some(reason.into());
        self.state = MutationState::Quarantined { quarantined_at: now };
    }

    /// Fresh pending copy of a quarantined row, used for operator replay.
    pub(crate) fn requeued_copy(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type: self.command_type,
            payload: self.payload.clone(),
            created_at: Utc::now(),
            sequence: 0,
            retry_count: 0,
            max_retries: self.max_retries,
            state: MutationState::Pending,
            last_error: None,
            idempotency_key: self.idempotency_key.clone(),
            temp_entity_id: self.temp_entity_id.clone(),
        }
    }

    fn expect_state(&self, expected: MutationState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(self.illegal(action));
        }
        Ok(())
    }

    fn illegal(&self, action: &str) -> SyncError {
        SyncError::Execution(format!(
            "cannot {} mutation '{}' in state {:?}",
            action, self.id, self.state
        ))
    }
}

/// A server id that could not be applied to local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationMiss {
    pub mutation_id: String,
    pub command_type: CommandType,
    pub temp_entity_id: Option<String>,
    pub server_entity_id: Option<String>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}
