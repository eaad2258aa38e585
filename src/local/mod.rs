//! Local entity tables touched by reconciliation and conflict resolution.

mod connectivity;

use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

pub use connectivity::{Connectivity, ConnectivityFlag};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShiftStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    /// Created or changed offline, not yet confirmed by the authority.
    PendingSync,
    /// Matches the authority's verdict.
    Synced,
}

/// A shift as the device knows it.
///
/// `local_id` is the primary identity other local rows reference; the
/// authority's identifier is attached as `server_id` once known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalShift {
    pub local_id: String,
    pub server_id: Option<String>,
    pub site_id: String,
    pub status: ShiftStatus,
    pub sync_status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl LocalShift {
    /// A shift started offline.
    pub fn started_offline(
        local_id: impl Into<String>,
        site_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            server_id: None,
            site_id: site_id.into(),
            status: ShiftStatus::Active,
            sync_status: SyncStatus::PendingSync,
            started_at,
            ended_at: None,
        }
    }

    fn matches(&self, id: &str) -> bool {
        self.local_id == id || self.server_id.as_deref() == Some(id)
    }
}

/// Write paths the engine needs on the local shift table.
///
/// Lookups accept either the local id or the authority id, so references
/// created before reconciliation keep resolving afterwards. Mutating calls
/// return `false` when the shift does not exist.
#[async_trait]
pub trait LocalEntityStore: Send + Sync {
    async fn find_shift(&self, id: &str) -> Result<Option<LocalShift>>;

    /// Attaches the authority id and marks the shift synced.
    async fn confirm_shift(&self, local_id: &str, server_id: &str) -> Result<bool>;

    /// Rolls the shift back to the terminal cancelled status.
    async fn cancel_shift(&self, local_id: &str) -> Result<bool>;

    /// Overwrites the closing fields with the authority's values.
    async fn close_shift(&self, local_id: &str, ended_at: DateTime<Utc>) -> Result<bool>;

    async fn delete_shift(&self, local_id: &str) -> Result<bool>;

    /// Authority id for a local or authority shift id, if one is known.
    async fn resolve_server_id(&self, id: &str) -> Result<Option<String>>;
}

/// In-memory shift table.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    shifts: RwLock<HashMap<String, LocalShift>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_shift(&self, shift: LocalShift) -> Result<()> {
        let mut shifts = self.shifts.write()?;
        shifts.insert(shift.local_id.clone(), shift);
        Ok(())
    }

    pub fn shift(&self, local_id: &str) -> Result<Option<LocalShift>> {
        Ok(self.shifts.read()?.get(local_id).cloned())
    }

    pub fn shifts(&self) -> Result<Vec<LocalShift>> {
        let mut shifts = self.shifts.read()?.values().cloned().collect::<Vec<_>>();
        shifts.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.local_id.cmp(&b.local_id)));
        Ok(shifts)
    }

    fn update<F>(&self, local_id: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut LocalShift),
    {
        let mut shifts = self.shifts.write()?;
        match shifts.values_mut().find(|shift| shift.matches(local_id)) {
            Some(shift) => {
                apply(shift);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl LocalEntityStore for MemoryLocalStore {
    async fn find_shift(&self, id: &str) -> Result<Option<LocalShift>> {
        let shifts = self.shifts.read()?;
        Ok(shifts.values().find(|shift| shift.matches(id)).cloned())
    }

    async fn confirm_shift(&self, local_id: &str, server_id: &str) -> Result<bool> {
        self.update(local_id, |shift| {
            shift.server_id = Some(server_id.to_string());
            shift.sync_status = SyncStatus::Synced;
        })
    }

    async fn cancel_shift(&self, local_id: &str) -> Result<bool> {
        self.update(local_id, |shift| {
            shift.status = ShiftStatus::Cancelled;
            shift.sync_status = SyncStatus::Synced;
        })
    }

    async fn close_shift(&self, local_id: &str, ended_at: DateTime<Utc>) -> Result<bool> {
        self.update(local_id, |shift| {
            shift.status = ShiftStatus::Completed;
            shift.ended_at = Some(ended_at);
            shift.sync_status = SyncStatus::Synced;
        })
    }

    async fn delete_shift(&self, local_id: &str) -> Result<bool> {
        let mut shifts = self.shifts.write()?;
        let key = shifts
            .values()
            .find(|shift| shift.matches(local_id))
            .map(|shift| shift.local_id.clone());
        Ok(key.and_then(|key| shifts.remove(&key)).is_some())
    }

    async fn resolve_server_id(&self, id: &str) -> Result<Option<String>> {
        let shifts = self.shifts.read()?;
        Ok(shifts
            .values()
            .find(|shift| shift.matches(id))
            .and_then(|shift| shift.server_id.clone()))
    }
}
