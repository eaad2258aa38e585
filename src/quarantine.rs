//! Dead-letter holding area for mutations that cannot succeed on their own.

use crate::core::Result;
use crate::store::{QuarantineStats, QueueStore, QueuedMutation};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineRetryOutcome {
    /// A fresh pending copy was admitted under `new_id`.
    Requeued { new_id: String },
    NotFound,
}

/// Operator-facing view over quarantined rows of a [`QueueStore`].
#[derive(Clone)]
pub struct DeadLetterQuarantine {
    store: Arc<Mutex<QueueStore>>,
}

impl DeadLetterQuarantine {
    pub fn new(store: Arc<Mutex<QueueStore>>) -> Self {
        Self { store }
    }

    /// Moves a mutation into quarantine with `reason` as its last error.
    pub async fn admit(&self, mut mutation: QueuedMutation, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        mutation.quarantine(reason.clone(), Utc::now());
        event!(
            Level::WARN,
            mutation_id = %mutation.id,
            command_type = %mutation.command_type,
            reason = %reason,
            "mutation quarantined"
        );
        self.store.lock().await.put(mutation).await
    }

    pub async fn list(&self) -> Vec<QueuedMutation> {
        self.store.lock().await.list_quarantined()
    }

    pub async fn stats(&self) -> QuarantineStats {
        self.store.lock().await.quarantine_stats()
    }

    /// Re-admits a copy of a quarantined mutation with a clean retry budget.
    pub async fn retry(&self, quarantined_id: &str) -> Result<QuarantineRetryOutcome> {
        let mut store = self.store.lock().await;
        let Some(quarantined) = store.get(quarantined_id).filter(|m| m.is_quarantined()) else {
            return Ok(QuarantineRetryOutcome::NotFound);
        };

        let copy = quarantined.requeued_copy();
        let new_id = copy.id.clone();
        store.replace(quarantined_id, copy).await?;
        event!(
            Level::INFO,
            quarantined_id = %quarantined_id,
            new_id = %new_id,
            "quarantined mutation requeued"
        );
        Ok(QuarantineRetryOutcome::Requeued { new_id })
    }

    /// Drops one quarantined mutation for good.
    pub async fn discard(&self, quarantined_id: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        if !store.get(quarantined_id).is_some_and(|m| m.is_quarantined()) {
            return Ok(false);
        }
        store.remove(quarantined_id, "quarantine discard").await
    }

    /// Removes quarantined mutations created before `cutoff`.
    pub async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut store = self.store.lock().await;
        let expired = store
            .list_quarantined()
            .into_iter()
            .filter(|m| m.created_at < cutoff)
            .map(|m| m.id)
            .collect::<Vec<_>>();
        for id in &expired {
            store.remove(id, "quarantine retention expired").await?;
        }
        Ok(expired.len())
    }
}
