//! Drives queued mutations to the authority, one at a time.

use crate::command::{Command, CommandResult, RemoteTransport};
use crate::conflict::{ConflictResolution, ConflictResolver};
use crate::core::{QueuePolicy, Result, SyncError};
use crate::local::{Connectivity, LocalEntityStore};
use crate::quarantine::{DeadLetterQuarantine, QuarantineRetryOutcome};
use crate::reconcile::ReconciliationMapper;
use crate::store::{
    QuarantineStats, QueueStats, QueueStore, QueuedMutation, ReconciliationMiss,
};
use chrono::{DateTime, Duration, Utc};
use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { id: String },
    /// A row with the same idempotency key already exists; nothing was written.
    Duplicate { existing_id: Option<String> },
}

/// What a single `execute_next` step did to the claimed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// Succeeded and the authority id was applied (or recorded as a miss).
    Reconciled { miss: bool },
    RetryScheduled,
    Quarantined,
    ConflictResolved(ConflictResolution),
    /// Connectivity dropped after the claim; the row went back untouched.
    Released,
    /// The authority id is recorded but local state could not be updated
    /// yet; the next drain resumes it.
    ReconciliationDeferred,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Reconciled { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub purged_quarantined: usize,
    pub reset_stuck: usize,
}

/// Collaborators the engine talks to.
#[derive(Clone)]
pub struct EngineDeps {
    pub transport: Arc<dyn RemoteTransport>,
    pub local: Arc<dyn LocalEntityStore>,
    pub connectivity: Arc<dyn Connectivity>,
}

/// The durable command queue and its reconciliation engine.
///
/// `execute_next` and `drain_all` are single-flight: concurrent callers are
/// serialized on an internal lock, so at most one mutation executes at a time.
pub struct SyncEngine {
    store: Arc<Mutex<QueueStore>>,
    deps: EngineDeps,
    mapper: ReconciliationMapper,
    resolver: ConflictResolver,
    quarantine: DeadLetterQuarantine,
    flight: Mutex<()>,
    policy: QueuePolicy,
    pending_rx: watch::Receiver<usize>,
    backlog_rx: watch::Receiver<Vec<QueuedMutation>>,
}

impl SyncEngine {
    /// Opens the queue at `root_dir` and runs crash recovery.
    pub async fn open(
        root_dir: impl Into<PathBuf>,
        policy: QueuePolicy,
        deps: EngineDeps,
    ) -> Result<Self> {
        let store = QueueStore::open(root_dir, policy).await?;
        Self::with_store(store, deps).await
    }

    pub async fn with_store(store: QueueStore, deps: EngineDeps) -> Result<Self> {
        let policy = store.policy().clone();
        let pending_rx = store.subscribe_pending();
        let backlog_rx = store.subscribe_backlog();
        let store = Arc::new(Mutex::new(store));
        let mapper = ReconciliationMapper::new(deps.local.clone());
        let resolver = ConflictResolver::new(deps.local.clone(), mapper.clone());

        let engine = Self {
            quarantine: DeadLetterQuarantine::new(store.clone()),
            store,
            deps,
            mapper,
            resolver,
            flight: Mutex::new(()),
            policy,
            pending_rx,
            backlog_rx,
        };
        engine.recover().await?;
        Ok(engine)
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn store(&self) -> Arc<Mutex<QueueStore>> {
        self.store.clone()
    }

    pub fn quarantine(&self) -> &DeadLetterQuarantine {
        &self.quarantine
    }

    /// Admits a command to the queue.
    ///
    /// Missing idempotency key or temp id default to the ones the command
    /// derives from its own fields. When online and no drain is running,
    /// one execution is attempted right away; its outcome is recorded on the
    /// row, never returned.
    pub async fn enqueue(
        &self,
        command: Command,
        idempotency_key: Option<String>,
        temp_entity_id: Option<String>,
    ) -> Result<EnqueueOutcome> {
        let idempotency_key = idempotency_key.or_else(|| Some(command.idempotency_key()));
        let temp_entity_id = temp_entity_id.or_else(|| command.temp_entity_id());
        let mutation = QueuedMutation::new(
            &command,
            idempotency_key.clone(),
            temp_entity_id,
            self.policy.retry.max_retries,
        )?;
        let id = mutation.id.clone();

        let outcome = {
            let mut store = self.store.lock().await;
            if store.insert(mutation).await? {
                EnqueueOutcome::Queued { id: id.clone() }
            } else {
                let existing_id = idempotency_key
                    .as_deref()
                    .and_then(|key| store.find_by_idempotency_key(key))
                    .map(|existing| existing.id);
                EnqueueOutcome::Duplicate { existing_id }
            }
        };

        match &outcome {
            EnqueueOutcome::Queued { .. } => event!(
                Level::INFO,
                mutation_id = %id,
                command_type = %command.command_type(),
                "mutation enqueued"
            ),
            EnqueueOutcome::Duplicate { existing_id } => event!(
                Level::DEBUG,
                existing_id = ?existing_id,
                command_type = %command.command_type(),
                "duplicate mutation ignored"
            ),
        }

        if matches!(outcome, EnqueueOutcome::Queued { .. }) && self.deps.connectivity.is_online() {
            if let Ok(flight) = self.flight.try_lock() {
                if let Err(err) = self.step(&flight).await {
                    event!(Level::ERROR, error = %err, "opportunistic execution failed");
                }
            }
        }

        Ok(outcome)
    }

    /// Live count of mutations not yet settled (quarantine excluded).
    pub fn pending_count(&self) -> watch::Receiver<usize> {
        self.pending_rx.clone()
    }

    pub fn pending_count_stream(&self) -> impl Stream<Item = usize> + Send + 'static {
        watch_stream(self.pending_rx.clone())
    }

    /// Live list of mutations whose temp entity still lacks an authority id.
    pub fn reconciliation_backlog(&self) -> watch::Receiver<Vec<QueuedMutation>> {
        self.backlog_rx.clone()
    }

    pub fn reconciliation_backlog_stream(
        &self,
    ) -> impl Stream<Item = Vec<QueuedMutation>> + Send + 'static {
        watch_stream(self.backlog_rx.clone())
    }

    pub async fn quarantine_stats(&self) -> QuarantineStats {
        self.quarantine.stats().await
    }

    pub async fn quarantine_list(&self) -> Vec<QueuedMutation> {
        self.quarantine.list().await
    }

    pub async fn quarantine_retry(&self, quarantined_id: &str) -> Result<QuarantineRetryOutcome> {
        self.quarantine.retry(quarantined_id).await
    }

    pub async fn quarantine_discard(&self, quarantined_id: &str) -> Result<bool> {
        self.quarantine.discard(quarantined_id).await
    }

    pub async fn get(&self, id: &str) -> Option<QueuedMutation> {
        self.store.lock().await.get(id)
    }

    pub async fn list_pending(&self) -> Vec<QueuedMutation> {
        self.store.lock().await.list_active()
    }

    pub async fn reconciliation_misses(&self) -> Vec<ReconciliationMiss> {
        self.store.lock().await.reconciliation_misses()
    }

    pub async fn stats(&self) -> QueueStats {
        self.store.lock().await.stats()
    }
}

/// Yields the current value, then every subsequent change.
fn watch_stream<T>(rx: watch::Receiver<T>) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + Sync + 'static,
{
    futures::stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
}

include!("execution.rs");
include!("maintenance.rs");
