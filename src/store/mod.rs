//! Durable, ordered storage of queued mutations.
//!
//! State lives in memory and is made durable through an append-only JSON
//! journal plus a periodic snapshot. Opening a store replays the snapshot and
//! every journal record written after it.

mod mutation;

use crate::command::CommandType;
use crate::core::{DurabilityMode, QueuePolicy, Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{Level, event};

pub use mutation::{MutationState, QueuedMutation, ReconciliationMiss};

const QUEUE_SNAPSHOT_FILE: &str = "queue_snapshot.json";
const QUEUE_JOURNAL_FILE: &str = "queue_journal.log";
const QUEUE_FORMAT_VERSION: u16 = 1;

/// Operations recorded in the queue journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueJournalOp {
    Upsert { mutation: QueuedMutation },
    Delete { id: String, reason: String },
    /// Removes one row and inserts another as a single durable step.
    Replace {
        removed_id: String,
        mutation: QueuedMutation,
    },
    MissRecorded { miss: ReconciliationMiss },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJournalRecord {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub op: QueueJournalOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshotFile {
    pub format_version: u16,
    pub created_at_unix_ms: i64,
    pub last_seq: u64,
    pub mutations: Vec<QueuedMutation>,
    #[serde(default)]
    pub reconciliation_misses: Vec<ReconciliationMiss>,
}

/// Aggregate view of the quarantined rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct QuarantineStats {
    pub total: usize,
    pub by_type: BTreeMap<CommandType, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub executing: usize,
    pub reconciling: usize,
    pub quarantined: usize,
    pub reconciliation_backlog: usize,
    pub reconciliation_misses: usize,
    pub next_seq: u64,
    pub ops_since_snapshot: usize,
}

#[derive(Debug, Clone)]
pub struct QueuePaths {
    pub root_dir: PathBuf,
    pub snapshot_file: PathBuf,
    pub journal_file: PathBuf,
}

/// The queue's single source of truth.
///
/// Callers share it behind a mutex; every method that changes state appends
/// to the journal before touching memory, so a failed append leaves the
/// in-memory view unchanged.
pub struct QueueStore {
    root_dir: PathBuf,
    policy: QueuePolicy,
    mutations: HashMap<String, QueuedMutation>,
    idempotency_index: HashMap<String, String>,
    misses: VecDeque<ReconciliationMiss>,
    next_mutation_seq: u64,
    seq_next: u64,
    ops_since_snapshot: usize,
    last_sync_unix_ms: i64,
    pending_tx: watch::Sender<usize>,
    backlog_tx: watch::Sender<Vec<QueuedMutation>>,
}

impl QueueStore {
    /// Opens the store at `root_dir`, creating it when missing.
    pub async fn open(root_dir: impl Into<PathBuf>, policy: QueuePolicy) -> Result<Self> {
        policy.validate()?;
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).await?;

        let (pending_tx, _) = watch::channel(0usize);
        let (backlog_tx, _) = watch::channel(Vec::new());
        let mut store = Self {
            root_dir,
            policy,
            mutations: HashMap::new(),
            idempotency_index: HashMap::new(),
            misses: VecDeque::new(),
            next_mutation_seq: 1,
            seq_next: 1,
            ops_since_snapshot: 0,
            last_sync_unix_ms: Utc::now().timestamp_millis(),
            pending_tx,
            backlog_tx,
        };

        store.load_from_disk().await?;
        store.publish();
        event!(
            Level::INFO,
            root = %store.root_dir.display(),
            mutations = store.mutations.len(),
            "queue store opened"
        );
        Ok(store)
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn paths(&self) -> QueuePaths {
        QueuePaths {
            root_dir: self.root_dir.clone(),
            snapshot_file: self.snapshot_path(),
            journal_file: self.journal_path(),
        }
    }

    /// Persists a new mutation.
    ///
    /// Returns `false` without writing anything when another row already
    /// holds the same idempotency key.
    pub async fn insert(&mut self, mut mutation: QueuedMutation) -> Result<bool> {
        if let Some(key) = mutation.idempotency_key.as_deref() {
            if self.idempotency_index.contains_key(key) {
                event!(Level::DEBUG, idempotency_key = %key, "duplicate enqueue dropped");
                return Ok(false);
            }
        }
        if self.mutations.contains_key(&mutation.id) {
            return Err(SyncError::Storage(format!(
                "mutation '{}' already exists",
                mutation.id
            )));
        }

        mutation.sequence = self.next_mutation_seq;
        self.append_record(QueueJournalOp::Upsert {
            mutation: mutation.clone(),
        })
        .await?;
        self.apply_upsert(mutation);
        self.after_write().await?;
        Ok(true)
    }

    /// Atomically selects the oldest pending row and marks it executing.
    pub async fn claim_next(&mut self) -> Result<Option<QueuedMutation>> {
        let Some(id) = self
            .ordered()
            .into_iter()
            .find(|m| m.is_pending())
            .map(|m| m.id.clone())
        else {
            return Ok(None);
        };

        let mut claimed = self.require(&id)?.clone();
        claimed.begin_execution(Utc::now())?;
        self.put(claimed.clone()).await?;
        Ok(Some(claimed))
    }

    /// Writes the full row, replacing the stored version.
    pub async fn put(&mut self, mutation: QueuedMutation) -> Result<()> {
        self.require(&mutation.id)?;
        self.append_record(QueueJournalOp::Upsert {
            mutation: mutation.clone(),
        })
        .await?;
        self.apply_upsert(mutation);
        self.after_write().await
    }

    /// Deletes a row; returns `false` when it did not exist.
    pub async fn remove(&mut self, id: &str, reason: &str) -> Result<bool> {
        if !self.mutations.contains_key(id) {
            return Ok(false);
        }
        self.append_record(QueueJournalOp::Delete {
            id: id.to_string(),
            reason: reason.to_string(),
        })
        .await?;
        self.apply_delete(id);
        event!(Level::DEBUG, mutation_id = %id, reason = %reason, "mutation deleted");
        self.after_write().await?;
        Ok(true)
    }

    /// Swaps `removed_id` for `mutation` in one journal record.
    pub async fn replace(&mut self, removed_id: &str, mut mutation: QueuedMutation) -> Result<()> {
        self.require(removed_id)?;
        mutation.sequence = self.next_mutation_seq;
        self.append_record(QueueJournalOp::Replace {
            removed_id: removed_id.to_string(),
            mutation: mutation.clone(),
        })
        .await?;
        self.apply_delete(removed_id);
        self.apply_upsert(mutation);
        self.after_write().await
    }

    pub async fn record_miss(&mut self, miss: ReconciliationMiss) -> Result<()> {
        self.append_record(QueueJournalOp::MissRecorded { miss: miss.clone() })
            .await?;
        self.apply_miss(miss);
        self.after_write().await
    }

    /// Returns every row left executing by a previous process to the
    /// pending pool. Retry counters are left untouched.
    pub async fn reset_interrupted(&mut self) -> Result<Vec<String>> {
        let interrupted = self
            .ordered()
            .into_iter()
            .filter(|m| m.is_executing())
            .map(|m| m.id.clone())
            .collect::<Vec<_>>();
        self.release_all(&interrupted).await?;
        Ok(interrupted)
    }

    /// Returns rows executing since before `cutoff` to the pending pool.
    pub async fn reset_stuck(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let stuck = self
            .ordered()
            .into_iter()
            .filter(|m| m.executing_since().is_some_and(|since| since < cutoff))
            .map(|m| m.id.clone())
            .collect::<Vec<_>>();
        self.release_all(&stuck).await?;
        Ok(stuck)
    }

    async fn release_all(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            let mut mutation = self.require(id)?.clone();
            mutation.release()?;
            self.put(mutation).await?;
        }
        Ok(())
    }

    fn require(&self, id: &str) -> Result<&QueuedMutation> {
        self.mutations
            .get(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    fn apply_upsert(&mut self, mutation: QueuedMutation) {
        self.next_mutation_seq = self.next_mutation_seq.max(mutation.sequence.saturating_add(1));
        if let Some(previous) = self.mutations.get(&mutation.id) {
            if let Some(key) = previous.idempotency_key.as_deref() {
                self.idempotency_index.remove(key);
            }
        }
        if let Some(key) = mutation.idempotency_key.clone() {
            self.idempotency_index.insert(key, mutation.id.clone());
        }
        self.mutations.insert(mutation.id.clone(), mutation);
    }

    fn apply_delete(&mut self, id: &str) {
        if let Some(removed) = self.mutations.remove(id) {
            if let Some(key) = removed.idempotency_key.as_deref() {
                if self.idempotency_index.get(key).map(String::as_str) == Some(id) {
                    self.idempotency_index.remove(key);
                }
            }
        }
    }

    fn apply_miss(&mut self, miss: ReconciliationMiss) {
        self.misses.push_back(miss);
        let cap = self.policy.retention.max_reconciliation_misses.max(1);
        while self.misses.len() > cap {
            self.misses.pop_front();
        }
    }

    async fn after_write(&mut self) -> Result<()> {
        self.publish();
        self.maybe_snapshot_and_compact().await
    }

    /// Pushes the current counts to subscribers.
    fn publish(&self) {
        self.pending_tx.send_replace(self.pending_count());
        let backlog = self.unreconciled();
        self.backlog_tx.send_if_modified(|current| {
            if *current == backlog {
                return false;
            }
            *current = backlog;
            true
        });
    }
}

include!("journal_and_snapshot.rs");
include!("queries.rs");
