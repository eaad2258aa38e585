use super::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability mode for journal appends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Every append is fsynced before the operation is acknowledged.
    Strict,
    /// Appends are flushed immediately but fsynced at most every `sync_interval_ms`.
    Eventual { sync_interval_ms: u64 },
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Bounded retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a mutation is quarantined.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Controls how the engine drains the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainPolicy {
    /// Delay between consecutive executions inside `drain_all`.
    pub throttle_ms: u64,
    /// A mutation executing longer than this is treated as crashed by `cleanup`.
    pub max_execution_ms: u64,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            max_execution_ms: 5 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Write a snapshot and compact the journal after this many appends.
    pub snapshot_every_ops: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_every_ops: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Default age after which quarantined mutations are removed by `cleanup`.
    pub retention_days: u32,
    /// Number of reconciliation misses kept for inspection.
    pub max_reconciliation_misses: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 7,
            max_reconciliation_misses: 256,
        }
    }
}

/// Full configuration of a queue instance.
///
/// Every section has a default, so a JSON file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueuePolicy {
    pub durability: DurabilityMode,
    pub retry: RetryPolicy,
    pub drain: DrainPolicy,
    pub snapshot: SnapshotPolicy,
    pub retention: RetentionPolicy,
}

impl QueuePolicy {
    /// Loads a policy from a JSON file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            SyncError::InvalidConfig(format!("read '{}': {}", path.display(), err))
        })?;
        let policy = serde_json::from_slice::<Self>(&bytes).map_err(|err| {
            SyncError::InvalidConfig(format!("parse '{}': {}", path.display(), err))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Rejects values that would break the queue's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_retries must be >= 1".to_string(),
            ));
        }
        if self.snapshot.snapshot_every_ops == 0 {
            return Err(SyncError::InvalidConfig(
                "snapshot.snapshot_every_ops must be >= 1".to_string(),
            ));
        }
        if let DurabilityMode::Eventual { sync_interval_ms } = self.durability {
            if sync_interval_ms == 0 {
                return Err(SyncError::InvalidConfig(
                    "durability sync_interval_ms must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn throttle_ms(mut self, throttle_ms: u64) -> Self {
        self.drain.throttle_ms = throttle_ms;
        self
    }

    pub fn max_execution_ms(mut self, max_execution_ms: u64) -> Self {
        self.drain.max_execution_ms = max_execution_ms;
        self
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn snapshot_every_ops(mut self, ops: usize) -> Self {
        self.snapshot.snapshot_every_ops = ops;
        self
    }
}
