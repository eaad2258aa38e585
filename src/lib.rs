// ============================================================================
// shiftsync: offline-first mutation queue
// ============================================================================

pub mod core;
pub mod command;
pub mod local;
pub mod store;
pub mod reconcile;
pub mod conflict;
pub mod quarantine;
pub mod engine;

// Re-export main types for convenience
pub use crate::core::{
    DrainPolicy, DurabilityMode, QueuePolicy, Result, RetentionPolicy, RetryPolicy,
    SnapshotPolicy, SyncError,
};

pub use command::{
    Command, CommandResult, CommandType, EndShiftPayload, LocationPayload, PushTokenPayload,
    RemoteEnvelope, RemoteTransport, SensorBatchPayload, SensorReading, StartShiftPayload,
    TransportError, UploadPhotoPayload,
};

pub use local::{
    Connectivity, ConnectivityFlag, LocalEntityStore, LocalShift, MemoryLocalStore, ShiftStatus,
    SyncStatus,
};

pub use store::{
    MutationState, QuarantineStats, QueuePaths, QueueStats, QueueStore, QueuedMutation,
    ReconciliationMiss,
};

pub use reconcile::{ReconcileOutcome, ReconciliationMapper};
pub use conflict::{ConflictPayload, ConflictResolution, ConflictResolver};
pub use quarantine::{DeadLetterQuarantine, QuarantineRetryOutcome};
pub use engine::{CleanupReport, EngineDeps, EnqueueOutcome, ExecutionOutcome, SyncEngine};
