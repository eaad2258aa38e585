pub mod error;
pub mod policy;

pub use error::{Result, SyncError};
pub use policy::{
    DrainPolicy, DurabilityMode, QueuePolicy, RetentionPolicy, RetryPolicy, SnapshotPolicy,
};
