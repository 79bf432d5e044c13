//! Multi-device synchronization
//!
//! The incremental sync protocol: a device sends its last-known watermark plus a
//! batch of locally modified records, the coordinator merges them into the store
//! and hands back everything modified since that watermark. One request/response
//! exchange, never the full dataset.
//!
//! - `registry`: the closed set of syncable types and their merge strategies
//! - `merge`: per-record merge resolution and singleton batch collapse
//! - `coordinator`: one sync exchange end to end, plus reset and status
//! - `agent`: the device-side contract
//! - `types`: wire types

pub mod agent;
pub mod coordinator;
pub mod merge;
pub mod registry;
pub mod types;

pub use agent::{AgentState, DeviceCache, SyncAgent};
pub use coordinator::{SyncCoordinator, SyncOutcome};
pub use registry::{lookup, EntityTypeDef, MergeStrategy, ENTITY_TYPES, SINGLETON_ID};
pub use types::{ResetResponse, SyncRequest, SyncResponse, SyncStatusResponse};
