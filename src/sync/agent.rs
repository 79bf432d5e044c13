//! Client-side sync agent
//!
//! The device-side half of the protocol: buffer local mutations, run one
//! request/response exchange through a transport, apply the returned delta to the
//! local cache, and persist the new watermark. No transition here depends on other
//! devices; convergence comes purely from repeated exchanges with the coordinator.

use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{SyncRequest, SyncResponse};

/// On-device persistence capability.
///
/// Reading and writing the local cache is assumed as a capability, not designed
/// here; implementations wrap whatever store the device has.
pub trait DeviceCache {
    /// Locally modified records awaiting push, grouped by type
    fn pending(&self) -> HashMap<String, Vec<Value>>;

    /// Watermark persisted after the last successful exchange
    fn watermark(&self) -> Option<DateTime<Utc>>;

    /// Apply the server's delta to local state. Records carrying
    /// `isDeleted: true` must be tombstoned locally, never resurrected.
    fn apply_remote(&mut self, changes: &HashMap<String, Vec<Value>>);

    /// Persist the new watermark and clear pushed mutations, keeping those of
    /// `failed_types` pending for the next exchange.
    fn commit(&mut self, watermark: DateTime<Utc>, failed_types: &[String]);
}

/// Device-side sync phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    PushPending,
    Syncing,
}

/// Drives sync exchanges for one device
pub struct SyncAgent<C> {
    cache: C,
    state: AgentState,
}

impl<C: DeviceCache> SyncAgent<C> {
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            state: AgentState::Idle,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    /// Record that a local mutation happened
    pub fn note_local_mutation(&mut self) {
        if self.state == AgentState::Idle {
            self.state = AgentState::PushPending;
        }
    }

    /// Run one sync exchange.
    ///
    /// On failure the watermark and pending mutations are left untouched, so the
    /// next attempt is a fully-overlapping, safe retry; the device keeps working
    /// offline on its local state either way.
    pub async fn sync_once<T, Fut>(&mut self, transport: T) -> Result<SyncResponse>
    where
        T: FnOnce(SyncRequest) -> Fut,
        Fut: Future<Output = Result<SyncResponse>>,
    {
        self.state = AgentState::Syncing;

        let request = SyncRequest {
            last_sync: self.cache.watermark(),
            changes: self.cache.pending(),
        };

        let result = transport(request).await;

        if let Ok(response) = &result {
            self.cache.apply_remote(&response.changes);
            self.cache.commit(response.timestamp, &response.failed_types);
        }

        self.state = if self.cache.pending().is_empty() {
            AgentState::Idle
        } else {
            AgentState::PushPending
        };

        result
    }
}
