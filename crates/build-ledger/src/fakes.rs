//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBuild`, which satisfies the `Build` contract without any
//! external dependencies and lets tests inject save failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::StorageError;
use crate::events::{BuildEvent, EventId, EventRecord};
use crate::schema::{BuildId, PlanId, UsedResourceCache};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryBuild
// ---------------------------------------------------------------------------

/// In-memory build backed by a `Vec<EventRecord>` in append order.
#[derive(Debug)]
pub struct MemoryBuild {
    id: BuildId,
    name: String,
    team_name: String,
    pipeline_name: String,
    events: Mutex<Vec<EventRecord>>,
    image_versions: Mutex<Vec<UsedResourceCache>>,
    reject_events: AtomicBool,
    reject_versions: AtomicBool,
}

impl MemoryBuild {
    /// Build #1 of the given team/pipeline.
    pub fn new(team_name: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        MemoryBuild {
            id: BuildId(1),
            name: "1".to_string(),
            team_name: team_name.into(),
            pipeline_name: pipeline_name.into(),
            events: Mutex::new(Vec::new()),
            image_versions: Mutex::new(Vec::new()),
            reject_events: AtomicBool::new(false),
            reject_versions: AtomicBool::new(false),
        }
    }

    pub fn with_id(mut self, id: i64, name: impl Into<String>) -> Self {
        self.id = BuildId(id);
        self.name = name.into();
        self
    }

    /// Make every subsequent `save_event` fail (or succeed again).
    pub fn reject_events(&self, reject: bool) {
        self.reject_events.store(reject, Ordering::SeqCst);
    }

    /// Make every subsequent `save_image_resource_version` fail (or succeed again).
    pub fn reject_image_versions(&self, reject: bool) {
        self.reject_versions.store(reject, Ordering::SeqCst);
    }

    /// All recorded events, in append order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.events.lock().unwrap().clone()
    }

    /// All recorded events without their envelopes.
    pub fn events(&self) -> Vec<BuildEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    /// Events whose origin is the given plan.
    pub fn events_for(&self, plan_id: &PlanId) -> Vec<BuildEvent> {
        self.events()
            .into_iter()
            .filter(|e| &e.origin().id == plan_id)
            .collect()
    }

    /// Image resource caches saved so far.
    pub fn image_versions(&self) -> Vec<UsedResourceCache> {
        self.image_versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Build for MemoryBuild {
    fn id(&self) -> BuildId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn team_name(&self) -> &str {
        &self.team_name
    }

    fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    async fn save_event(&self, event: BuildEvent) -> StorageResult<()> {
        if self.reject_events.load(Ordering::SeqCst) {
            return Err(StorageError::SaveRejected {
                reason: format!("event log unavailable for build {}", self.id),
            });
        }

        let mut events = self.events.lock().unwrap();
        let sequence = events.len() as u64;
        debug!("Recorded {} event #{} for build {}", event.kind(), sequence, self.id);
        events.push(EventRecord {
            event_id: EventId::new(),
            sequence,
            event,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn save_image_resource_version(&self, cache: &UsedResourceCache) -> StorageResult<()> {
        if self.reject_versions.load(Ordering::SeqCst) {
            return Err(StorageError::SaveRejected {
                reason: format!("resource cache {} could not be linked", cache.id),
            });
        }

        self.image_versions.lock().unwrap().push(cache.clone());
        Ok(())
    }
}
