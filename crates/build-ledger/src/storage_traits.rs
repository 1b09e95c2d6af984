//! Storage trait definitions for a running build
//!
//! `Build` is the platform-owned handle a step delegate writes through:
//! - an append-only event sink that readers tail to render the live log
//! - a provenance store for image resource versions
//!
//! The trait is async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::events::BuildEvent;
use crate::schema::{BuildId, TracingAttrs, UsedResourceCache};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A pipeline run, as seen by the steps executing inside it.
///
/// Guarantees:
/// - `save_event` appends; events from one caller are never reordered.
/// - Concurrent appends from independent steps are safe.
/// - Saved events are never mutated or removed.
#[async_trait]
pub trait Build: Send + Sync {
    fn id(&self) -> BuildId;

    /// Build name within its job (e.g. "42").
    fn name(&self) -> &str;

    fn team_name(&self) -> &str;

    fn pipeline_name(&self) -> &str;

    /// Attributes every span opened for this build should carry.
    fn tracing_attrs(&self) -> TracingAttrs {
        let mut attrs = TracingAttrs::new();
        attrs.insert("build_id".to_string(), self.id().to_string());
        attrs.insert("build".to_string(), self.name().to_string());
        attrs.insert("team".to_string(), self.team_name().to_string());
        attrs.insert("pipeline".to_string(), self.pipeline_name().to_string());
        attrs
    }

    /// Append an event to the build log.
    async fn save_event(&self, event: BuildEvent) -> StorageResult<()>;

    /// Record the resource cache an image was fetched into.
    async fn save_image_resource_version(&self, cache: &UsedResourceCache) -> StorageResult<()>;
}
