//! Image specs handed to the worker layer.

use async_trait::async_trait;
use build_ledger::UsedResourceCache;
use serde::{Deserialize, Serialize};

use crate::context::StepContext;
use crate::scope::Artifact;

/// What a get sub-plan leaves in its scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResult {
    /// Artifact name the fetched bits were registered under
    pub name: String,
    pub resource_cache: UsedResourceCache,
}

/// A worker-consumable source for an image's root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifactSource {
    pub artifact: Artifact,
    /// Volume the image is streamed from
    pub volume_handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image_artifact_source: ImageArtifactSource,
    pub privileged: bool,
}

/// Turns a fetched artifact into something a worker can mount.
#[async_trait]
pub trait ArtifactSourcer: Send + Sync {
    async fn source_image(
        &self,
        ctx: &StepContext,
        artifact: &Artifact,
    ) -> anyhow::Result<ImageArtifactSource>;
}
