//! Identity and provenance records shared by the event log and its callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity of a step within a build's plan tree.
///
/// Stable once assigned; it is the only key log readers have for correlating
/// events with the step that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        PlanId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlanId {
    fn from(id: &str) -> Self {
        PlanId(id.to_string())
    }
}

impl From<String> for PlanId {
    fn from(id: String) -> Self {
        PlanId(id)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Database identity of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub i64);

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource version as reported by a resource type (`{"digest": "sha256:..."}`).
pub type Version = BTreeMap<String, String>;

/// A resource cache that a build has used, recorded for version provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedResourceCache {
    /// Cache row id
    pub id: i64,
    /// Resource type that produced the cache (e.g. "registry-image")
    pub resource_type: String,
    /// Version fetched into the cache
    pub version: Version,
}

/// Key/value attributes attached to tracing spans for a build.
pub type TracingAttrs = BTreeMap<String, String>;
