//! Variable references, var source configuration and the global credential store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DelegateError, DelegateResult};

/// A request for a value: `((source:path.field))` in pipeline syntax.
///
/// An empty `source` means the team/pipeline credential scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarReference {
    #[serde(default)]
    pub source: String,
    pub path: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl VarReference {
    /// Reference into the global credential scope.
    pub fn global(path: impl Into<String>) -> Self {
        VarReference {
            source: String::new(),
            path: path.into(),
            fields: Vec::new(),
        }
    }

    pub fn from_source(source: impl Into<String>, path: impl Into<String>) -> Self {
        VarReference {
            source: source.into(),
            path: path.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_global(&self) -> bool {
        self.source.is_empty()
    }
}

impl std::fmt::Display for VarReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.source.is_empty() {
            write!(f, "{}:", self.source)?;
        }
        write!(f, "{}", self.path)?;
        for field in &self.fields {
            write!(f, ".{field}")?;
        }
        Ok(())
    }
}

/// Anything that can resolve a variable reference.
#[async_trait]
pub trait Variables: Send + Sync {
    /// `Ok(None)` means "not found"; errors are reserved for lookups that
    /// could not complete.
    async fn get(&self, reference: &VarReference) -> DelegateResult<Option<Value>>;
}

// ---------------------------------------------------------------------------
// Var source configuration
// ---------------------------------------------------------------------------

/// A named credential backend declared on a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    /// Backend-specific configuration; must be an object to be usable
    pub config: Value,
}

/// Ordered var source list, looked up by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarSourceConfigs(pub Vec<VarSourceConfig>);

impl VarSourceConfigs {
    pub fn lookup(&self, name: &str) -> Option<&VarSourceConfig> {
        self.0.iter().find(|c| c.name == name)
    }

    /// Copy of the list without the named source, for evaluating that
    /// source's own configuration.
    pub fn without(&self, name: &str) -> Self {
        VarSourceConfigs(self.0.iter().filter(|c| c.name != name).cloned().collect())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|c| c.name.as_str()).collect()
    }
}

impl From<Vec<VarSourceConfig>> for VarSourceConfigs {
    fn from(configs: Vec<VarSourceConfig>) -> Self {
        VarSourceConfigs(configs)
    }
}

// ---------------------------------------------------------------------------
// Global credential store
// ---------------------------------------------------------------------------

/// The platform's credential manager (team and pipeline scoped secrets).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(
        &self,
        team: &str,
        pipeline: &str,
        reference: &VarReference,
    ) -> anyhow::Result<Option<Value>>;
}

/// `Variables` over the credential store for one team and pipeline.
///
/// Values resolved here are platform-managed and are not reported to the
/// scope's interpolation tracker.
pub struct CredentialVariables {
    store: Arc<dyn CredentialStore>,
    team: String,
    pipeline: String,
}

impl CredentialVariables {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        team: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Self {
        CredentialVariables {
            store,
            team: team.into(),
            pipeline: pipeline.into(),
        }
    }
}

#[async_trait]
impl Variables for CredentialVariables {
    async fn get(&self, reference: &VarReference) -> DelegateResult<Option<Value>> {
        self.store
            .get(&self.team, &self.pipeline, reference)
            .await
            .map_err(DelegateError::Credentials)
    }
}
