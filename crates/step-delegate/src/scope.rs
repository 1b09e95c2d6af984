//! Execution scope contract.
//!
//! A scope is one node in the tree of evaluation contexts for a build: it
//! holds locally produced variables and results, the artifacts its sub-plans
//! produced, and the var sources visible to it. Child scopes inherit ambient
//! capabilities (interpolation tracking, redaction, var source lineage) and
//! start with empty results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use build_ledger::PlanId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::StepContext;
use crate::error::ExecError;
use crate::plan::Plan;
use crate::vars::{VarReference, VarSourceConfigs};

/// Receives every credential value interpolated into a step's configuration.
pub trait CredentialVisitor {
    fn yield_cred(&mut self, name: &str, value: &str);
}

/// Name under which a sub-plan registers what it produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactName(pub String);

impl From<&str> for ArtifactName {
    fn from(name: &str) -> Self {
        ArtifactName(name.to_string())
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to something a sub-plan left on a worker (e.g. a volume).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
}

/// Artifacts registered in one scope, by name. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRepository {
    artifacts: Arc<RwLock<HashMap<ArtifactName, Artifact>>>,
}

impl ArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: ArtifactName, artifact: Artifact) {
        if let Ok(mut artifacts) = self.artifacts.write() {
            artifacts.insert(name, artifact);
        }
    }

    pub fn artifact_for(&self, name: &ArtifactName) -> Option<Artifact> {
        self.artifacts.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The run state a delegate evaluates in.
#[async_trait]
pub trait RunState: Send + Sync {
    /// Run `plan` in this scope. `Ok(false)` means the step ran and did not
    /// succeed; errors mean it could not run to completion.
    async fn run(&self, ctx: &StepContext, plan: &Plan) -> Result<bool, ExecError>;

    /// Result a sub-plan stored under its plan id.
    fn result(&self, plan_id: &PlanId) -> Option<Value>;

    fn artifact_repository(&self) -> ArtifactRepository;

    /// Fresh child scope: empty results and artifacts, inherited ambient state.
    fn new_scope(&self) -> Box<dyn RunState>;

    /// Replace the var sources visible in this scope. Authoritative from
    /// now on; the parent's list is never consulted.
    fn set_var_source_configs(&mut self, configs: VarSourceConfigs);

    fn var_source_configs(&self) -> VarSourceConfigs;

    /// Variables already produced in this scope (e.g. by `load_var`).
    fn local_variable(&self, reference: &VarReference) -> Result<Option<Value>, ExecError>;

    fn redaction_enabled(&self) -> bool;

    /// Feed every interpolated credential to `visitor`.
    fn iterate_interpolated_creds(&self, visitor: &mut dyn CredentialVisitor);

    /// Var sources currently being resolved on the path to this scope,
    /// outermost first.
    fn var_source_lineage(&self) -> Vec<String>;

    /// Mark `name` as being resolved by this scope.
    fn enter_var_source(&mut self, name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_clones_share_table() {
        let repo = ArtifactRepository::new();
        let view = repo.clone();
        assert!(view.is_empty());

        repo.register(
            ArtifactName::from("image"),
            Artifact {
                handle: "vol-1".into(),
                worker_name: Some("worker-a".into()),
            },
        );

        assert_eq!(view.len(), 1);
        assert_eq!(
            view.artifact_for(&ArtifactName::from("image")).map(|a| a.handle),
            Some("vol-1".to_string())
        );
        assert!(view.artifact_for(&ArtifactName::from("other")).is_none());
    }
}
