//! In-memory fakes for the delegate's collaborators (testing only)
//!
//! Provides `MemoryRunState` (with a shared `ScopeJournal` across its scope
//! tree), `MemoryCredentialStore`, `FakePolicyChecker`, `FakeArtifactSourcer`
//! and `FakeClock`. None of them need external services.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use build_ledger::PlanId;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::context::StepContext;
use crate::error::ExecError;
use crate::image::{ArtifactSourcer, ImageArtifactSource};
use crate::plan::{Plan, PlanStep};
use crate::policy::{PolicyCheckInput, PolicyCheckOutput, PolicyChecker};
use crate::scope::{Artifact, ArtifactName, ArtifactRepository, CredentialVisitor, RunState};
use crate::vars::{CredentialStore, VarReference, VarSourceConfigs};

// ---------------------------------------------------------------------------
// ScopeJournal
// ---------------------------------------------------------------------------

/// What a scripted sub-plan does when run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Succeeds, optionally leaving a result and an artifact in its scope
    Succeed {
        result: Option<Value>,
        artifact: Option<(ArtifactName, Artifact)>,
    },
    /// Runs to completion without succeeding
    Fail,
    /// Cannot run (worker lost, backend error, ...)
    Error(String),
    /// Never completes; only cancellation ends it
    Hang,
}

impl ScriptedRun {
    pub fn succeed() -> Self {
        ScriptedRun::Succeed {
            result: None,
            artifact: None,
        }
    }

    pub fn with_result(self, value: Value) -> Self {
        match self {
            ScriptedRun::Succeed { artifact, .. } => ScriptedRun::Succeed {
                result: Some(value),
                artifact,
            },
            other => other,
        }
    }

    pub fn with_artifact(self, name: &str, artifact: Artifact) -> Self {
        match self {
            ScriptedRun::Succeed { result, .. } => ScriptedRun::Succeed {
                result,
                artifact: Some((ArtifactName::from(name), artifact)),
            },
            other => other,
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    scopes_created: usize,
    /// Plan id and the var source lineage of the scope it ran in
    runs: Vec<(PlanId, Vec<String>)>,
    scripts: HashMap<PlanId, ScriptedRun>,
}

/// Shared record of everything that happened across one scope tree.
#[derive(Debug, Clone, Default)]
pub struct ScopeJournal {
    inner: Arc<Mutex<Journal>>,
}

impl ScopeJournal {
    /// Script how the plan with `plan_id` behaves, in whatever scope it runs.
    pub fn script(&self, plan_id: impl Into<PlanId>, run: ScriptedRun) {
        self.inner.lock().unwrap().scripts.insert(plan_id.into(), run);
    }

    /// Child scopes created anywhere in the tree.
    pub fn scopes_created(&self) -> usize {
        self.inner.lock().unwrap().scopes_created
    }

    /// Plans run anywhere in the tree, in order.
    pub fn runs(&self) -> Vec<PlanId> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .iter()
            .map(|(plan_id, _)| plan_id.clone())
            .collect()
    }

    /// Plans run anywhere in the tree, each with the var source lineage of
    /// the scope that ran it.
    pub fn runs_with_lineage(&self) -> Vec<(PlanId, Vec<String>)> {
        self.inner.lock().unwrap().runs.clone()
    }

    fn record_scope(&self) {
        self.inner.lock().unwrap().scopes_created += 1;
    }

    fn record_run(&self, plan_id: &PlanId, lineage: &[String]) -> ScriptedRun {
        let mut journal = self.inner.lock().unwrap();
        journal.runs.push((plan_id.clone(), lineage.to_vec()));
        journal
            .scripts
            .get(plan_id)
            .cloned()
            .unwrap_or_else(ScriptedRun::succeed)
    }
}

// ---------------------------------------------------------------------------
// MemoryRunState
// ---------------------------------------------------------------------------

type CredTracker = Arc<Mutex<Vec<(String, String)>>>;

/// In-memory scope. Children share the journal and the credential tracker
/// with their parent; results, artifacts and local variables are per scope.
#[derive(Debug)]
pub struct MemoryRunState {
    journal: ScopeJournal,
    locals: Mutex<HashMap<(String, String), Value>>,
    var_source_configs: VarSourceConfigs,
    artifacts: ArtifactRepository,
    results: Mutex<HashMap<PlanId, Value>>,
    creds: CredTracker,
    redaction: bool,
    lineage: Vec<String>,
    depth: usize,
}

impl MemoryRunState {
    /// Root scope with redaction enabled.
    pub fn new() -> Self {
        MemoryRunState {
            journal: ScopeJournal::default(),
            locals: Mutex::new(HashMap::new()),
            var_source_configs: VarSourceConfigs::default(),
            artifacts: ArtifactRepository::new(),
            results: Mutex::new(HashMap::new()),
            creds: Arc::new(Mutex::new(Vec::new())),
            redaction: true,
            lineage: Vec::new(),
            depth: 0,
        }
    }

    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redaction = enabled;
        self
    }

    pub fn with_var_sources(mut self, configs: VarSourceConfigs) -> Self {
        self.var_source_configs = configs;
        self
    }

    pub fn with_lineage(mut self, lineage: &[&str]) -> Self {
        self.lineage = lineage.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn journal(&self) -> ScopeJournal {
        self.journal.clone()
    }

    /// Nesting depth; the root scope is 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Pretend `value` was interpolated into the step's configuration.
    pub fn track_credential(&self, name: &str, value: &str) {
        self.creds
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    /// Bind a variable as if an earlier step in this scope produced it.
    pub fn bind_local(&self, source: &str, path: &str, value: Value) {
        self.locals
            .lock()
            .unwrap()
            .insert((source.to_string(), path.to_string()), value);
    }
}

impl Default for MemoryRunState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunState for MemoryRunState {
    async fn run(&self, _ctx: &StepContext, plan: &Plan) -> Result<bool, ExecError> {
        match self.journal.record_run(&plan.id, &self.lineage) {
            ScriptedRun::Succeed { result, artifact } => {
                if let Some(value) = result {
                    // fetched vars are secrets: redact them from here on
                    if let (PlanStep::GetVar(get_var), Value::String(secret)) = (&plan.step, &value)
                    {
                        self.track_credential(&format!("{}:{}", get_var.name, get_var.path), secret);
                    }
                    self.results.lock().unwrap().insert(plan.id.clone(), value);
                }
                if let Some((name, artifact)) = artifact {
                    self.artifacts.register(name, artifact);
                }
                Ok(true)
            }
            ScriptedRun::Fail => Ok(false),
            ScriptedRun::Error(message) => Err(ExecError::Step {
                plan_id: plan.id.clone(),
                message,
            }),
            ScriptedRun::Hang => std::future::pending().await,
        }
    }

    fn result(&self, plan_id: &PlanId) -> Option<Value> {
        self.results.lock().unwrap().get(plan_id).cloned()
    }

    fn artifact_repository(&self) -> ArtifactRepository {
        self.artifacts.clone()
    }

    fn new_scope(&self) -> Box<dyn RunState> {
        self.journal.record_scope();
        Box::new(MemoryRunState {
            journal: self.journal.clone(),
            locals: Mutex::new(HashMap::new()),
            var_source_configs: self.var_source_configs.clone(),
            artifacts: ArtifactRepository::new(),
            results: Mutex::new(HashMap::new()),
            creds: Arc::clone(&self.creds),
            redaction: self.redaction,
            lineage: self.lineage.clone(),
            depth: self.depth + 1,
        })
    }

    fn set_var_source_configs(&mut self, configs: VarSourceConfigs) {
        self.var_source_configs = configs;
    }

    fn var_source_configs(&self) -> VarSourceConfigs {
        self.var_source_configs.clone()
    }

    fn local_variable(&self, reference: &VarReference) -> Result<Option<Value>, ExecError> {
        let key = (reference.source.clone(), reference.path.clone());
        Ok(self.locals.lock().unwrap().get(&key).cloned())
    }

    fn redaction_enabled(&self) -> bool {
        self.redaction
    }

    fn iterate_interpolated_creds(&self, visitor: &mut dyn CredentialVisitor) {
        let creds = self.creds.lock().unwrap().clone();
        for (name, value) in &creds {
            visitor.yield_cred(name, value);
        }
    }

    fn var_source_lineage(&self) -> Vec<String> {
        self.lineage.clone()
    }

    fn enter_var_source(&mut self, name: &str) {
        self.lineage.push(name.to_string());
    }
}

// ---------------------------------------------------------------------------
// MemoryCredentialStore
// ---------------------------------------------------------------------------

/// Team/pipeline scoped secrets backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<(String, String, String), Value>>,
    lookups: Mutex<Vec<(String, String, VarReference)>>,
    unavailable: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, team: &str, pipeline: &str, path: &str, value: Value) {
        self.secrets.lock().unwrap().insert(
            (team.to_string(), pipeline.to_string(), path.to_string()),
            value,
        );
    }

    /// Make every lookup fail with `reason`.
    pub fn make_unavailable(&self, reason: &str) {
        *self.unavailable.lock().unwrap() = Some(reason.to_string());
    }

    /// Every `(team, pipeline, reference)` looked up, in order.
    pub fn lookups(&self) -> Vec<(String, String, VarReference)> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(
        &self,
        team: &str,
        pipeline: &str,
        reference: &VarReference,
    ) -> anyhow::Result<Option<Value>> {
        self.lookups.lock().unwrap().push((
            team.to_string(),
            pipeline.to_string(),
            reference.clone(),
        ));

        if let Some(reason) = self.unavailable.lock().unwrap().clone() {
            anyhow::bail!("credential manager unavailable: {reason}");
        }

        let key = (
            team.to_string(),
            pipeline.to_string(),
            reference.path.clone(),
        );
        Ok(self.secrets.lock().unwrap().get(&key).cloned())
    }
}

// ---------------------------------------------------------------------------
// FakePolicyChecker
// ---------------------------------------------------------------------------

/// Policy engine with a canned verdict that records every input.
#[derive(Debug)]
pub struct FakePolicyChecker {
    checked_actions: Vec<String>,
    verdict: Result<PolicyCheckOutput, String>,
    inputs: Mutex<Vec<PolicyCheckInput>>,
}

impl FakePolicyChecker {
    /// Checks `actions` and allows everything.
    pub fn checking(actions: &[&str]) -> Self {
        FakePolicyChecker {
            checked_actions: actions.iter().map(|a| a.to_string()).collect(),
            verdict: Ok(PolicyCheckOutput::allow()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Checks nothing.
    pub fn disabled() -> Self {
        Self::checking(&[])
    }

    pub fn with_verdict(mut self, verdict: PolicyCheckOutput) -> Self {
        self.verdict = Ok(verdict);
        self
    }

    /// Every check fails with `message` (engine unreachable).
    pub fn failing(mut self, message: &str) -> Self {
        self.verdict = Err(message.to_string());
        self
    }

    pub fn inputs(&self) -> Vec<PolicyCheckInput> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyChecker for FakePolicyChecker {
    fn should_check_action(&self, action: &str) -> bool {
        self.checked_actions.iter().any(|a| a == action)
    }

    async fn check(&self, input: PolicyCheckInput) -> anyhow::Result<PolicyCheckOutput> {
        self.inputs.lock().unwrap().push(input);
        self.verdict.clone().map_err(anyhow::Error::msg)
    }
}

// ---------------------------------------------------------------------------
// FakeArtifactSourcer
// ---------------------------------------------------------------------------

/// Wires any artifact into an image source named after its handle.
#[derive(Debug, Default)]
pub struct FakeArtifactSourcer {
    failure: Option<String>,
    sourced: Mutex<Vec<Artifact>>,
}

impl FakeArtifactSourcer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        FakeArtifactSourcer {
            failure: Some(message.to_string()),
            sourced: Mutex::new(Vec::new()),
        }
    }

    pub fn sourced(&self) -> Vec<Artifact> {
        self.sourced.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSourcer for FakeArtifactSourcer {
    async fn source_image(
        &self,
        _ctx: &StepContext,
        artifact: &Artifact,
    ) -> anyhow::Result<ImageArtifactSource> {
        self.sourced.lock().unwrap().push(artifact.clone());
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        Ok(ImageArtifactSource {
            artifact: artifact.clone(),
            volume_handle: format!("{}-rootfs", artifact.handle),
        })
    }
}

// ---------------------------------------------------------------------------
// FakeClock
// ---------------------------------------------------------------------------

/// Clock frozen at a settable instant.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        FakeClock {
            now: Mutex::new(now),
        }
    }

    /// Frozen at the given unix timestamp.
    pub fn at_unix(secs: i64) -> Self {
        Self::at(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
