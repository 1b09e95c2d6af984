//! Shared wiring for delegate integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use build_ledger::fakes::MemoryBuild;
use build_ledger::{BuildEvent, PlanId};
use step_delegate::fakes::{
    FakeArtifactSourcer, FakeClock, FakePolicyChecker, MemoryCredentialStore, MemoryRunState,
    ScopeJournal,
};
use step_delegate::BuildStepDelegate;

pub const STEP: &str = "step1";

pub struct Harness {
    pub build: Arc<MemoryBuild>,
    pub state: Arc<MemoryRunState>,
    pub journal: ScopeJournal,
    pub clock: Arc<FakeClock>,
    pub policy: Arc<FakePolicyChecker>,
    pub creds: Arc<MemoryCredentialStore>,
    pub sourcer: Arc<FakeArtifactSourcer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_state(MemoryRunState::new())
    }

    pub fn with_state(state: MemoryRunState) -> Self {
        let journal = state.journal();
        Harness {
            build: Arc::new(MemoryBuild::new("t", "p")),
            state: Arc::new(state),
            journal,
            clock: Arc::new(FakeClock::at_unix(1_600_000_000)),
            policy: Arc::new(FakePolicyChecker::disabled()),
            creds: Arc::new(MemoryCredentialStore::new()),
            sourcer: Arc::new(FakeArtifactSourcer::new()),
        }
    }

    pub fn with_policy(mut self, policy: FakePolicyChecker) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_sourcer(mut self, sourcer: FakeArtifactSourcer) -> Self {
        self.sourcer = Arc::new(sourcer);
        self
    }

    pub fn delegate(&self) -> BuildStepDelegate {
        BuildStepDelegate::new(
            self.build.clone(),
            PlanId::from(STEP),
            self.state.clone(),
            self.clock.clone(),
            self.policy.clone(),
            self.creds.clone(),
            self.sourcer.clone(),
        )
    }

    /// Kinds of every event for the step, in log order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.build
            .events_for(&PlanId::from(STEP))
            .iter()
            .map(BuildEvent::kind)
            .collect()
    }

    /// Payloads of every Log event, in log order.
    pub fn log_payloads(&self) -> Vec<String> {
        self.build
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::Log(l) => Some(l.payload),
                _ => None,
            })
            .collect()
    }

    pub fn sub_get_var_plans(&self) -> Vec<serde_json::Value> {
        self.build
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::SubGetVar(s) => Some(s.public_plan),
                _ => None,
            })
            .collect()
    }
}
