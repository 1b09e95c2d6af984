//! Policy engine contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Action checked before a step uses an image.
pub const ACTION_USE_IMAGE: &str = "UseImage";

/// What the engine is asked to decide on. `data` never holds unredacted
/// credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckInput {
    pub action: String,
    pub team: String,
    pub pipeline: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheckOutput {
    pub allowed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl PolicyCheckOutput {
    pub fn allow() -> Self {
        PolicyCheckOutput {
            allowed: true,
            reasons: Vec::new(),
        }
    }

    pub fn deny(reasons: impl IntoIterator<Item = impl Into<String>>) -> Self {
        PolicyCheckOutput {
            allowed: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }
}

/// A pluggable policy engine (OPA or similar).
#[async_trait]
pub trait PolicyChecker: Send + Sync {
    /// Whether `action` is subject to checks at all.
    fn should_check_action(&self, action: &str) -> bool;

    async fn check(&self, input: PolicyCheckInput) -> anyhow::Result<PolicyCheckOutput>;
}

/// Checker for deployments without a policy engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicyChecker;

#[async_trait]
impl PolicyChecker for NoopPolicyChecker {
    fn should_check_action(&self, _action: &str) -> bool {
        false
    }

    async fn check(&self, _input: PolicyCheckInput) -> anyhow::Result<PolicyCheckOutput> {
        Ok(PolicyCheckOutput::allow())
    }
}
