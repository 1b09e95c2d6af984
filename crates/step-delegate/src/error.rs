//! Error types for the step delegate.

use build_ledger::{PlanId, StorageError};

/// Failures reported by an execution scope while running a sub-plan.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("interrupted")]
    Cancelled,

    #[error("step {plan_id} errored: {message}")]
    Step { plan_id: PlanId, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors produced by the delegate layer.
///
/// Every propagated variant carries a short phase label so the composed
/// message still locates the failing phase once shown as an Error event.
#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    // -- variable resolution -------------------------------------------------
    #[error("no var source found for {source_name}")]
    NoMatchingVarSource { source_name: String },

    #[error("source {source_name} cannot be parsed: expected an object, got {config}")]
    VarSourceUnparseable {
        source_name: String,
        config: serde_json::Value,
    },

    #[error("var source {source_name} references itself (lineage: {})", .chain.join(" -> "))]
    VarSourceCycle {
        source_name: String,
        chain: Vec<String>,
    },

    #[error("save sub get var event: {0}")]
    SaveSubGetVarEvent(#[source] StorageError),

    #[error("run sub get var: {0}")]
    RunSubGetVar(#[source] ExecError),

    #[error("get var failed")]
    GetVarFailed,

    #[error("get var did not return a value")]
    GetVarNoValue,

    #[error("credential lookup: {0}")]
    Credentials(#[source] anyhow::Error),

    #[error("local variables: {0}")]
    LocalVariables(#[source] ExecError),

    // -- policy --------------------------------------------------------------
    #[error("redact source: {0}")]
    RedactSource(#[source] serde_json::Error),

    #[error("perform check: {0}")]
    PolicyCheck(#[source] anyhow::Error),

    #[error("policy check failed: {}", .reasons.join(", "))]
    PolicyCheckNotPass { reasons: Vec<String> },

    // -- image fetching ------------------------------------------------------
    #[error("plan {plan_id} is not a {expected} plan")]
    InvalidPlan { plan_id: PlanId, expected: String },

    #[error("image check failed")]
    ImageCheckFailed,

    #[error("image fetching failed")]
    ImageFetchFailed,

    #[error("get did not return a result")]
    GetNoResult,

    #[error("save image version: {0}")]
    SaveImageVersion(#[source] StorageError),

    #[error("fetched artifact not found: {name}")]
    FetchedArtifactNotFound { name: String },

    #[error("wire image: {0}")]
    WireImage(#[source] anyhow::Error),

    #[error(transparent)]
    Exec(ExecError),

    #[error("interrupted")]
    Cancelled,
}

impl From<ExecError> for DelegateError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled => DelegateError::Cancelled,
            other => DelegateError::Exec(other),
        }
    }
}

/// Result type for delegate operations.
pub type DelegateResult<T> = std::result::Result<T, DelegateError>;
