//! Step Delegate: the per-step mediation layer of a CI build
//!
//! A running step talks to the rest of the platform only through its
//! [`BuildStepDelegate`]:
//! - lifecycle and output events go to the build's append-only log
//! - output is scrubbed of every interpolated credential before it is saved
//! - variable references resolve against the credential store, the step's
//!   scope, or a var source fetched by a nested get-var sub-plan
//! - images are fetched in a child scope after passing the policy engine
//!
//! # Modules
//!
//! - [`delegate`]: `BuildStepDelegate` (lifecycle, streams, images)
//! - [`variables`]: `StepVariables` resolver
//! - [`output`]: `EventWriter`, plain or redacting
//! - [`redact`]: credential redaction
//! - [`scope`]: `RunState` contract, artifacts
//! - [`vars`]: references, var sources, credential store
//! - [`policy`]: policy engine contract
//! - [`image`]: image specs and artifact sourcing
//! - [`fakes`]: in-memory collaborators for tests

pub mod clock;
pub mod context;
pub mod delegate;
pub mod error;
pub mod fakes;
pub mod image;
pub mod obs;
pub mod output;
pub mod plan;
pub mod policy;
pub mod redact;
pub mod scope;
pub mod telemetry;
pub mod variables;
pub mod vars;

pub use clock::{Clock, SystemClock};
pub use context::{CancelHandle, StepContext};
pub use delegate::BuildStepDelegate;
pub use error::{DelegateError, DelegateResult, ExecError};
pub use image::{ArtifactSourcer, GetResult, ImageArtifactSource, ImageSpec};
pub use output::{EventWriter, OutputFilter};
pub use plan::{CheckPlan, GetPlan, GetVarPlan, Plan, PlanStep, Source};
pub use policy::{
    NoopPolicyChecker, PolicyCheckInput, PolicyCheckOutput, PolicyChecker, ACTION_USE_IMAGE,
};
pub use redact::{redact, Redactor, MIN_SECRET_LEN, REDACTED};
pub use scope::{Artifact, ArtifactName, ArtifactRepository, CredentialVisitor, RunState};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use variables::StepVariables;
pub use vars::{
    CredentialStore, CredentialVariables, VarReference, VarSourceConfig, VarSourceConfigs,
    Variables,
};

/// Step delegate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
