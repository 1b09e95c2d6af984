//! Build events for the append-only build log
//!
//! Events are the ground truth for a build's live view. Readers tail the log
//! and reconstruct each step's lifecycle and output from the `origin` of
//! every event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::PlanId;

/// A unique event ID (UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ORIGIN
// ============================================================================

/// Output channel an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginSource {
    Stdout,
    Stderr,
    #[default]
    None,
}

impl OriginSource {
    fn is_none(&self) -> bool {
        matches!(self, OriginSource::None)
    }
}

/// Where an event came from: the emitting step and, for output, its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub id: PlanId,
    #[serde(default, skip_serializing_if = "OriginSource::is_none")]
    pub source: OriginSource,
}

impl Origin {
    /// Origin for lifecycle events (no output channel).
    pub fn step(id: PlanId) -> Self {
        Origin {
            id,
            source: OriginSource::None,
        }
    }

    pub fn stdout(id: PlanId) -> Self {
        Origin {
            id,
            source: OriginSource::Stdout,
        }
    }

    pub fn stderr(id: PlanId) -> Self {
        Origin {
            id,
            source: OriginSource::Stderr,
        }
    }
}

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Step lifecycle and output events - ordered, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BuildEvent {
    /// The step is being set up (queued, acquiring resources)
    Initialize(InitializeEvent),

    /// The step has begun executing
    Start(StartEvent),

    /// The step has finished; nothing else for this origin follows
    Finish(FinishEvent),

    /// The step errored; message is shown to the user
    Error(ErrorEvent),

    /// A worker was chosen to run the step
    SelectedWorker(SelectedWorkerEvent),

    /// A chunk of step output
    Log(LogEvent),

    /// The step triggered a nested var source fetch
    SubGetVar(SubGetVarEvent),
}

impl BuildEvent {
    /// Origin of the event, whatever its kind.
    pub fn origin(&self) -> &Origin {
        match self {
            BuildEvent::Initialize(e) => &e.origin,
            BuildEvent::Start(e) => &e.origin,
            BuildEvent::Finish(e) => &e.origin,
            BuildEvent::Error(e) => &e.origin,
            BuildEvent::SelectedWorker(e) => &e.origin,
            BuildEvent::Log(e) => &e.origin,
            BuildEvent::SubGetVar(e) => &e.origin,
        }
    }

    /// Short kind label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildEvent::Initialize(_) => "initialize",
            BuildEvent::Start(_) => "start",
            BuildEvent::Finish(_) => "finish",
            BuildEvent::Error(_) => "error",
            BuildEvent::SelectedWorker(_) => "selected-worker",
            BuildEvent::Log(_) => "log",
            BuildEvent::SubGetVar(_) => "sub-get-var",
        }
    }
}

// ============================================================================
// INDIVIDUAL EVENT TYPES
// ============================================================================

// `time` is unix seconds throughout.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeEvent {
    pub origin: Origin,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartEvent {
    pub origin: Origin,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishEvent {
    pub origin: Origin,
    pub time: i64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub origin: Origin,
    pub time: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedWorkerEvent {
    pub origin: Origin,
    pub time: i64,
    pub selected_worker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub origin: Origin,
    pub time: i64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGetVarEvent {
    pub origin: Origin,
    pub time: i64,
    /// Public view of the synthesized get-var plan; never holds the source config
    pub public_plan: serde_json::Value,
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

/// A build event as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    /// Monotonic position within the build, starting at 0
    pub sequence: u64,
    pub event: BuildEvent,
    pub recorded_at: DateTime<Utc>,
}
