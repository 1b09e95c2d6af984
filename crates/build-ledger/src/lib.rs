//! Build-Ledger: Event Log Contracts for Pipeline Builds
//!
//! This crate defines what a running step may persist about itself: ordered
//! lifecycle and output events, and the image resource versions it used.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only ordering and provenance. No step logic lives here.
//!
//! ## Key Components
//!
//! - `Build`: the platform-owned handle steps write through
//! - `BuildEvent`: tagged event records keyed by `Origin`
//! - `UsedResourceCache`: provenance record for fetched images

mod error;
pub mod events;
pub mod fakes;
mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use events::{
    BuildEvent, ErrorEvent, EventId, EventRecord, FinishEvent, InitializeEvent, LogEvent, Origin,
    OriginSource, SelectedWorkerEvent, StartEvent, SubGetVarEvent,
};
pub use schema::{BuildId, PlanId, TracingAttrs, UsedResourceCache, Version};
pub use storage_traits::{Build, StorageResult};
