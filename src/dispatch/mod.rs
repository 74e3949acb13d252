//! Per-request dispatch pipeline.
//!
//! Components:
//! - `types` — request normalisation, analysis, response metadata
//! - `analysis` / `synthesis` — completion prompts, parsing and fallbacks
//! - `collaboration` — in-memory table of interactions
//! - `coordinator` — `Coordinator`, which drives a request end to end

pub mod analysis;
pub mod collaboration;
pub mod coordinator;
pub mod synthesis;
pub mod types;

pub use collaboration::{
    CollaborationState, CollaborationStatus, CollaborationTable, ExpertOutcome, ExpertSlot,
};
pub use coordinator::Coordinator;
pub use synthesis::{ExpertAnswer, fallback_answer};
pub use types::{
    Analysis, Complexity, DispatchRequest, DispatchResponse, ResponseMetadata, ResponseStatus,
    SkipReason, SkippedExpert, Stage,
};
