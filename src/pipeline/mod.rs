//! Run orchestration: the stage state machine and its driver.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{PipelineRunner, RunOutcome};
pub use state::{Feedback, PipelinePhase, PipelineState, ReconciliationFeedback};
