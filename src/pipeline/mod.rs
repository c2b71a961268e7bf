//! Sandbox lifecycle pipeline
//!
//! Status machine, stage commands, and the orchestrator that drives a
//! sandbox from `pending` to a terminal state.

mod orchestrator;
pub mod scaffold;
mod status;

pub use orchestrator::{Orchestrator, PipelineOutcome, ProvisionRequest, SmokeReport};
pub use status::SandboxStatus;
