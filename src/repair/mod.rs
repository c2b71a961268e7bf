//! Repair subsystem
//!
//! Classifies captured failures into an error category and drives the
//! AI-assisted patcher. Each failure occurrence gets at most one repair
//! attempt, and the whole sandbox lineage carries a fixed repair budget.

mod classify;
mod client;

pub use classify::{classify, ErrorCategory};
pub use client::{RepairClient, RepairPatch};
