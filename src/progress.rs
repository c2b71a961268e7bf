//! Progress reporting
//!
//! Every stage transition emits one event over a broadcast channel.
//! Events are consumable as a live SSE stream or ignored entirely; a
//! disconnected subscriber never affects the pipeline. Percent values
//! come from a fixed lookup table and are monotone non-decreasing
//! within one pipeline run (the orchestrator carries the floor across
//! failure and repair re-entries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::pipeline::SandboxStatus;

/// One progress update for one sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub sandbox_id: Uuid,
    pub status: SandboxStatus,
    /// Stage name, same vocabulary as `status`
    pub step: String,
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Terminal events close the stream on the consumer side
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SandboxStatus::Ready | SandboxStatus::Failed | SandboxStatus::Terminated
        )
    }
}

/// Fixed step -> percent mapping. The table is authoritative, never
/// computed from stage position.
pub fn percent_for(status: SandboxStatus) -> u8 {
    match status {
        SandboxStatus::Pending => 0,
        SandboxStatus::Provisioning => 10,
        SandboxStatus::Setup => 25,
        SandboxStatus::ApplyingCode => 40,
        SandboxStatus::InstallingPackages => 60,
        SandboxStatus::Repairing => 70,
        SandboxStatus::Validating => 80,
        SandboxStatus::Ready => 100,
        // Terminal failures report the floor reached so far; the
        // orchestrator substitutes the last stage percent.
        SandboxStatus::Failed | SandboxStatus::Terminated => 0,
    }
}

/// Broadcast-based progress reporter
#[derive(Clone)]
pub struct ProgressReporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        ProgressReporter { tx }
    }

    /// Emit an event. No subscribers is fine; progress is best-effort
    /// on the push side because the durable record already holds the
    /// same state.
    pub fn emit(&self, sandbox_id: Uuid, status: SandboxStatus, percent: u8, message: impl Into<String>) {
        let event = ProgressEvent {
            sandbox_id,
            status,
            step: status.as_str().to_string(),
            percent,
            message: message.into(),
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(event);
    }

    /// Subscribe to all progress events; callers filter by sandbox id
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_table_monotone_over_happy_path() {
        let path = [
            SandboxStatus::Pending,
            SandboxStatus::Provisioning,
            SandboxStatus::Setup,
            SandboxStatus::ApplyingCode,
            SandboxStatus::InstallingPackages,
            SandboxStatus::Validating,
            SandboxStatus::Ready,
        ];
        let percents: Vec<u8> = path.iter().map(|s| percent_for(*s)).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[test]
    fn test_repair_reentry_stays_below_validating() {
        assert!(percent_for(SandboxStatus::Repairing) < percent_for(SandboxStatus::Validating));
        assert!(
            percent_for(SandboxStatus::Repairing) >= percent_for(SandboxStatus::InstallingPackages)
        );
    }

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let reporter = ProgressReporter::new(16);
        let mut rx = reporter.subscribe();
        let id = Uuid::new_v4();

        reporter.emit(id, SandboxStatus::Provisioning, 10, "acquiring environment");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.sandbox_id, id);
        assert_eq!(event.percent, 10);
        assert_eq!(event.step, "provisioning");
        assert!(!event.is_terminal());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let reporter = ProgressReporter::new(16);
        reporter.emit(Uuid::new_v4(), SandboxStatus::Ready, 100, "done");
    }
}
