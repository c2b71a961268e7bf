//! Sandbox status lifecycle
//!
//! Status is a closed sum type with a single authoritative transition
//! function. Call sites never set raw strings; every change goes through
//! `can_transition`, and illegal edges are rejected.

use serde::{Deserialize, Serialize};

/// Pipeline status of a sandbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Provisioning,
    Setup,
    ApplyingCode,
    InstallingPackages,
    Validating,
    Repairing,
    Ready,
    Failed,
    Terminated,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Provisioning => "provisioning",
            SandboxStatus::Setup => "setup",
            SandboxStatus::ApplyingCode => "applying_code",
            SandboxStatus::InstallingPackages => "installing_packages",
            SandboxStatus::Validating => "validating",
            SandboxStatus::Repairing => "repairing",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(SandboxStatus::Pending),
            "provisioning" => Ok(SandboxStatus::Provisioning),
            "setup" => Ok(SandboxStatus::Setup),
            "applying_code" => Ok(SandboxStatus::ApplyingCode),
            "installing_packages" => Ok(SandboxStatus::InstallingPackages),
            "validating" => Ok(SandboxStatus::Validating),
            "repairing" => Ok(SandboxStatus::Repairing),
            "ready" => Ok(SandboxStatus::Ready),
            "failed" => Ok(SandboxStatus::Failed),
            "terminated" => Ok(SandboxStatus::Terminated),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sandbox status: {}",
                other
            ))),
        }
    }

    /// Terminated is the only state with no outgoing edges; ready and
    /// failed still accept terminate/retry/repair.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Terminated)
    }

    /// States in which a record counts as "active" for the one-active-
    /// sandbox-per-tool invariant.
    pub fn is_active(&self) -> bool {
        !matches!(self, SandboxStatus::Terminated)
    }

    /// The authoritative transition table.
    ///
    /// Forward edges follow the pipeline order; the only backward edges
    /// are `failed -> repairing` and `failed -> provisioning` (retry).
    /// Any state except `terminated` may be terminated.
    pub fn can_transition(self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;

        if self == Terminated {
            return false;
        }
        if to == Terminated {
            return true;
        }

        matches!(
            (self, to),
            (Pending, Provisioning)
                | (Provisioning, Setup)
                | (Provisioning, Failed)
                | (Setup, ApplyingCode)
                | (Setup, Failed)
                | (ApplyingCode, InstallingPackages)
                | (ApplyingCode, Failed)
                | (InstallingPackages, Validating)
                | (InstallingPackages, Failed)
                | (Validating, Ready)
                | (Validating, Failed)
                | (Failed, Repairing)
                | (Failed, Provisioning)
                | (Repairing, Validating)
                | (Repairing, Failed)
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SandboxStatus::*;
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [
            Pending,
            Provisioning,
            Setup,
            ApplyingCode,
            InstallingPackages,
            Validating,
            Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_and_recovery_edges() {
        for stage in [Provisioning, Setup, ApplyingCode, InstallingPackages, Validating] {
            assert!(stage.can_transition(Failed));
        }
        assert!(Failed.can_transition(Repairing));
        assert!(Failed.can_transition(Provisioning));
        assert!(Repairing.can_transition(Validating));
        assert!(Repairing.can_transition(Failed));
    }

    #[test]
    fn test_illegal_edges_rejected() {
        assert!(!Pending.can_transition(Ready));
        assert!(!Ready.can_transition(Provisioning));
        assert!(!Setup.can_transition(Validating));
        assert!(!Validating.can_transition(Setup));
        assert!(!Repairing.can_transition(Provisioning));
    }

    #[test]
    fn test_terminated_is_final() {
        for status in [
            Pending,
            Provisioning,
            Setup,
            ApplyingCode,
            InstallingPackages,
            Validating,
            Repairing,
            Ready,
            Failed,
        ] {
            assert!(status.can_transition(Terminated));
        }
        assert!(!Terminated.can_transition(Pending));
        assert!(!Terminated.can_transition(Terminated));
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn test_round_trip_strings() {
        for status in [Pending, ApplyingCode, InstallingPackages, Ready] {
            assert_eq!(SandboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SandboxStatus::parse("exploded").is_err());
    }
}
