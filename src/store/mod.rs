//! Sandbox record persistence
//!
//! The `SandboxRecord` is the aggregate root of the subsystem: one row
//! per sandbox, the single source of truth for status, retry counts, and
//! error history. `SandboxStore` abstracts the backend so the pipeline
//! can run against PostgreSQL in production and an in-process map in
//! tests and local development.

mod postgres;

pub use postgres::{init_pool, migrations, PostgresSandboxStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::pipeline::SandboxStatus;
use crate::progress::percent_for;
use crate::provider::ProviderKind;
use crate::repair::ErrorCategory;
use crate::{Error, Result};

/// Generated application code, path -> file content
pub type CodeFiles = BTreeMap<String, String>;

/// One recorded failure, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Stage the failure happened in
    pub stage: SandboxStatus,
    /// Classified category
    pub category: ErrorCategory,
    /// Human-readable cause
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// The durable sandbox record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: Uuid,
    pub tool_id: String,
    pub generation_id: String,

    pub provider: Option<ProviderKind>,
    /// Provider-assigned environment handle; retained on failure so a
    /// repair can reuse the environment
    pub external_id: Option<String>,
    /// Non-null iff status has ever reached ready
    pub url: Option<String>,

    pub status: SandboxStatus,

    pub retry_count: i32,
    pub max_retries: i32,
    pub repair_count: i32,
    pub max_repairs: i32,

    pub last_error: Option<String>,
    /// Ordered failure history, never silently truncated
    pub error_history: Vec<ErrorEntry>,

    pub build_passed: Option<bool>,
    pub tests_passed: Option<bool>,
    pub health_check_passed: Option<bool>,

    /// Stored generated code, needed for repair
    #[serde(skip_serializing)]
    pub code: Option<CodeFiles>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    /// Create a fresh record in `pending`
    pub fn new(
        tool_id: impl Into<String>,
        generation_id: impl Into<String>,
        code: CodeFiles,
        max_retries: i32,
        max_repairs: i32,
    ) -> Self {
        let now = Utc::now();
        SandboxRecord {
            id: Uuid::new_v4(),
            tool_id: tool_id.into(),
            generation_id: generation_id.into(),
            provider: None,
            external_id: None,
            url: None,
            status: SandboxStatus::Pending,
            retry_count: 0,
            max_retries,
            repair_count: 0,
            max_repairs,
            last_error: None,
            error_history: Vec::new(),
            build_passed: None,
            tests_passed: None,
            health_check_passed: None,
            code: Some(code),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new status, enforced by the transition table
    pub fn transition_to(&mut self, to: SandboxStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure cause. Must be called before the transition to
    /// `failed`; a failed record without a cause is a defect.
    pub fn record_failure(
        &mut self,
        stage: SandboxStatus,
        category: ErrorCategory,
        message: impl Into<String>,
    ) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.error_history.push(ErrorEntry {
            stage,
            category,
            message,
            occurred_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Category of the most recent failure, if any
    pub fn last_category(&self) -> Option<ErrorCategory> {
        self.error_history.last().map(|e| e.category)
    }

    /// Display percent. Terminal failure states keep the percent of the
    /// stage that failed instead of snapping back to zero; every
    /// surface showing a percent goes through here.
    pub fn percent(&self) -> u8 {
        match self.status {
            SandboxStatus::Failed | SandboxStatus::Terminated => self
                .error_history
                .last()
                .map(|entry| percent_for(entry.stage))
                .unwrap_or(0),
            other => percent_for(other),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn can_repair(&self) -> bool {
        self.repair_count < self.max_repairs
    }
}

/// Abstract interface for sandbox record persistence
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Insert a new record
    async fn create(&self, record: &SandboxRecord) -> Result<()>;

    /// Fetch by id
    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>>;

    /// The active (non-terminal) record for a tool, if one exists
    async fn active_for_tool(&self, tool_id: &str) -> Result<Option<SandboxRecord>>;

    /// Persist the full current state of a record
    async fn update(&self, record: &SandboxRecord) -> Result<()>;

    /// Health check
    async fn health_check(&self) -> Result<bool>;
}

/// In-process store for local development and tests
#[derive(Default)]
pub struct MemorySandboxStore {
    records: std::sync::Mutex<HashMap<Uuid, SandboxRecord>>,
}

impl MemorySandboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for MemorySandboxStore {
    async fn create(&self, record: &SandboxRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        let records = self.records.lock().expect("store mutex poisoned");
        Ok(records.get(&id).cloned())
    }

    async fn active_for_tool(&self, tool_id: &str) -> Result<Option<SandboxRecord>> {
        let records = self.records.lock().expect("store mutex poisoned");
        Ok(records
            .values()
            .filter(|r| r.tool_id == tool_id && r.status.is_active())
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn update(&self, record: &SandboxRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        if !records.contains_key(&record.id) {
            return Err(Error::NotFound(format!("sandbox {}", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_code() -> CodeFiles {
        let mut code = CodeFiles::new();
        code.insert("index.js".to_string(), "console.log('hi')".to_string());
        code
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = SandboxRecord::new("tool-1", "gen-1", sample_code(), 2, 3);
        assert_eq!(record.status, SandboxStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.url.is_none());
        assert!(record.can_retry());
        assert!(record.can_repair());
    }

    #[test]
    fn test_transition_enforced() {
        let mut record = SandboxRecord::new("tool-1", "gen-1", sample_code(), 2, 3);
        assert!(record.transition_to(SandboxStatus::Ready).is_err());
        record.transition_to(SandboxStatus::Provisioning).unwrap();
        assert_eq!(record.status, SandboxStatus::Provisioning);
    }

    #[test]
    fn test_failure_history_is_append_only() {
        let mut record = SandboxRecord::new("tool-1", "gen-1", sample_code(), 2, 3);
        record.record_failure(
            SandboxStatus::InstallingPackages,
            ErrorCategory::MissingPackage,
            "Cannot find module 'left-pad'",
        );
        record.record_failure(
            SandboxStatus::Validating,
            ErrorCategory::RuntimeError,
            "TypeError: x is not a function",
        );
        assert_eq!(record.error_history.len(), 2);
        assert_eq!(record.last_category(), Some(ErrorCategory::RuntimeError));
        assert_eq!(
            record.last_error.as_deref(),
            Some("TypeError: x is not a function")
        );
    }

    #[test]
    fn test_percent_keeps_failed_stage_floor() {
        let mut record = SandboxRecord::new("tool-1", "gen-1", sample_code(), 2, 3);
        assert_eq!(record.percent(), 0);
        record.transition_to(SandboxStatus::Provisioning).unwrap();
        record.transition_to(SandboxStatus::Setup).unwrap();
        record.transition_to(SandboxStatus::ApplyingCode).unwrap();
        record.transition_to(SandboxStatus::InstallingPackages).unwrap();
        assert_eq!(record.percent(), 60);

        record.record_failure(
            SandboxStatus::InstallingPackages,
            ErrorCategory::MissingPackage,
            "Cannot find module 'left-pad'",
        );
        record.transition_to(SandboxStatus::Failed).unwrap();
        assert_eq!(record.percent(), 60, "failed keeps the stage floor");

        record.transition_to(SandboxStatus::Terminated).unwrap();
        assert_eq!(record.percent(), 60, "terminated keeps the stage floor");
    }

    #[tokio::test]
    async fn test_memory_store_active_for_tool() {
        let store = MemorySandboxStore::new();
        let mut old = SandboxRecord::new("tool-1", "gen-1", sample_code(), 2, 3);
        old.transition_to(SandboxStatus::Terminated).unwrap();
        store.create(&old).await.unwrap();

        assert!(store.active_for_tool("tool-1").await.unwrap().is_none());

        let fresh = SandboxRecord::new("tool-1", "gen-2", sample_code(), 2, 3);
        store.create(&fresh).await.unwrap();
        let active = store.active_for_tool("tool-1").await.unwrap().unwrap();
        assert_eq!(active.id, fresh.id);
    }
}
