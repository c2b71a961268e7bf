//! Pipeline orchestrator
//!
//! Drives a single sandbox record through provisioning, setup, code
//! application, dependency install, and validation, with caller-initiated
//! retry and repair from `failed`. Transitions are serialized per
//! sandbox id, persisted before the matching progress event is emitted,
//! and every exit path that acquired an environment either tears it down
//! or deliberately retains it for repair.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::progress::{percent_for, ProgressReporter};
use crate::provider::{
    CommandOutput, EnvironmentHandle, ProviderError, ProviderFactory, ProviderKind,
    ProviderResult, SandboxProvider,
};
use crate::repair::{classify, ErrorCategory, RepairClient};
use crate::store::{CodeFiles, SandboxRecord, SandboxStore};
use crate::{Error, Result};

use super::scaffold;
use super::SandboxStatus;

/// Request to start a fresh pipeline run
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub tool_id: String,
    pub generation_id: String,
    pub code: CodeFiles,
    /// Explicitly terminate an existing active sandbox for the tool
    pub supersede: bool,
}

/// Terminal result of one pipeline, retry, or repair run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub sandbox_id: Uuid,
    pub sandbox_url: Option<String>,
    pub status: SandboxStatus,
    /// Whether a full restart is still within budget
    pub can_retry: bool,
    /// Internal error detail
    pub error: Option<String>,
    /// Short, actionable message for the end user
    pub user_message: Option<String>,
}

impl PipelineOutcome {
    fn succeeded(record: &SandboxRecord) -> Self {
        PipelineOutcome {
            success: true,
            sandbox_id: record.id,
            sandbox_url: record.url.clone(),
            status: record.status,
            can_retry: false,
            error: None,
            user_message: None,
        }
    }

    fn failed(record: &SandboxRecord) -> Self {
        PipelineOutcome {
            success: false,
            sandbox_id: record.id,
            sandbox_url: None,
            status: record.status,
            can_retry: record.can_retry(),
            error: record.last_error.clone(),
            user_message: Some(user_message_for(
                record.last_category().unwrap_or(ErrorCategory::Unknown),
            )),
        }
    }

    fn terminated(record: &SandboxRecord) -> Self {
        PipelineOutcome {
            success: false,
            sandbox_id: record.id,
            sandbox_url: None,
            status: SandboxStatus::Terminated,
            can_retry: false,
            error: Some("terminated by caller".to_string()),
            user_message: Some("The preview build was terminated.".to_string()),
        }
    }

    fn rejected(record: &SandboxRecord, detail: impl Into<String>, user_message: &str) -> Self {
        PipelineOutcome {
            success: false,
            sandbox_id: record.id,
            sandbox_url: None,
            status: record.status,
            can_retry: record.can_retry(),
            error: Some(detail.into()),
            user_message: Some(user_message.to_string()),
        }
    }
}

fn user_message_for(category: ErrorCategory) -> String {
    match category {
        ErrorCategory::Provisioning => {
            "The sandbox environment could not be created. Retrying usually helps."
        }
        ErrorCategory::Setup => "The base toolchain failed to start. You can retry.",
        ErrorCategory::Write => "The generated code could not be written. You can retry.",
        ErrorCategory::MissingPackage => {
            "A dependency failed to install. Automated repair can usually fix this."
        }
        ErrorCategory::MissingImport => {
            "The code references a file or export that does not exist. Try automated repair."
        }
        ErrorCategory::SyntaxError => {
            "The generated code has a syntax error. Try automated repair."
        }
        ErrorCategory::RuntimeError => {
            "The app built but crashed while running. Try automated repair."
        }
        ErrorCategory::Unknown => {
            "The preview failed for an unrecognized reason. You can retry."
        }
    }
    .to_string()
}

/// Operational self-check result
#[derive(Debug, Clone, Serialize)]
pub struct SmokeReport {
    pub success: bool,
    pub provider: Option<ProviderKind>,
    /// Last step the check reached
    pub step_reached: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// A stage-level failure, classified at the boundary
#[derive(Debug)]
struct StageFailure {
    category: ErrorCategory,
    message: String,
}

impl StageFailure {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        StageFailure {
            category,
            message: message.into(),
        }
    }
}

type StageResult<T> = std::result::Result<T, StageFailure>;

/// The pipeline orchestrator
pub struct Orchestrator {
    store: Arc<dyn SandboxStore>,
    factory: ProviderFactory,
    progress: ProgressReporter,
    repair: Option<RepairClient>,
    config: PipelineConfig,
    http: reqwest::Client,
    /// Sandbox ids with a pipeline run in flight
    in_flight: Mutex<HashSet<Uuid>>,
    /// Terminate requests received while a run was in flight
    cancelled: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SandboxStore>,
        factory: ProviderFactory,
        progress: ProgressReporter,
        repair: Option<RepairClient>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health_probe_timeout_secs))
            .build()?;

        Ok(Orchestrator {
            store,
            factory,
            progress,
            repair,
            config,
            http,
            in_flight: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        self.factory.configured()
    }

    /// Start a fresh pipeline run for a tool + generation.
    ///
    /// Fails fast with a configuration error before any record is
    /// created when no provider is configured.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<PipelineOutcome> {
        if request.code.is_empty() {
            return Err(Error::InvalidInput("generated code is empty".to_string()));
        }

        // Configuration is checked before any record reaches provisioning
        self.factory.acquire()?;

        if let Some(active) = self.store.active_for_tool(&request.tool_id).await? {
            if !request.supersede {
                return Err(Error::Conflict(format!(
                    "tool {} already has active sandbox {} ({})",
                    request.tool_id, active.id, active.status
                )));
            }
            info!(sandbox = %active.id, "Superseding active sandbox");
            self.terminate(active.id).await?;
        }

        let mut record = SandboxRecord::new(
            request.tool_id,
            request.generation_id,
            request.code,
            self.config.max_retries,
            self.config.max_repairs,
        );
        self.store.create(&record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Pending, 0, "Sandbox record created");

        let _guard = self.begin(record.id)?;
        self.run_pipeline(&mut record).await
    }

    /// Full restart from `failed`. Increments the retry count, discards
    /// the prior environment, and re-runs from provisioning.
    pub async fn retry(&self, id: Uuid) -> Result<PipelineOutcome> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))?;

        if record.status != SandboxStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "retry is only valid from failed, sandbox is {}",
                record.status
            )));
        }
        if !record.can_retry() {
            return Err(Error::RetryExhausted(format!(
                "{} of {} retries used",
                record.retry_count, record.max_retries
            )));
        }

        let _guard = self.begin(id)?;

        self.teardown_recorded(&record).await;
        record.retry_count += 1;
        record.external_id = None;
        record.provider = None;
        record.build_passed = None;
        record.tests_passed = None;
        record.health_check_passed = None;
        self.store.update(&record).await?;

        info!(sandbox = %id, retry = record.retry_count, "Retrying pipeline");
        self.run_pipeline(&mut record).await
    }

    /// AI-assisted repair from `failed`, without a full restart.
    pub async fn repair(&self, id: Uuid) -> Result<PipelineOutcome> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))?;

        if record.status != SandboxStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "repair is only valid from failed, sandbox is {}",
                record.status
            )));
        }

        let _guard = self.begin(id)?;

        let Some(client) = self.repair.clone() else {
            return Ok(PipelineOutcome::rejected(
                &record,
                "no repair backend configured",
                "Automated repair is not available. You can retry instead.",
            ));
        };
        let code = match record.code.clone() {
            Some(code) if !code.is_empty() => code,
            _ => {
                return Ok(PipelineOutcome::rejected(
                    &record,
                    "no stored code to repair",
                    "There is no stored code to repair. Start a new generation.",
                ));
            }
        };
        if !record.can_repair() {
            return Ok(PipelineOutcome::rejected(
                &record,
                format!(
                    "{} of {} repair attempts used",
                    record.repair_count, record.max_repairs
                ),
                "The repair budget is exhausted. You can retry or start over.",
            ));
        }

        let category = record.last_category().unwrap_or(ErrorCategory::Unknown);
        let error_message = record.last_error.clone().unwrap_or_default();

        record.repair_count += 1;
        let percent = self
            .advance(&mut record, SandboxStatus::Repairing, "Attempting automated repair")
            .await?;

        let outcome = match client.request_patch(category, &error_message, &code).await {
            Ok(patch) if patch.success && !patch.files.is_empty() => {
                if let Some(notes) = &patch.notes {
                    info!(sandbox = %id, notes, "Repair patch accepted");
                }
                let mut merged = code;
                merged.extend(patch.files);
                record.code = Some(merged);
                self.store.update(&record).await?;
                self.revalidate_after_repair(&mut record, percent).await?
            }
            Ok(patch) => {
                let detail = patch
                    .notes
                    .unwrap_or_else(|| "repair backend declined to patch".to_string());
                self.fail_from_repair(&mut record, category, detail, percent).await?
            }
            Err(e) => {
                self.fail_from_repair(
                    &mut record,
                    category,
                    format!("repair attempt failed: {}", e),
                    percent,
                )
                .await?
            }
        };
        self.sweep_cancel(&mut record, outcome).await
    }

    /// Release provider resources and mark the record terminated.
    /// Idempotent; safe to call from any state, including mid-run.
    pub async fn terminate(&self, id: Uuid) -> Result<()> {
        if self.in_flight.lock().expect("in_flight poisoned").contains(&id) {
            // The running pipeline honors the flag at its next stage
            // boundary and performs the teardown itself.
            self.cancelled.lock().expect("cancelled poisoned").insert(id);
            info!(sandbox = %id, "Terminate requested for in-flight sandbox");
            return Ok(());
        }

        let Some(mut record) = self.store.get(id).await? else {
            return Err(Error::NotFound(format!("sandbox {}", id)));
        };
        if record.status == SandboxStatus::Terminated {
            return Ok(());
        }

        self.teardown_recorded(&record).await;
        record.external_id = None;
        let floor = record.percent();
        record.transition_to(SandboxStatus::Terminated)?;
        self.store.update(&record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Terminated, floor, "Sandbox terminated");
        Ok(())
    }

    /// End-to-end self-check: minimal environment, trivial file, one
    /// command, URL fetch, teardown.
    pub async fn smoke_test(&self) -> SmokeReport {
        let start = Instant::now();
        let mut report = SmokeReport {
            success: false,
            provider: None,
            step_reached: "factory".to_string(),
            duration_ms: 0,
            error: None,
        };

        let finish = |mut report: SmokeReport, start: Instant| {
            report.duration_ms = start.elapsed().as_millis() as u64;
            report
        };

        let provider = match self.factory.acquire() {
            Ok(p) => p,
            Err(e) => {
                report.error = Some(e.to_string());
                return finish(report, start);
            }
        };
        report.provider = Some(provider.kind());

        report.step_reached = "create_environment".to_string();
        let env = match self.bounded(provider.create_environment()).await {
            Ok(env) => env,
            Err(e) => {
                report.error = Some(e.to_string());
                return finish(report, start);
            }
        };

        report.step_reached = "write_file".to_string();
        if let Err(e) = self.bounded(provider.write_file(&env, "smoke.txt", "ok")).await {
            report.error = Some(e.to_string());
            let _ = self.bounded(provider.terminate(&env)).await;
            return finish(report, start);
        }

        report.step_reached = "run_command".to_string();
        match self.bounded(provider.run_command(&env, "cat smoke.txt")).await {
            Ok(out) if out.succeeded() => {}
            Ok(out) => {
                report.error = Some(format!("command exited {}: {}", out.exit_code, out.combined()));
                let _ = self.bounded(provider.terminate(&env)).await;
                return finish(report, start);
            }
            Err(e) => {
                report.error = Some(e.to_string());
                let _ = self.bounded(provider.terminate(&env)).await;
                return finish(report, start);
            }
        }

        report.step_reached = "public_url".to_string();
        if let Err(e) = self.bounded(provider.get_public_url(&env)).await {
            report.error = Some(e.to_string());
            let _ = self.bounded(provider.terminate(&env)).await;
            return finish(report, start);
        }

        report.step_reached = "terminate".to_string();
        if let Err(e) = self.bounded(provider.terminate(&env)).await {
            report.error = Some(e.to_string());
            return finish(report, start);
        }

        report.success = true;
        finish(report, start)
    }

    // ---- pipeline internals ----

    /// Run the stages, then honor any terminate request that arrived in
    /// a window no stage-boundary check covers (e.g. during validation
    /// commands or on the failure path).
    async fn run_pipeline(&self, record: &mut SandboxRecord) -> Result<PipelineOutcome> {
        let outcome = self.run_stages(record).await?;
        self.sweep_cancel(record, outcome).await
    }

    async fn run_stages(&self, record: &mut SandboxRecord) -> Result<PipelineOutcome> {
        // Stage 1: provisioning
        let mut percent = self
            .advance(record, SandboxStatus::Provisioning, "Acquiring sandbox environment")
            .await?;

        let preferred = self.factory.acquire()?;
        let (provider, env) = match self.bounded(preferred.create_environment()).await {
            Ok(env) => (preferred, env),
            Err(e) => {
                let fallback = if e.is_fallback_worthy() {
                    self.factory.fallback(preferred.kind())
                } else {
                    None
                };
                match fallback {
                    Some(next) => {
                        warn!(
                            failed = %preferred.kind(),
                            fallback = %next.kind(),
                            "Provider failed to create environment, falling back: {}", e
                        );
                        match self.bounded(next.create_environment()).await {
                            Ok(env) => (next, env),
                            Err(e2) => {
                                return self
                                    .fail(record, ErrorCategory::Provisioning, e2.to_string(), percent)
                                    .await;
                            }
                        }
                    }
                    None => {
                        return self
                            .fail(record, ErrorCategory::Provisioning, e.to_string(), percent)
                            .await;
                    }
                }
            }
        };

        record.provider = Some(provider.kind());
        record.external_id = Some(env.external_id.clone());
        self.store.update(record).await?;

        if let Some(outcome) = self.check_cancelled(record, &provider, &env, percent).await? {
            return Ok(outcome);
        }

        // Stage 2: setup
        percent = self
            .advance(record, SandboxStatus::Setup, "Installing base toolchain")
            .await?;
        if let Err(f) = self.run_setup(&provider, &env).await {
            return self.fail(record, f.category, f.message, percent).await;
        }

        if let Some(outcome) = self.check_cancelled(record, &provider, &env, percent).await? {
            return Ok(outcome);
        }

        // Stage 3: applying code
        percent = self
            .advance(record, SandboxStatus::ApplyingCode, "Writing generated code")
            .await?;
        if let Err(f) = self.apply_code(record, &provider, &env).await {
            return self.fail(record, f.category, f.message, percent).await;
        }

        if let Some(outcome) = self.check_cancelled(record, &provider, &env, percent).await? {
            return Ok(outcome);
        }

        // Stage 4: installing packages
        percent = self
            .advance(record, SandboxStatus::InstallingPackages, "Installing dependencies")
            .await?;
        if let Err(f) = self.run_install(&provider, &env).await {
            return self.fail(record, f.category, f.message, percent).await;
        }

        if let Some(outcome) = self.check_cancelled(record, &provider, &env, percent).await? {
            return Ok(outcome);
        }

        // Stage 5: validating
        percent = self
            .advance(record, SandboxStatus::Validating, "Validating build and health")
            .await?;
        self.finish_validation(record, &provider, &env, percent).await
    }

    /// Run validation and move to the terminal state. Shared between the
    /// main pipeline and repair re-validation.
    async fn finish_validation(
        &self,
        record: &mut SandboxRecord,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
        percent: u8,
    ) -> Result<PipelineOutcome> {
        match self.run_validation(record, provider, env).await? {
            Ok(url) => {
                // A terminate may have arrived while validation ran;
                // the ready write must not win that race.
                if let Some(outcome) = self.check_cancelled(record, provider, env, percent).await? {
                    return Ok(outcome);
                }
                record.url = Some(url);
                record.transition_to(SandboxStatus::Ready)?;
                self.store.update(record).await?;
                self.progress
                    .emit(record.id, SandboxStatus::Ready, 100, "Preview ready");
                info!(sandbox = %record.id, url = record.url.as_deref().unwrap_or_default(), "Sandbox ready");
                Ok(PipelineOutcome::succeeded(record))
            }
            Err(f) => self.fail(record, f.category, f.message, percent).await,
        }
    }

    async fn run_setup(
        &self,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
    ) -> StageResult<()> {
        for (path, content) in scaffold::base_files() {
            self.bounded(provider.write_file(env, path, content))
                .await
                .map_err(|e| StageFailure::new(ErrorCategory::Setup, e.to_string()))?;
        }

        let out = self
            .run(provider, env, scaffold::START_DEV_COMMAND)
            .await
            .map_err(|e| StageFailure::new(ErrorCategory::Setup, e.to_string()))?;
        if !out.succeeded() {
            return Err(StageFailure::new(ErrorCategory::Setup, out.combined()));
        }
        Ok(())
    }

    async fn apply_code(
        &self,
        record: &SandboxRecord,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
    ) -> StageResult<()> {
        let Some(code) = &record.code else {
            return Err(StageFailure::new(ErrorCategory::Write, "no code to apply"));
        };
        for (path, content) in code {
            self.bounded(provider.write_file(env, path, content))
                .await
                .map_err(|e| StageFailure::new(ErrorCategory::Write, e.to_string()))?;
        }
        Ok(())
    }

    async fn run_install(
        &self,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
    ) -> StageResult<()> {
        let out = self
            .run(provider, env, scaffold::INSTALL_COMMAND)
            .await
            .map_err(|e| StageFailure::new(ErrorCategory::Unknown, e.to_string()))?;
        if !out.succeeded() {
            let message = out.combined();
            let category = match classify(&message) {
                // Install failures with no recognizable pattern are still
                // almost always dependency problems.
                ErrorCategory::Unknown => ErrorCategory::MissingPackage,
                other => other,
            };
            return Err(StageFailure::new(category, message));
        }
        Ok(())
    }

    /// Build, smoke check, and health probe. Each flag is recorded
    /// independently; a build can pass while the app still fails to
    /// serve.
    async fn run_validation(
        &self,
        record: &mut SandboxRecord,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
    ) -> Result<StageResult<String>> {
        let build = match self.run(provider, env, scaffold::BUILD_COMMAND).await {
            Ok(out) => out,
            Err(e) => {
                return Ok(Err(StageFailure::new(ErrorCategory::Unknown, e.to_string())))
            }
        };
        if !build.succeeded() {
            record.build_passed = Some(false);
            self.store.update(record).await?;
            let message = build.combined();
            return Ok(Err(StageFailure::new(classify(&message), message)));
        }
        record.build_passed = Some(true);
        self.store.update(record).await?;

        let smoke = match self.run(provider, env, scaffold::SMOKE_COMMAND).await {
            Ok(out) => out,
            Err(e) => {
                return Ok(Err(StageFailure::new(ErrorCategory::Unknown, e.to_string())))
            }
        };
        if !smoke.succeeded() {
            record.tests_passed = Some(false);
            self.store.update(record).await?;
            let message = smoke.combined();
            return Ok(Err(StageFailure::new(classify(&message), message)));
        }
        record.tests_passed = Some(true);
        self.store.update(record).await?;

        let url = match self.bounded(provider.get_public_url(env)).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                record.health_check_passed = Some(false);
                self.store.update(record).await?;
                return Ok(Err(StageFailure::new(
                    ErrorCategory::Unknown,
                    "environment did not expose a public URL",
                )));
            }
            Err(e) => {
                return Ok(Err(StageFailure::new(ErrorCategory::Unknown, e.to_string())))
            }
        };

        let healthy = match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        record.health_check_passed = Some(healthy);
        self.store.update(record).await?;
        if !healthy {
            return Ok(Err(StageFailure::new(
                ErrorCategory::RuntimeError,
                format!("health probe against {} failed", url),
            )));
        }

        Ok(Ok(url))
    }

    /// Re-validate after an accepted repair patch, reusing the recorded
    /// environment when it is still available.
    async fn revalidate_after_repair(
        &self,
        record: &mut SandboxRecord,
        repair_percent: u8,
    ) -> Result<PipelineOutcome> {
        let reuse = match (record.provider, record.external_id.as_ref()) {
            (Some(kind), Some(external_id)) => self
                .factory
                .by_kind(kind)
                .map(|p| (p, EnvironmentHandle::new(kind, external_id.clone()))),
            _ => None,
        };

        let (provider, env) = match reuse {
            Some(pair) => pair,
            None => {
                // Environment is gone; rebuild one while still repairing.
                let provider = self.factory.acquire()?;
                let env = match self.bounded(provider.create_environment()).await {
                    Ok(env) => env,
                    Err(e) => {
                        return self
                            .fail_from_repair(
                                record,
                                ErrorCategory::Provisioning,
                                e.to_string(),
                                repair_percent,
                            )
                            .await;
                    }
                };
                record.provider = Some(provider.kind());
                record.external_id = Some(env.external_id.clone());
                self.store.update(record).await?;
                if let Err(f) = self.run_setup(&provider, &env).await {
                    return self
                        .fail_from_repair(record, f.category, f.message, repair_percent)
                        .await;
                }
                (provider, env)
            }
        };

        if let Err(f) = self.apply_code(record, &provider, &env).await {
            return self
                .fail_from_repair(record, f.category, f.message, repair_percent)
                .await;
        }
        if let Err(f) = self.run_install(&provider, &env).await {
            return self
                .fail_from_repair(record, f.category, f.message, repair_percent)
                .await;
        }

        record.build_passed = None;
        record.tests_passed = None;
        record.health_check_passed = None;
        let percent = self
            .advance(record, SandboxStatus::Validating, "Re-validating after repair")
            .await?;
        self.finish_validation(record, &provider, &env, percent).await
    }

    // ---- helpers ----

    /// Record the cause, transition to failed, persist, then emit.
    async fn fail(
        &self,
        record: &mut SandboxRecord,
        category: ErrorCategory,
        message: String,
        percent: u8,
    ) -> Result<PipelineOutcome> {
        warn!(sandbox = %record.id, stage = %record.status, %category, "Stage failed: {}", message);
        record.record_failure(record.status, category, message.clone());
        record.transition_to(SandboxStatus::Failed)?;
        self.store.update(record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Failed, percent, message);
        Ok(PipelineOutcome::failed(record))
    }

    /// Like `fail`, but from the repairing state
    async fn fail_from_repair(
        &self,
        record: &mut SandboxRecord,
        category: ErrorCategory,
        message: String,
        percent: u8,
    ) -> Result<PipelineOutcome> {
        warn!(sandbox = %record.id, %category, "Repair failed: {}", message);
        record.record_failure(SandboxStatus::Repairing, category, message.clone());
        record.transition_to(SandboxStatus::Failed)?;
        self.store.update(record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Failed, percent, message);
        Ok(PipelineOutcome::failed(record))
    }

    /// Transition, persist, then emit. Persist-before-emit is the
    /// ordering guarantee status pollers rely on.
    async fn advance(
        &self,
        record: &mut SandboxRecord,
        to: SandboxStatus,
        message: &str,
    ) -> Result<u8> {
        record.transition_to(to)?;
        self.store.update(record).await?;
        let percent = percent_for(to);
        self.progress.emit(record.id, to, percent, message);
        Ok(percent)
    }

    async fn run(
        &self,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
        command: &str,
    ) -> ProviderResult<CommandOutput> {
        self.bounded(provider.run_command(env, command)).await
    }

    /// Bound any provider call so a hung external service cannot stall
    /// a sandbox indefinitely.
    async fn bounded<T, F>(&self, fut: F) -> ProviderResult<T>
    where
        F: std::future::Future<Output = ProviderResult<T>>,
    {
        match tokio::time::timeout(Duration::from_secs(self.config.command_timeout_secs), fut).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.command_timeout_secs)),
        }
    }

    /// Last-chance cancel check after a run has reached its terminal
    /// state. Tears down the retained environment and converts the
    /// outcome to terminated, so a DELETE acknowledged mid-run is never
    /// silently dropped.
    async fn sweep_cancel(
        &self,
        record: &mut SandboxRecord,
        outcome: PipelineOutcome,
    ) -> Result<PipelineOutcome> {
        let pending = self.cancelled.lock().expect("cancelled poisoned").remove(&record.id);
        if !pending || record.status == SandboxStatus::Terminated {
            return Ok(outcome);
        }

        info!(sandbox = %record.id, "Honoring terminate received mid-run");
        self.teardown_recorded(record).await;
        record.external_id = None;
        let floor = record.percent();
        record.transition_to(SandboxStatus::Terminated)?;
        self.store.update(record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Terminated, floor, "Sandbox terminated");
        Ok(PipelineOutcome::terminated(record))
    }

    /// Honor a terminate request that arrived mid-run. Returns the
    /// terminal outcome when the run was cancelled.
    async fn check_cancelled(
        &self,
        record: &mut SandboxRecord,
        provider: &Arc<dyn SandboxProvider>,
        env: &EnvironmentHandle,
        percent: u8,
    ) -> Result<Option<PipelineOutcome>> {
        let was_cancelled = self.cancelled.lock().expect("cancelled poisoned").remove(&record.id);
        if !was_cancelled {
            return Ok(None);
        }

        info!(sandbox = %record.id, "Cancelling in-flight pipeline");
        if let Err(e) = self.bounded(provider.terminate(env)).await {
            warn!(sandbox = %record.id, "Teardown during cancel failed: {}", e);
        }
        record.external_id = None;
        record.transition_to(SandboxStatus::Terminated)?;
        self.store.update(record).await?;
        self.progress
            .emit(record.id, SandboxStatus::Terminated, percent, "Sandbox terminated");

        Ok(Some(PipelineOutcome::terminated(record)))
    }

    /// Best-effort teardown of whatever environment the record holds
    async fn teardown_recorded(&self, record: &SandboxRecord) {
        let (Some(kind), Some(external_id)) = (record.provider, record.external_id.as_ref()) else {
            return;
        };
        let Some(provider) = self.factory.by_kind(kind) else {
            warn!(sandbox = %record.id, provider = %kind, "No adapter for recorded provider, skipping teardown");
            return;
        };
        let env = EnvironmentHandle::new(kind, external_id.clone());
        if let Err(e) = self.bounded(provider.terminate(&env)).await {
            warn!(sandbox = %record.id, "Environment teardown failed: {}", e);
        }
    }

    fn begin(&self, id: Uuid) -> Result<FlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock().expect("in_flight poisoned");
        if !in_flight.insert(id) {
            return Err(Error::Busy(format!(
                "a pipeline run is already in flight for sandbox {}",
                id
            )));
        }
        Ok(FlightGuard {
            orchestrator: self,
            id,
        })
    }
}

/// Removes the sandbox from the in-flight set on every exit path
struct FlightGuard<'a> {
    orchestrator: &'a Orchestrator,
    id: Uuid,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator
            .in_flight
            .lock()
            .expect("in_flight poisoned")
            .remove(&self.id);
        self.orchestrator
            .cancelled
            .lock()
            .expect("cancelled poisoned")
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepairConfig;
    use crate::provider::testing::ScriptedProvider;
    use crate::store::MemorySandboxStore;
    use secrecy::SecretString;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            max_retries: 2,
            max_repairs: 3,
            command_timeout_secs: 5,
            health_probe_timeout_secs: 2,
        }
    }

    fn sample_code() -> CodeFiles {
        let mut code = CodeFiles::new();
        code.insert(
            "index.js".to_string(),
            "const pad = require('left-pad');".to_string(),
        );
        code
    }

    fn orchestrator(
        providers: Vec<Arc<dyn SandboxProvider>>,
        repair: Option<RepairClient>,
    ) -> (Arc<Orchestrator>, Arc<MemorySandboxStore>) {
        let store = Arc::new(MemorySandboxStore::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            ProviderFactory::from_providers(providers),
            ProgressReporter::new(64),
            repair,
            pipeline_config(),
        )
        .unwrap();
        (Arc::new(orchestrator), store)
    }

    async fn healthy_preview_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("preview up"))
            .mount(&server)
            .await;
        server
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            tool_id: "tool-1".to_string(),
            generation_id: "gen-1".to_string(),
            code: sample_code(),
            supersede: false,
        }
    }

    #[tokio::test]
    async fn test_happy_path_reaches_ready_with_all_flags() {
        let preview = healthy_preview_server().await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orchestrator, store) = orchestrator(vec![provider], None);

        let mut events = orchestrator.progress().subscribe();
        let outcome = orchestrator.provision(provision_request()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, SandboxStatus::Ready);
        assert_eq!(outcome.sandbox_url.as_deref(), Some(preview.uri().as_str()));

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Ready);
        assert_eq!(record.build_passed, Some(true));
        assert_eq!(record.tests_passed, Some(true));
        assert_eq!(record.health_check_passed, Some(true));
        assert!(record.url.is_some());

        // Progress is monotone and ends with exactly one terminal event
        let mut percents = Vec::new();
        let mut terminals = 0;
        while let Ok(event) = events.try_recv() {
            percents.push(event.percent);
            if event.is_terminal() {
                terminals += 1;
            }
        }
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(terminals, 1);
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_zero_providers_is_config_error_before_any_record() {
        let (orchestrator, store) = orchestrator(vec![], None);
        let err = orchestrator.provision(provision_request()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(store.active_for_tool("tool-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_sandbox_conflicts_unless_superseded() {
        let preview = healthy_preview_server().await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orchestrator, store) = orchestrator(vec![provider.clone()], None);

        let first = orchestrator.provision(provision_request()).await.unwrap();
        assert!(first.success);

        let err = orchestrator.provision(provision_request()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut superseding = provision_request();
        superseding.supersede = true;
        let second = orchestrator.provision(superseding).await.unwrap();
        assert!(second.success);
        assert_ne!(second.sandbox_id, first.sandbox_id);

        let prior = store.get(first.sandbox_id).await.unwrap().unwrap();
        assert_eq!(prior.status, SandboxStatus::Terminated);
        assert!(provider.terminations.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_install_failure_classified_and_repaired_to_ready() {
        let preview = healthy_preview_server().await;

        // Install fails once with a missing package, passes afterwards
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox)
                .with_url(preview.uri())
                .on_command_once(
                    "npm install",
                    Ok(CommandOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: "Error: Cannot find module 'left-pad'".to_string(),
                    }),
                ),
        );

        // Repair backend returns a patch removing the bad import
        let repair_server = MockServer::start().await;
        let completion = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"success\": true, \"files\": {\"index.js\": \"const pad = (s) => s;\"}}"
                }
            }]
        });
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion))
            .mount(&repair_server)
            .await;

        let repair = RepairClient::new(RepairConfig {
            api_key: SecretString::from("sk-repair".to_string()),
            base_url: repair_server.uri(),
            model: "test/patcher".to_string(),
            timeout_secs: 5,
        })
        .unwrap();

        let (orchestrator, store) = orchestrator(vec![provider.clone()], Some(repair));

        let outcome = orchestrator.provision(provision_request()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, SandboxStatus::Failed);
        assert!(outcome.can_retry);

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.last_category(), Some(ErrorCategory::MissingPackage));
        assert!(record.last_error.as_deref().unwrap().contains("left-pad"));

        let repaired = orchestrator.repair(outcome.sandbox_id).await.unwrap();
        assert!(repaired.success, "repair outcome: {:?}", repaired);
        assert_eq!(repaired.status, SandboxStatus::Ready);

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Ready);
        assert_eq!(record.repair_count, 1);
        assert_eq!(record.retry_count, 0, "repair must not consume retries");
        assert_eq!(
            record.code.unwrap().get("index.js").unwrap(),
            "const pad = (s) => s;"
        );
        // Environment was reused, not torn down
        assert_eq!(provider.terminations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_rejected_when_not_failed() {
        let preview = healthy_preview_server().await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orchestrator, _store) = orchestrator(vec![provider], None);

        let outcome = orchestrator.provision(provision_request()).await.unwrap();
        let err = orchestrator.retry(outcome.sandbox_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_retry_rejected_when_budget_exhausted() {
        let (orchestrator, store) = orchestrator(
            vec![Arc::new(ScriptedProvider::new(ProviderKind::RemoteSandbox))],
            None,
        );

        let mut record = SandboxRecord::new("tool-x", "gen-x", sample_code(), 2, 3);
        record.transition_to(SandboxStatus::Provisioning).unwrap();
        record.record_failure(
            SandboxStatus::Provisioning,
            ErrorCategory::Provisioning,
            "quota",
        );
        record.transition_to(SandboxStatus::Failed).unwrap();
        record.retry_count = 2;
        store.create(&record).await.unwrap();

        let err = orchestrator.retry(record.id).await.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted(_)));

        let unchanged = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, SandboxStatus::Failed);
        assert_eq!(unchanged.retry_count, 2);
    }

    #[tokio::test]
    async fn test_retry_after_provider_failure_succeeds() {
        let preview = healthy_preview_server().await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox)
                .with_url(preview.uri())
                .fail_next_create(ProviderError::Unavailable("maintenance".to_string())),
        );
        let (orchestrator, store) = orchestrator(vec![provider], None);

        let outcome = orchestrator.provision(provision_request()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, SandboxStatus::Failed);
        assert!(outcome.can_retry);

        let retried = orchestrator.retry(outcome.sandbox_id).await.unwrap();
        assert!(retried.success);

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Ready);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_provisioning_falls_back_to_second_provider() {
        let preview = healthy_preview_server().await;
        let degraded = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox)
                .fail_next_create(ProviderError::QuotaExceeded("plan limit".to_string())),
        );
        let healthy = Arc::new(
            ScriptedProvider::new(ProviderKind::ServerlessDeploy).with_url(preview.uri()),
        );
        let (orchestrator, store) = orchestrator(vec![degraded, healthy], None);

        let outcome = orchestrator.provision(provision_request()).await.unwrap();
        assert!(outcome.success);

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.provider, Some(ProviderKind::ServerlessDeploy));
    }

    #[tokio::test]
    async fn test_repair_rejected_without_backend_reports_can_retry() {
        let (orchestrator, store) = orchestrator(
            vec![Arc::new(ScriptedProvider::new(ProviderKind::RemoteSandbox))],
            None,
        );

        let mut record = SandboxRecord::new("tool-x", "gen-x", sample_code(), 2, 3);
        record.transition_to(SandboxStatus::Provisioning).unwrap();
        record.record_failure(
            SandboxStatus::Provisioning,
            ErrorCategory::Provisioning,
            "boom",
        );
        record.transition_to(SandboxStatus::Failed).unwrap();
        store.create(&record).await.unwrap();

        let outcome = orchestrator.repair(record.id).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.can_retry, "retry budget is untouched");
        assert_eq!(outcome.status, SandboxStatus::Failed);

        let unchanged = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(unchanged.repair_count, 0);
    }

    #[tokio::test]
    async fn test_terminate_during_validation_is_honored() {
        let preview = MockServer::start().await;
        // Slow health probe keeps the run inside validating long enough
        // for a terminate to land mid-stage.
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&preview)
            .await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orch, store) = orchestrator(vec![provider.clone()], None);

        let mut events = orch.progress().subscribe();
        let runner = orch.clone();
        let handle = tokio::spawn(async move { runner.provision(provision_request()).await });

        let sandbox_id = loop {
            let event = events.recv().await.unwrap();
            if event.status == SandboxStatus::Validating {
                break event.sandbox_id;
            }
        };
        orch.terminate(sandbox_id).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, SandboxStatus::Terminated);

        let record = store.get(sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Terminated);
        assert!(record.url.is_none(), "a cancelled run must not publish a URL");
        assert_eq!(provider.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_during_failing_validation_still_wins() {
        let preview = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(500)))
            .mount(&preview)
            .await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orch, store) = orchestrator(vec![provider.clone()], None);

        let mut events = orch.progress().subscribe();
        let runner = orch.clone();
        let handle = tokio::spawn(async move { runner.provision(provision_request()).await });

        let sandbox_id = loop {
            let event = events.recv().await.unwrap();
            if event.status == SandboxStatus::Validating {
                break event.sandbox_id;
            }
        };
        orch.terminate(sandbox_id).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, SandboxStatus::Terminated);

        let record = store.get(sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Terminated);
        // The failure cause was recorded before the terminate took over
        assert_eq!(record.last_category(), Some(ErrorCategory::RuntimeError));
        assert_eq!(provider.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let preview = healthy_preview_server().await;
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::RemoteSandbox).with_url(preview.uri()),
        );
        let (orchestrator, store) = orchestrator(vec![provider.clone()], None);

        let outcome = orchestrator.provision(provision_request()).await.unwrap();
        orchestrator.terminate(outcome.sandbox_id).await.unwrap();
        orchestrator.terminate(outcome.sandbox_id).await.unwrap();

        let record = store.get(outcome.sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Terminated);
        assert_eq!(provider.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_smoke_test_reports_steps_and_timing() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::RemoteSandbox));
        let (orch, _store) = orchestrator(vec![provider.clone()], None);

        let report = orch.smoke_test().await;
        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.step_reached, "terminate");
        assert_eq!(report.provider, Some(ProviderKind::RemoteSandbox));
        assert_eq!(provider.terminations.load(Ordering::SeqCst), 1);

        let (empty, _store) = orchestrator(vec![], None);
        let report = empty.smoke_test().await;
        assert!(!report.success);
        assert_eq!(report.step_reached, "factory");
    }
}
