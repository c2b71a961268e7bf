//! PostgreSQL-backed sandbox record store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::pipeline::SandboxStatus;
use crate::provider::ProviderKind;
use crate::{Error, Result};

use super::{ErrorEntry, SandboxRecord, SandboxStore};

/// Initialize the PostgreSQL connection pool
pub async fn init_pool(config: &PostgresConfig) -> Result<PgPool> {
    info!("Initializing PostgreSQL connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(config.url.expose_secret())
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("PostgreSQL connection pool initialized");
    Ok(pool)
}

/// Database migrations
pub mod migrations {
    use super::*;

    /// Run all migrations
    pub async fn run(pool: &PgPool) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sandboxes (
                id UUID PRIMARY KEY,
                tool_id TEXT NOT NULL,
                generation_id TEXT NOT NULL,
                provider TEXT,
                external_id TEXT,
                url TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 2,
                repair_count INTEGER NOT NULL DEFAULT 0,
                max_repairs INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                error_history JSONB NOT NULL DEFAULT '[]',
                build_passed BOOLEAN,
                tests_passed BOOLEAN,
                health_check_passed BOOLEAN,
                code JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sandboxes_tool_id ON sandboxes(tool_id)")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sandboxes_status ON sandboxes(status)")
            .execute(pool)
            .await?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Raw database row; typed fields are reconstructed in `SandboxRecord`
#[derive(Debug, FromRow)]
struct SandboxRow {
    id: Uuid,
    tool_id: String,
    generation_id: String,
    provider: Option<String>,
    external_id: Option<String>,
    url: Option<String>,
    status: String,
    retry_count: i32,
    max_retries: i32,
    repair_count: i32,
    max_repairs: i32,
    last_error: Option<String>,
    error_history: serde_json::Value,
    build_passed: Option<bool>,
    tests_passed: Option<bool>,
    health_check_passed: Option<bool>,
    code: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SandboxRow> for SandboxRecord {
    type Error = Error;

    fn try_from(row: SandboxRow) -> Result<Self> {
        let provider = row
            .provider
            .as_deref()
            .map(str::parse::<ProviderKind>)
            .transpose()?;
        let error_history: Vec<ErrorEntry> = serde_json::from_value(row.error_history)?;
        let code = row.code.map(serde_json::from_value).transpose()?;

        Ok(SandboxRecord {
            id: row.id,
            tool_id: row.tool_id,
            generation_id: row.generation_id,
            provider,
            external_id: row.external_id,
            url: row.url,
            status: SandboxStatus::parse(&row.status)?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            repair_count: row.repair_count,
            max_repairs: row.max_repairs,
            last_error: row.last_error,
            error_history,
            build_passed: row.build_passed,
            tests_passed: row.tests_passed,
            health_check_passed: row.health_check_passed,
            code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Sandbox store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresSandboxStore {
    pool: PgPool,
}

impl PostgresSandboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SandboxStore for PostgresSandboxStore {
    async fn create(&self, record: &SandboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, tool_id, generation_id, provider, external_id, url, status,
                retry_count, max_retries, repair_count, max_repairs,
                last_error, error_history,
                build_passed, tests_passed, health_check_passed,
                code, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.id)
        .bind(&record.tool_id)
        .bind(&record.generation_id)
        .bind(record.provider.map(|p| p.as_str()))
        .bind(&record.external_id)
        .bind(&record.url)
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(record.repair_count)
        .bind(record.max_repairs)
        .bind(&record.last_error)
        .bind(serde_json::to_value(&record.error_history)?)
        .bind(record.build_passed)
        .bind(record.tests_passed)
        .bind(record.health_check_passed)
        .bind(record.code.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        let row: Option<SandboxRow> = sqlx::query_as("SELECT * FROM sandboxes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SandboxRecord::try_from).transpose()
    }

    async fn active_for_tool(&self, tool_id: &str) -> Result<Option<SandboxRecord>> {
        let row: Option<SandboxRow> = sqlx::query_as(
            r#"
            SELECT * FROM sandboxes
            WHERE tool_id = $1 AND status != 'terminated'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SandboxRecord::try_from).transpose()
    }

    async fn update(&self, record: &SandboxRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes SET
                provider = $2,
                external_id = $3,
                url = $4,
                status = $5,
                retry_count = $6,
                repair_count = $7,
                last_error = $8,
                error_history = $9,
                build_passed = $10,
                tests_passed = $11,
                health_check_passed = $12,
                code = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.provider.map(|p| p.as_str()))
        .bind(&record.external_id)
        .bind(&record.url)
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(record.repair_count)
        .bind(&record.last_error)
        .bind(serde_json::to_value(&record.error_history)?)
        .bind(record.build_passed)
        .bind(record.tests_passed)
        .bind(record.health_check_passed)
        .bind(record.code.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("sandbox {}", record.id)));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
