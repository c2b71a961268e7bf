//! previewd server
//!
//! Loads configuration, wires the store, providers, repair backend, and
//! orchestrator together, and serves the HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use previewd::api::{self, AppState, StaticTokenAuthorizer};
use previewd::config::{validate_config, StorageBackend};
use previewd::pipeline::Orchestrator;
use previewd::progress::ProgressReporter;
use previewd::provider::ProviderFactory;
use previewd::repair::RepairClient;
use previewd::store::{
    init_pool, migrations, MemorySandboxStore, PostgresSandboxStore, SandboxStore,
};
use previewd::{Config, Error};

#[derive(Parser)]
#[command(name = "previewd", version, about = "Sandbox provisioning and repair pipeline")]
struct Args {
    /// Bind address, overrides config
    #[arg(long)]
    bind: Option<String>,

    /// Port, overrides config
    #[arg(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewd=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Starting {} v{}", previewd::NAME, previewd::VERSION);

    let mut config = Config::load()?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let validation = validate_config(&config);
    for warning in &validation.warnings {
        warn!("Config: {}", warning);
    }
    if !validation.errors.is_empty() {
        for error in &validation.errors {
            tracing::error!("Config: {}", error);
        }
        anyhow::bail!(
            "{} configuration error(s), refusing to start",
            validation.errors.len()
        );
    }

    let store: Arc<dyn SandboxStore> = match config.storage.backend {
        StorageBackend::Postgres => {
            let pg = config
                .storage
                .postgres
                .as_ref()
                .ok_or_else(|| Error::Config("postgres storage selected but not configured".to_string()))?;
            let pool = init_pool(pg).await?;
            migrations::run(&pool).await?;
            info!("Connected to PostgreSQL");
            Arc::new(PostgresSandboxStore::new(pool))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory store, sandbox records will not survive a restart");
            Arc::new(MemorySandboxStore::new())
        }
    };

    let factory = ProviderFactory::from_config(&config)?;
    info!(providers = ?factory.configured(), "Sandbox providers ready");

    let repair = match &config.repair {
        Some(repair_config) => {
            info!(model = %repair_config.model, "AI repair backend enabled");
            Some(RepairClient::new(repair_config.clone())?)
        }
        None => {
            info!("No repair backend configured, repair requests will be rejected");
            None
        }
    };

    let orchestrator = Orchestrator::new(
        store,
        factory,
        ProgressReporter::new(256),
        repair,
        config.pipeline.clone(),
    )?;

    let state = AppState::new(
        Arc::new(orchestrator),
        Arc::new(StaticTokenAuthorizer::new(config.server.auth_token.clone())),
    );
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
