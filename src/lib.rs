//! # previewd
//!
//! A sandbox provisioning and repair pipeline for live previews of
//! AI-generated application code.
//!
//! ## Features
//!
//! - **Provider Adapters:** Pluggable remote-sandbox and serverless
//!   backends behind one async trait, with one-shot fallback
//! - **Pipeline Orchestrator:** A closed status machine driving
//!   provisioning, setup, code application, install, and validation
//! - **AI Repair:** Targeted patch requests against an OpenRouter-style
//!   chat-completions backend, bounded by a repair budget
//! - **Live Progress:** Broadcast progress events with an SSE surface
//! - **Durable Records:** PostgreSQL-backed sandbox records, with an
//!   in-memory store for tests and local runs

pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod repair;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
