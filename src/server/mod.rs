//! HTTP intake for code-agent events and run inspection.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::llm::{OpenAiCompatClient, RetryConfig};
use crate::sandbox::http::HttpSandboxProvider;
use crate::store::{DbHandle, StoreDb};
use crate::workflow::runner::WorkflowRunner;
use crate::workflow::{CodeAgentWorkflow, WorkflowDeps};

use api::AppState;

/// Configuration for the intake server.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3142,
            dev_mode: false,
        }
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the store, the LLM client and the sandbox provider into a runner.
pub fn build_runner(config: &Config) -> Result<(DbHandle, WorkflowRunner)> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(StoreDb::new(&config.db_path).context("Failed to open database")?);

    let toml = &config.toml;
    let llm = OpenAiCompatClient::with_retry_config(
        toml.llm.base_url.as_str(),
        config.llm_api_key.clone(),
        RetryConfig {
            max_retries: toml.llm.max_retries,
            ..RetryConfig::default()
        },
    );
    let sandboxes = HttpSandboxProvider::new(
        toml.sandbox.api_url.as_str(),
        config.sandbox_api_key.clone(),
        toml.sandbox.preview_domain.as_str(),
    );

    let workflow = CodeAgentWorkflow::new(WorkflowDeps {
        db: db.clone(),
        llm: Arc::new(llm),
        sandboxes: Arc::new(sandboxes),
        settings: config.workflow_settings(),
    });
    Ok((db, WorkflowRunner::new(Arc::new(workflow))))
}

/// Start the server and resume runs a previous process left unfinished.
pub async fn start_server(config: &Config, server: ServerConfig) -> Result<()> {
    let (db, runner) = build_runner(config)?;

    let resumed = runner.resume_unfinished().await?;
    if resumed > 0 {
        tracing::info!(resumed, "Resumed unfinished runs");
    }

    let mut app = build_router(Arc::new(AppState { db, runner }));
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(%addr, "Sandsmith listening");
    println!("Sandsmith running at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
