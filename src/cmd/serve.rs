//! `sandsmith serve`: HTTP intake server.

use std::path::Path;

use anyhow::Result;
use sandsmith::config::Config;
use sandsmith::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    verbose: bool,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    let config = Config::load(project_dir.to_path_buf(), verbose)?;
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }
    if config.llm_api_key.is_none() {
        tracing::warn!("No LLM API key set (SANDSMITH_LLM_API_KEY or GEMINI_API_KEY)");
    }

    let server = ServerConfig {
        port: port.unwrap_or(config.toml.server.port),
        dev_mode: dev,
    };
    start_server(&config, server).await
}
