//! `sandsmith run`: execute one workflow run inline and print its output.

use std::path::Path;

use anyhow::{Context, Result};
use sandsmith::config::Config;
use sandsmith::server::build_runner;
use sandsmith::store::{MessageRole, MessageType, project_slug};
use sandsmith::workflow::CodeAgentEvent;

pub async fn cmd_run(
    project_dir: &Path,
    verbose: bool,
    project: Option<&str>,
    prompt: &str,
) -> Result<()> {
    // Reject bad input before touching the store.
    CodeAgentEvent {
        value: prompt.to_string(),
        project_id: project.unwrap_or("new").to_string(),
    }
    .validate()
    .map_err(|e| anyhow::anyhow!(e))?;

    let config = Config::load(project_dir.to_path_buf(), verbose)?;
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }
    let (db, runner) = build_runner(&config)?;

    let value = prompt.to_string();
    let existing = project.map(str::to_string);
    let project_id = db
        .call(move |db| {
            let project = match existing {
                Some(id) => db
                    .get_project(&id)?
                    .with_context(|| format!("Project {} not found", id))?,
                None => db.create_project(&project_slug(&value))?,
            };
            db.create_message(&project.id, &value, MessageRole::User, MessageType::Result, None)?;
            Ok(project.id)
        })
        .await?;

    let run = runner
        .enqueue(&CodeAgentEvent {
            value: prompt.to_string(),
            project_id: project_id.clone(),
        })
        .await?;
    tracing::info!(run_id = %run.id, project_id = %project_id, "Running workflow");
    eprintln!("Run {} (project {})", run.id, project_id);

    let output = runner.run_to_completion(&run.id).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
