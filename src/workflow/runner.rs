//! Intake and lifecycle of workflow runs.
//!
//! Each accepted event gets a `workflow_runs` row and a tokio task. The
//! task performs up to `max_attempts` attempts under the same run id;
//! steps completed by an earlier attempt replay from the step log. On
//! startup, runs left `queued` or `running` by a previous process are
//! resumed the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use super::{CodeAgentEvent, CodeAgentWorkflow, WorkflowOutput};
use crate::store::{RunStatus, WorkflowRun};

/// Pause between attempts of the same run.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct WorkflowRunner {
    workflow: Arc<CodeAgentWorkflow>,
    /// In-flight runs by id
    running: Arc<tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl WorkflowRunner {
    pub fn new(workflow: Arc<CodeAgentWorkflow>) -> Self {
        Self {
            workflow,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Record a run for `event` without starting it.
    pub async fn enqueue(&self, event: &CodeAgentEvent) -> Result<WorkflowRun> {
        event.validate().map_err(|e| anyhow::anyhow!(e))?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let event = event.clone();
        self.workflow
            .db()
            .call(move |db| {
                db.get_project(&event.project_id)?
                    .with_context(|| format!("Project {} not found", event.project_id))?;
                db.create_run(&run_id, &event.project_id, &event.value)
            })
            .await
    }

    /// Accept an event and start its run in the background.
    pub async fn submit(&self, event: CodeAgentEvent) -> Result<WorkflowRun> {
        let run = self.enqueue(&event).await?;
        tracing::info!(run_id = %run.id, project_id = %run.project_id, "Run queued");
        self.spawn(run.id.clone()).await;
        Ok(run)
    }

    /// Restart every run a previous process left unfinished.
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let runs = self.workflow.db().call(|db| db.unfinished_runs()).await?;
        let count = runs.len();
        for run in runs {
            tracing::info!(
                run_id = %run.id,
                status = run.status.as_str(),
                attempts = run.attempts,
                "Resuming run"
            );
            self.spawn(run.id).await;
        }
        Ok(count)
    }

    /// Wait for an in-flight run to finish.
    pub async fn wait(&self, run_id: &str) {
        let handle = self.running.lock().await.remove(run_id);
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(run_id, "Run task panicked: {}", e);
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let run_id = run_id.to_string();
        self.workflow.db().call(move |db| db.get_run(&run_id)).await
    }

    async fn spawn(&self, run_id: String) {
        let mut running = self.running.lock().await;
        if running.get(&run_id).is_some_and(|h| !h.is_finished()) {
            tracing::debug!(run_id = %run_id, "Run already in flight");
            return;
        }
        let runner = self.clone();
        let id = run_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.run_to_completion(&id).await {
                tracing::warn!(run_id = %id, "Run finished with error: {:#}", e);
            }
        });
        running.insert(run_id, handle);
    }

    /// Drive a recorded run through its remaining attempts.
    pub async fn run_to_completion(&self, run_id: &str) -> Result<WorkflowOutput> {
        let id = run_id.to_string();
        let run = self
            .workflow
            .db()
            .call(move |db| db.get_run(&id))
            .await?
            .with_context(|| format!("Run {} not found", run_id))?;
        if run.status.is_terminal() {
            anyhow::bail!("Run {} already {}", run_id, run.status.as_str());
        }

        let event = CodeAgentEvent {
            value: run.prompt,
            project_id: run.project_id,
        };
        let max_attempts = self.workflow.settings().max_attempts;

        loop {
            let id = run_id.to_string();
            let run = self
                .workflow
                .db()
                .call(move |db| db.start_run_attempt(&id))
                .await?;
            tracing::info!(run_id, attempt = run.attempts, max_attempts, "Run attempt started");

            match self.workflow.execute(run_id, &event, run.attempts).await {
                Ok(output) => {
                    self.finish(run_id, RunStatus::Completed, None).await?;
                    tracing::info!(run_id, files = output.files.len(), "Run completed");
                    return Ok(output);
                }
                Err(err) if run.attempts < max_attempts && !err.is_recorded() => {
                    tracing::warn!(
                        run_id,
                        attempt = run.attempts,
                        "Attempt failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(RETRY_BACKOFF * run.attempts).await;
                }
                Err(err) => {
                    let message = err.to_string();
                    self.finish(run_id, RunStatus::Failed, Some(message)).await?;
                    return Err(err.into());
                }
            }
        }
    }

    async fn finish(&self, run_id: &str, status: RunStatus, error: Option<String>) -> Result<()> {
        let id = run_id.to_string();
        self.workflow
            .db()
            .call(move |db| db.update_run_status(&id, status, error.as_deref()))
            .await?;
        Ok(())
    }
}
