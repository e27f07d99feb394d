//! Durable, keyed steps.
//!
//! Each step's output is serialized to JSON and stored under
//! `(run_id, step_key)` once the step succeeds. Executing the same key
//! again for the same run returns the stored output without running the
//! body, so a resumed or retried run replays everything that already
//! completed and only performs new work. Failed steps record nothing.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::WorkflowError;
use crate::store::DbHandle;

#[derive(Clone)]
pub struct StepRunner {
    db: DbHandle,
    run_id: String,
}

impl StepRunner {
    pub fn new(db: DbHandle, run_id: impl Into<String>) -> Self {
        Self {
            db,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `body` once per `(run, key)`; later calls return the recorded output.
    pub async fn run<T, F, Fut>(&self, key: &str, body: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let step_err = |source: anyhow::Error| WorkflowError::Step {
            step: key.to_string(),
            source,
        };

        if let Some(recorded) = self.lookup(key).await.map_err(step_err)? {
            let value = serde_json::from_str(&recorded)
                .map_err(|e| step_err(anyhow::anyhow!("Corrupt step record: {}", e)))?;
            tracing::debug!(run_id = %self.run_id, step = key, "Replayed step");
            return Ok(value);
        }

        tracing::debug!(run_id = %self.run_id, step = key, "Running step");
        let value = body().await.map_err(step_err)?;

        let encoded = serde_json::to_string(&value)
            .map_err(|e| step_err(anyhow::anyhow!("Failed to encode step output: {}", e)))?;
        let run_id = self.run_id.clone();
        let step_key = key.to_string();
        self.db
            .call(move |db| db.record_step(&run_id, &step_key, &encoded))
            .await
            .map_err(step_err)?;
        Ok(value)
    }

    /// Durable sleep: a replayed run does not wait again.
    pub async fn sleep(&self, key: &str, duration: Duration) -> Result<(), WorkflowError> {
        self.run(key, || async move {
            tokio::time::sleep(duration).await;
            anyhow::Ok(())
        })
        .await
    }

    /// Whether `key` has already completed for this run.
    #[cfg(test)]
    pub async fn is_complete(&self, key: &str) -> Result<bool, WorkflowError> {
        self.lookup(key)
            .await
            .map(|r| r.is_some())
            .map_err(|source| WorkflowError::Step {
                step: key.to_string(),
                source,
            })
    }

    async fn lookup(&self, key: &str) -> anyhow::Result<Option<String>> {
        let run_id = self.run_id.clone();
        let step_key = key.to_string();
        self.db
            .call(move |db| db.step_output(&run_id, &step_key))
            .await
    }
}
