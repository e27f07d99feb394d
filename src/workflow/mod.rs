//! The code-agent workflow.
//!
//! ```text
//! create-sandbox ─> [start-dev-server ─> warm-up] ─> get-previous-messages
//!      ─> network (inference:* / tool:* steps) ─> success gate
//!      ─> [generate-fragment-title ─> generate-response] ─> get-sandbox-url
//!      ─> save-result
//! ```
//!
//! Every arrow crosses a durable step boundary (see [`steps`]). A failure
//! anywhere before the terminal write is caught and, on the final attempt,
//! recorded as an ERROR message through the `save-error` step before the
//! error is returned. Terminal records commit together with their step row,
//! and the store accepts one terminal step per run, so `save-result` and
//! `save-error` never both land.
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `steps`   | `StepRunner`: keyed, replayable step execution          |
//! | `runner`  | `WorkflowRunner`: intake, run bookkeeping, resume       |
//! | `prompts` | system prompts for the code, title and response agents  |

pub mod prompts;
pub mod runner;
pub mod steps;

pub use runner::WorkflowRunner;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::network::{Network, ToolContext, summary_router};
use crate::agent::summary::{capture_task_summary, extract_task_summary};
use crate::agent::{Agent, AgentState};
use crate::config::WorkflowSettings;
use crate::errors::WorkflowError;
use crate::llm::{ChatMessage, LlmClient};
use crate::sandbox::{OutputStream, SandboxProvider};
use crate::store::{DbHandle, MessageRole, MessageType, NewFragment};
use crate::tools;
use steps::StepRunner;

/// Content of the ERROR record written when a run does not succeed.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

/// Title or response text used when a derived artifact comes back empty.
pub const FALLBACK_TEXT: &str = "Something went wrong";

const SAVE_RESULT_STEP: &str = "save-result";
const SAVE_ERROR_STEP: &str = "save-error";

/// Longest prompt accepted on intake.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Inbound request that triggers exactly one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeAgentEvent {
    pub value: String,
    pub project_id: String,
}

impl CodeAgentEvent {
    pub fn validate(&self) -> Result<(), String> {
        if self.value.trim().is_empty() {
            return Err("Message is required".to_string());
        }
        if self.value.chars().count() > MAX_PROMPT_CHARS {
            return Err("Message is too long".to_string());
        }
        if self.project_id.trim().is_empty() {
            return Err("Project id is required".to_string());
        }
        Ok(())
    }
}

/// What a successful run returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowOutput {
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

/// A prior project message replayed into the code agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub text: String,
}

impl HistoryEntry {
    fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            MessageRole::Assistant => ChatMessage::assistant(self.text.clone()),
            MessageRole::User => ChatMessage::user(self.text.clone()),
        }
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub db: DbHandle,
    pub llm: Arc<dyn LlmClient>,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub settings: WorkflowSettings,
}

pub fn code_agent(model: &str) -> Agent {
    Agent::new("code-agent", prompts::CODE_AGENT_PROMPT, model)
        .with_tools(tools::definitions())
        .with_response_hook(capture_task_summary)
}

pub fn fragment_title_agent(model: &str) -> Agent {
    Agent::new("fragment-title-generator", prompts::FRAGMENT_TITLE_PROMPT, model)
}

pub fn response_agent(model: &str) -> Agent {
    Agent::new("response-generator", prompts::RESPONSE_PROMPT, model)
}

pub struct CodeAgentWorkflow {
    deps: WorkflowDeps,
}

impl CodeAgentWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.deps.settings
    }

    pub fn db(&self) -> &DbHandle {
        &self.deps.db
    }

    /// Execute attempt number `attempt` (1-based) of run `run_id`.
    ///
    /// On failure the ERROR record is only written when this is the last
    /// allowed attempt, so retries never add a second terminal record.
    pub async fn execute(
        &self,
        run_id: &str,
        event: &CodeAgentEvent,
        attempt: u32,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let steps = StepRunner::new(self.deps.db.clone(), run_id);
        if let Some(recorded) = self.recorded_failure(run_id).await? {
            tracing::info!(run_id, attempt, "Run already recorded its failure");
            return Err(WorkflowError::Recorded(recorded));
        }

        match self.pipeline(&steps, event).await {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::error!(run_id, attempt, step = err.step(), "Run failed: {}", err);
                if attempt >= self.deps.settings.max_attempts {
                    self.save_error(&steps, event, &err).await?;
                }
                Err(err)
            }
        }
    }

    /// Content of the ERROR record a previous attempt wrote, if any.
    async fn recorded_failure(&self, run_id: &str) -> Result<Option<String>, WorkflowError> {
        let id = run_id.to_string();
        let record = self
            .deps
            .db
            .call(move |db| db.terminal_record(&id))
            .await
            .map_err(WorkflowError::Persist)?;
        Ok(record
            .filter(|(key, _)| key == SAVE_ERROR_STEP)
            .map(|(_, message)| message.content))
    }

    async fn pipeline(
        &self,
        steps: &StepRunner,
        event: &CodeAgentEvent,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let settings = &self.deps.settings;
        let provider = self.deps.sandboxes.as_ref();

        let sandbox_id: String = steps
            .run("create-sandbox", || async {
                let created = provider.create(&settings.template).await?;
                let sandbox = provider.connect(&created.sandbox_id).await?;
                sandbox.set_idle_timeout(settings.idle_timeout).await?;
                anyhow::Ok(created.sandbox_id)
            })
            .await?;
        tracing::info!(run_id = steps.run_id(), sandbox_id = %sandbox_id, "Sandbox ready");

        if let Some(command) = &settings.dev_server_command {
            steps
                .run("start-dev-server", || async {
                    let sandbox = provider.connect(&sandbox_id).await?;
                    sandbox
                        .run_command(command, &mut |stream, chunk| {
                            if stream == OutputStream::Stderr {
                                tracing::debug!(chunk, "dev server stderr");
                            }
                        })
                        .await?;
                    anyhow::Ok(())
                })
                .await?;
            steps.sleep("warm-up", settings.warmup_delay).await?;
        }

        let history: Vec<HistoryEntry> = steps
            .run("get-previous-messages", || async {
                let project_id = event.project_id.clone();
                let window = settings.history_window;
                let messages = self
                    .deps
                    .db
                    .call(move |db| db.recent_messages(&project_id, window))
                    .await?;
                anyhow::Ok(
                    messages
                        .into_iter()
                        .map(|m| HistoryEntry {
                            role: m.role,
                            text: m.content,
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .await?;
        let history: Vec<ChatMessage> = history.iter().map(HistoryEntry::to_chat_message).collect();

        let mut state = AgentState::default();
        let network = Network::new("coding-agent-network", vec![code_agent(&settings.model)])
            .with_max_iterations(settings.max_iterations)
            .with_router(summary_router);
        let tool_context = ToolContext {
            provider: self.deps.sandboxes.clone(),
            sandbox_id: sandbox_id.clone(),
        };
        let outcome = network
            .run(steps, &self.deps.llm, &tool_context, &history, &event.value, &mut state)
            .await?;

        let is_error = state.summary.is_empty() || state.files.is_empty();
        tracing::info!(
            run_id = steps.run_id(),
            iterations = outcome.iterations,
            files = state.files.len(),
            summary = extract_task_summary(&state.summary).unwrap_or(""),
            is_error,
            "Network finished"
        );

        let (title, response) = if is_error {
            (String::new(), String::new())
        } else {
            let title = self
                .derive_text(
                    steps,
                    "generate-fragment-title",
                    fragment_title_agent(&settings.model),
                    &state.summary,
                )
                .await?;
            let response = self
                .derive_text(
                    steps,
                    "generate-response",
                    response_agent(&settings.model),
                    &state.summary,
                )
                .await?;
            (title, response)
        };

        let url: String = steps
            .run("get-sandbox-url", || async {
                let sandbox = provider.connect(&sandbox_id).await?;
                anyhow::Ok(sandbox.public_url(settings.preview_port))
            })
            .await?;

        let (content, message_type, fragment) = if is_error {
            (GENERIC_ERROR_MESSAGE.to_string(), MessageType::Error, None)
        } else {
            let fragment = NewFragment {
                sandbox_url: url.clone(),
                title: title.clone(),
                files: state.files.clone(),
            };
            (response, MessageType::Result, Some(fragment))
        };
        self.save_terminal(
            steps,
            SAVE_RESULT_STEP,
            &event.project_id,
            content,
            message_type,
            fragment,
        )
        .await?;

        Ok(WorkflowOutput {
            url,
            title,
            files: state.files,
            summary: state.summary,
        })
    }

    /// Single-shot text derived from the summary, with the fixed fallback.
    async fn derive_text(
        &self,
        steps: &StepRunner,
        key: &str,
        agent: Agent,
        summary: &str,
    ) -> Result<String, WorkflowError> {
        steps
            .run(key, || async {
                let text = agent.generate_text(self.deps.llm.as_ref(), summary).await?;
                anyhow::Ok(text.unwrap_or_else(|| FALLBACK_TEXT.to_string()))
            })
            .await
    }

    /// Write the run's terminal record and its step row atomically.
    async fn save_terminal(
        &self,
        steps: &StepRunner,
        key: &'static str,
        project_id: &str,
        content: String,
        message_type: MessageType,
        fragment: Option<NewFragment>,
    ) -> Result<i64, WorkflowError> {
        let run_id = steps.run_id().to_string();
        let project_id = project_id.to_string();
        let message = self
            .deps
            .db
            .call(move |db| {
                db.create_terminal_message(
                    &run_id,
                    key,
                    &project_id,
                    &content,
                    message_type,
                    fragment.as_ref(),
                )
            })
            .await
            .map_err(|source| WorkflowError::Step {
                step: key.to_string(),
                source,
            })?;
        tracing::info!(
            run_id = steps.run_id(),
            step = key,
            message_id = message.id,
            message_type = message_type.as_str(),
            "Terminal record written"
        );
        Ok(message.id)
    }

    async fn save_error(
        &self,
        steps: &StepRunner,
        event: &CodeAgentEvent,
        err: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        let content = match err.to_string() {
            s if s.trim().is_empty() => GENERIC_ERROR_MESSAGE.to_string(),
            s => s,
        };
        let saved = self
            .save_terminal(
                steps,
                SAVE_ERROR_STEP,
                &event.project_id,
                content,
                MessageType::Error,
                None,
            )
            .await;

        match saved {
            Ok(_) => Ok(()),
            Err(persist_err) => {
                tracing::error!(
                    run_id = steps.run_id(),
                    "Failed to record run failure: {}",
                    persist_err
                );
                Err(WorkflowError::Persist(anyhow::anyhow!(
                    "{} (while recording: {})",
                    persist_err,
                    err
                )))
            }
        }
    }
}
