//! The iteration driver for the code agent.
//!
//! ```text
//!            ┌──────────── Continue(agent) ────────────┐
//!            v                                          │
//!   RUNNING ──inference──> AWAITING_TOOL_RESULT ──tools──> router ── Stop ──> DONE
//!            │ (no tool calls)                          ^
//!            └──────────────────────────────────────────┘
//! ```
//!
//! One turn is one inference step plus every tool call that inference
//! requested, executed in order. Step keys are derived from the agent
//! name, the turn number, and the call index, so a replayed run walks
//! the same keys and reads recorded results instead of calling the LLM
//! or the sandbox again. State changes are applied outside the steps so
//! replay rebuilds the same state.

use std::sync::Arc;

use super::{Agent, AgentState};
use crate::errors::WorkflowError;
use crate::llm::{ChatMessage, ChatResponse, LlmClient};
use crate::sandbox::SandboxProvider;
use crate::tools::{ToolInvocation, ToolOutcome};
use crate::workflow::steps::StepRunner;

/// Default ceiling on turns per run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// What the router wants after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Run another turn with the named agent
    Continue(String),
    Stop,
}

/// Picks the next agent from the accumulated state.
pub type Router = fn(&AgentState, &Agent) -> RouteDecision;

/// Stop once a summary exists, otherwise keep the same agent going.
pub fn summary_router(state: &AgentState, last: &Agent) -> RouteDecision {
    if state.has_summary() {
        RouteDecision::Stop
    } else {
        RouteDecision::Continue(last.name.clone())
    }
}

/// Where tools run.
#[derive(Clone)]
pub struct ToolContext {
    pub provider: Arc<dyn SandboxProvider>,
    pub sandbox_id: String,
}

/// How a network run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOutcome {
    pub iterations: u32,
    /// False when the ceiling ended the run
    pub stopped_by_router: bool,
}

pub struct Network {
    pub name: String,
    agents: Vec<Agent>,
    max_iterations: u32,
    router: Router,
}

impl Network {
    /// A network whose first agent is the entry point.
    pub fn new(name: impl Into<String>, agents: Vec<Agent>) -> Self {
        Self {
            name: name.into(),
            agents,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            router: summary_router,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Drive turns until the router stops or the ceiling is reached.
    pub async fn run(
        &self,
        steps: &StepRunner,
        llm: &Arc<dyn LlmClient>,
        tools: &ToolContext,
        history: &[ChatMessage],
        prompt: &str,
        state: &mut AgentState,
    ) -> Result<NetworkOutcome, WorkflowError> {
        let Some(mut current) = self.agents.first() else {
            return Ok(NetworkOutcome {
                iterations: 0,
                stopped_by_router: true,
            });
        };

        let mut conversation: Vec<ChatMessage> = history.to_vec();
        conversation.push(ChatMessage::user(prompt));

        let mut iteration = 0;
        while iteration < self.max_iterations {
            tracing::debug!(
                run_id = steps.run_id(),
                agent = %current.name,
                iteration,
                "Agent turn"
            );

            let response = self.infer(steps, llm, current, &conversation, iteration).await?;
            conversation.push(ChatMessage::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if let Some(hook) = current.on_response
                && let Some(text) = response.text_content()
            {
                hook(text, state);
            }

            for (index, call) in response.tool_calls.iter().enumerate() {
                let result = match ToolInvocation::parse(call) {
                    Ok(invocation) => {
                        let key = format!(
                            "tool:{}:{}:{}:{}",
                            current.name,
                            iteration,
                            index,
                            invocation.name()
                        );
                        let outcome = run_tool(steps, tools, &key, &invocation).await?;
                        state.merge_files(invocation.written_files(&outcome.written));
                        outcome.result
                    }
                    Err(e) => {
                        tracing::warn!(
                            run_id = steps.run_id(),
                            tool = %call.function.name,
                            "Rejected tool call: {}",
                            e
                        );
                        format!("Error: {}", e)
                    }
                };
                conversation.push(ChatMessage::tool_result(call.id.clone(), result));
            }

            iteration += 1;

            match (self.router)(state, current) {
                RouteDecision::Stop => {
                    tracing::info!(
                        run_id = steps.run_id(),
                        iterations = iteration,
                        "Network stopped by router"
                    );
                    return Ok(NetworkOutcome {
                        iterations: iteration,
                        stopped_by_router: true,
                    });
                }
                RouteDecision::Continue(next) => {
                    current = self.agent(&next).unwrap_or(current);
                }
            }
        }

        tracing::warn!(
            run_id = steps.run_id(),
            max_iterations = self.max_iterations,
            "Network reached its iteration ceiling"
        );
        Ok(NetworkOutcome {
            iterations: iteration,
            stopped_by_router: false,
        })
    }

    async fn infer(
        &self,
        steps: &StepRunner,
        llm: &Arc<dyn LlmClient>,
        agent: &Agent,
        conversation: &[ChatMessage],
        iteration: u32,
    ) -> Result<ChatResponse, WorkflowError> {
        let key = format!("inference:{}:{}", agent.name, iteration);
        steps
            .run(&key, || async {
                let mut messages = Vec::with_capacity(conversation.len() + 1);
                messages.push(ChatMessage::system(agent.system_prompt.clone()));
                messages.extend_from_slice(conversation);
                llm.chat_completion(&agent.model, &messages, agent.tool_definitions())
                    .await
            })
            .await
    }
}

async fn run_tool(
    steps: &StepRunner,
    tools: &ToolContext,
    key: &str,
    invocation: &ToolInvocation,
) -> Result<ToolOutcome, WorkflowError> {
    steps
        .run(key, || async {
            let sandbox = tools.provider.connect(&tools.sandbox_id).await?;
            anyhow::Ok(invocation.execute(sandbox.as_ref()).await)
        })
        .await
}
