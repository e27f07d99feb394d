//! Agents and the state they accumulate.
//!
//! An [`Agent`] is configuration only: a name, a system prompt, a model,
//! the tools it may call, and an optional hook that sees every response.
//! Execution lives in [`network`], which drives the tool loop for the code
//! agent, and in [`Agent::generate_text`] for single-shot text agents.

pub mod network;
pub mod summary;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, LlmClient, ToolDefinition};

/// Mutable state carried across every turn of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentState {
    /// Full text of the response that declared the task complete
    pub summary: String,
    /// Every file written so far, keyed by path
    pub files: BTreeMap<String, String>,
}

impl AgentState {
    /// Merge written files. Re-applying the same writes is a no-op and a
    /// later write to a path replaces the earlier one.
    pub fn merge_files<'a>(&mut self, files: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (path, content) in files {
            self.files.insert(path.to_string(), content.to_string());
        }
    }

    pub fn has_summary(&self) -> bool {
        !self.summary.is_empty()
    }
}

/// Called with the text of each response the agent produces.
pub type ResponseHook = fn(&str, &mut AgentState);

/// An LLM persona.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub on_response: Option<ResponseHook>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            tools: Vec::new(),
            on_response: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.on_response = Some(hook);
        self
    }

    pub fn tool_definitions(&self) -> Option<&[ToolDefinition]> {
        if self.tools.is_empty() {
            None
        } else {
            Some(&self.tools)
        }
    }

    /// One tool-free completion over `input`. Returns the first non-blank
    /// text of the reply, if any.
    pub async fn generate_text(
        &self,
        llm: &dyn LlmClient,
        input: &str,
    ) -> anyhow::Result<Option<String>> {
        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(input),
        ];
        let response = llm.chat_completion(&self.model, &messages, None).await?;
        Ok(response.text_content().map(|s| s.trim().to_string()))
    }
}
