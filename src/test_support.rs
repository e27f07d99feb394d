//! In-memory doubles for the sandbox provider and the LLM.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SandboxError;
use crate::llm::{ChatMessage, ChatResponse, LlmClient, Role, ToolDefinition};
use crate::sandbox::{
    CommandOutput, OutputStream, Sandbox, SandboxProvider, SandboxRef, preview_url,
};
use crate::store::now_timestamp;
use crate::workflow::prompts::{FRAGMENT_TITLE_PROMPT, RESPONSE_PROMPT};

pub const FAKE_PREVIEW_DOMAIN: &str = "sandbox.test";

#[derive(Default)]
struct FakeBox {
    files: BTreeMap<String, String>,
    idle_timeout: Option<Duration>,
    expired: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    sandboxes: HashMap<String, FakeBox>,
    create_error: Option<String>,
    scripts: HashMap<String, (String, String, i32)>,
    failing_writes: HashSet<String>,
    write_limit: Option<usize>,
    create_calls: usize,
    commands: Vec<String>,
    writes: usize,
}

/// Sandbox provider that keeps everything in memory.
#[derive(Clone, Default)]
pub struct FakeSandboxProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` fails with an API error carrying `message`.
    pub fn failing_create(message: &str) -> Self {
        let provider = Self::new();
        provider.state.lock().unwrap().create_error = Some(message.to_string());
        provider
    }

    pub fn script_command(&self, command: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.state.lock().unwrap().scripts.insert(
            command.to_string(),
            (stdout.to_string(), stderr.to_string(), exit_code),
        );
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(path.to_string());
    }

    /// Writes succeed until `limit` have landed, then every write fails.
    pub fn fail_writes_after(&self, limit: usize) {
        self.state.lock().unwrap().write_limit = Some(limit);
    }

    pub fn expire(&self, sandbox_id: &str) {
        if let Some(sandbox) = self.state.lock().unwrap().sandboxes.get_mut(sandbox_id) {
            sandbox.expired = true;
        }
    }

    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.files.get(path).cloned())
    }

    pub fn idle_timeout(&self, sandbox_id: &str) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.idle_timeout)
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn create(&self, _template: &str) -> Result<SandboxRef, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if let Some(message) = &state.create_error {
            return Err(SandboxError::Api {
                status: 500,
                body: message.clone(),
            });
        }
        state.next_id += 1;
        let sandbox_id = format!("sbx{}", state.next_id);
        state
            .sandboxes
            .insert(sandbox_id.clone(), FakeBox::default());
        Ok(SandboxRef {
            sandbox_id,
            created_at: now_timestamp(),
        })
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let state = self.state.lock().unwrap();
        match state.sandboxes.get(sandbox_id) {
            Some(sandbox) if !sandbox.expired => Ok(Box::new(FakeSandbox {
                id: sandbox_id.to_string(),
                state: self.state.clone(),
            })),
            _ => Err(SandboxError::NotFound {
                id: sandbox_id.to_string(),
            }),
        }
    }
}

struct FakeSandbox {
    id: String,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'s> FnMut(OutputStream, &'s str) + Send),
    ) -> Result<CommandOutput, SandboxError> {
        let (stdout, stderr, exit_code) = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command.to_string());
            state.scripts.get(command).cloned().unwrap_or_default()
        };
        if !stdout.is_empty() {
            on_output(OutputStream::Stdout, &stdout);
        }
        if !stderr.is_empty() {
            on_output(OutputStream::Stderr, &stderr);
        }
        if exit_code != 0 {
            return Err(SandboxError::CommandFailed {
                exit_code,
                message: None,
            });
        }
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        let over_limit = state.write_limit.is_some_and(|limit| state.writes >= limit);
        if over_limit || state.failing_writes.contains(path) {
            return Err(SandboxError::Api {
                status: 507,
                body: "disk full".to_string(),
            });
        }
        state.writes += 1;
        let sandbox = state
            .sandboxes
            .get_mut(&self.id)
            .ok_or_else(|| SandboxError::NotFound {
                id: self.id.clone(),
            })?;
        sandbox.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let state = self.state.lock().unwrap();
        state
            .sandboxes
            .get(&self.id)
            .and_then(|s| s.files.get(path).cloned())
            .ok_or_else(|| SandboxError::FileNotFound {
                path: path.to_string(),
            })
    }

    fn public_url(&self, port: u16) -> String {
        preview_url(&self.id, port, FAKE_PREVIEW_DOMAIN)
    }

    async fn set_idle_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.sandboxes.get_mut(&self.id) {
            sandbox.idle_timeout = Some(timeout);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    code: VecDeque<ChatResponse>,
    title: Option<ChatResponse>,
    response: Option<ChatResponse>,
    default: Option<ChatResponse>,
    fail_with: Option<String>,
    requests: Vec<Vec<ChatMessage>>,
}

/// LLM double that answers from a script.
///
/// Requests that carry tools are served from the code queue; tool-free
/// requests are matched to the title or response agent by system prompt.
/// Anything unmatched falls back to the default response.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<Script>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code_responses(self, responses: Vec<ChatResponse>) -> Self {
        self.script.lock().unwrap().code = responses.into();
        self
    }

    pub fn with_title(self, response: ChatResponse) -> Self {
        self.script.lock().unwrap().title = Some(response);
        self
    }

    pub fn with_response(self, response: ChatResponse) -> Self {
        self.script.lock().unwrap().response = Some(response);
        self
    }

    pub fn with_default(self, response: ChatResponse) -> Self {
        self.script.lock().unwrap().default = Some(response);
        self
    }

    pub fn failing(self, message: &str) -> Self {
        self.script.lock().unwrap().fail_with = Some(message.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.script.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        let mut script = self.script.lock().unwrap();
        script.requests.push(messages.to_vec());
        if let Some(message) = &script.fail_with {
            anyhow::bail!("{}", message);
        }

        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| m.text_content())
            .unwrap_or_default();

        let scripted = if tools.is_some() {
            script.code.pop_front()
        } else if system == FRAGMENT_TITLE_PROMPT {
            script.title.clone()
        } else if system == RESPONSE_PROMPT {
            script.response.clone()
        } else {
            None
        };

        scripted
            .or_else(|| script.default.clone())
            .ok_or_else(|| anyhow::anyhow!("ScriptedLlm has no response for this request"))
    }
}
