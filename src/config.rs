//! Layered configuration for sandsmith.
//!
//! Settings are read from `.sandsmith/sandsmith.toml` (every field has a
//! default), then environment variables override the file, then CLI flags
//! override both. Secrets are only ever read from the environment.
//!
//! ```toml
//! [llm]
//! model = "gemini-2.5-flash"
//! base_url = "https://generativelanguage.googleapis.com/v1beta/openai"
//!
//! [sandbox]
//! api_url = "http://127.0.0.1:49983"
//! template = "sandsmith-nextjs"
//! preview_domain = "sandbox.local"
//! preview_port = 3000
//! idle_timeout_ms = 600000
//! warmup_delay_ms = 8000
//!
//! [workflow]
//! max_iterations = 15
//! history_window = 5
//! max_attempts = 1
//!
//! [server]
//! port = 3142
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".sandsmith";

/// Name of the configuration file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "sandsmith.toml";

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    /// Model identifier passed to the chat-completions endpoint
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Maximum retries for transient failures
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_llm_max_retries() -> u32 {
    3
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_llm_base_url(),
            max_retries: default_llm_max_retries(),
        }
    }
}

/// Sandbox provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Base URL of the sandbox REST API
    #[serde(default = "default_sandbox_api_url")]
    pub api_url: String,
    /// Template the sandbox is created from
    #[serde(default = "default_template")]
    pub template: String,
    /// Domain under which sandbox ports are exposed
    #[serde(default = "default_preview_domain")]
    pub preview_domain: String,
    /// Port the preview dev server listens on inside the sandbox
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,
    /// Idle timeout applied right after creation
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Command that starts the preview server; when unset the template is
    /// expected to start it on its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_server_command: Option<String>,
    /// Delay after starting the dev server before the agent runs
    #[serde(default = "default_warmup_delay_ms")]
    pub warmup_delay_ms: u64,
}

fn default_sandbox_api_url() -> String {
    "http://127.0.0.1:49983".to_string()
}

fn default_template() -> String {
    "sandsmith-nextjs".to_string()
}

fn default_preview_domain() -> String {
    "sandbox.local".to_string()
}

fn default_preview_port() -> u16 {
    3000
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_warmup_delay_ms() -> u64 {
    8_000
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            api_url: default_sandbox_api_url(),
            template: default_template(),
            preview_domain: default_preview_domain(),
            preview_port: default_preview_port(),
            idle_timeout_ms: default_idle_timeout_ms(),
            dev_server_command: None,
            warmup_delay_ms: default_warmup_delay_ms(),
        }
    }
}

/// Orchestration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Hard ceiling on agent turns per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Number of prior project messages replayed into the agent
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Attempts per run before the failure is recorded
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_iterations() -> u32 {
    15
}

fn default_history_window() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_window: default_history_window(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database path, relative to the project directory
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_port() -> u16 {
    3142
}

fn default_db_path() -> String {
    format!("{}/sandsmith.db", STATE_DIR)
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

/// Parsed `sandsmith.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandsmithToml {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl SandsmithToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sandsmith.toml")
    }

    /// Load from `<state_dir>/sandsmith.toml`, or defaults if the file is absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize sandsmith.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(model) = env("SANDSMITH_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = env("SANDSMITH_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(url) = env("SANDSMITH_SANDBOX_URL") {
            self.sandbox.api_url = url;
        }
        if let Some(template) = env("SANDSMITH_SANDBOX_TEMPLATE") {
            self.sandbox.template = template;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.workflow.max_iterations == 0 {
            warnings.push("workflow.max_iterations is 0: the agent will never run".to_string());
        }
        if self.workflow.max_attempts == 0 {
            warnings.push("workflow.max_attempts is 0: treated as 1".to_string());
        }
        if self.sandbox.idle_timeout_ms < 60_000 {
            warnings.push(format!(
                "sandbox.idle_timeout_ms = {} is shorter than a typical run",
                self.sandbox.idle_timeout_ms
            ));
        }
        if !self.llm.base_url.starts_with("http") {
            warnings.push(format!("llm.base_url '{}' is not an http(s) URL", self.llm.base_url));
        }
        warnings
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub toml: SandsmithToml,
    /// API key for the LLM provider
    pub llm_api_key: Option<String>,
    /// API key for the sandbox provider
    pub sandbox_api_key: Option<String>,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for `project_dir`, reading the process environment.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        // A missing .env is the normal case.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        Self::load_with_env(project_dir, verbose, &|key| std::env::var(key).ok())
    }

    /// Load configuration with an injectable environment lookup.
    pub fn load_with_env(
        project_dir: PathBuf,
        verbose: bool,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = SandsmithToml::load_or_default(&state_dir)?;
        toml.apply_env(env);

        let db_path = project_dir.join(&toml.server.db_path);
        let llm_api_key = env("SANDSMITH_LLM_API_KEY").or_else(|| env("GEMINI_API_KEY"));
        let sandbox_api_key = env("SANDBOX_API_KEY");

        Ok(Self {
            project_dir,
            state_dir,
            db_path,
            toml,
            llm_api_key,
            sandbox_api_key,
            verbose,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(())
    }

    /// Settings the workflow needs, detached from file paths.
    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings::from_toml(&self.toml)
    }
}

/// Values consumed by a workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub model: String,
    pub template: String,
    pub preview_port: u16,
    pub idle_timeout: Duration,
    pub dev_server_command: Option<String>,
    pub warmup_delay: Duration,
    pub max_iterations: u32,
    pub history_window: usize,
    pub max_attempts: u32,
}

impl WorkflowSettings {
    pub fn from_toml(toml: &SandsmithToml) -> Self {
        Self {
            model: toml.llm.model.clone(),
            template: toml.sandbox.template.clone(),
            preview_port: toml.sandbox.preview_port,
            idle_timeout: Duration::from_millis(toml.sandbox.idle_timeout_ms),
            dev_server_command: toml.sandbox.dev_server_command.clone(),
            warmup_delay: Duration::from_millis(toml.sandbox.warmup_delay_ms),
            max_iterations: toml.workflow.max_iterations,
            history_window: toml.workflow.history_window,
            max_attempts: toml.workflow.max_attempts.max(1),
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_toml(&SandsmithToml::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let toml = SandsmithToml::default();
        assert_eq!(toml.workflow.max_iterations, 15);
        assert_eq!(toml.workflow.history_window, 5);
        assert_eq!(toml.workflow.max_attempts, 1);
        assert_eq!(toml.sandbox.idle_timeout_ms, 600_000);
        assert_eq!(toml.sandbox.warmup_delay_ms, 8_000);
        assert_eq!(toml.sandbox.preview_port, 3000);
        assert_eq!(toml.llm.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let toml = SandsmithToml::parse(
            r#"
[workflow]
max_iterations = 4

[sandbox]
template = "vite-react"
"#,
        )
        .unwrap();
        assert_eq!(toml.workflow.max_iterations, 4);
        assert_eq!(toml.workflow.history_window, 5);
        assert_eq!(toml.sandbox.template, "vite-react");
        assert_eq!(toml.sandbox.preview_port, 3000);
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(SandsmithToml::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = SandsmithToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.server.port, 3142);
    }

    #[test]
    fn test_save_and_load_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = SandsmithToml::default();
        toml.sandbox.dev_server_command = Some("npm run dev".into());
        toml.save(&path).unwrap();

        let loaded = SandsmithToml::load(&path).unwrap();
        assert_eq!(loaded.sandbox.dev_server_command.as_deref(), Some("npm run dev"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join(CONFIG_FILE), "[llm]\nmodel = \"from-file\"\n").unwrap();

        let env = env_from(&[
            ("SANDSMITH_MODEL", "from-env"),
            ("GEMINI_API_KEY", "gem-key"),
            ("SANDBOX_API_KEY", "sbx-key"),
        ]);
        let config = Config::load_with_env(dir.path().to_path_buf(), false, &env).unwrap();
        assert_eq!(config.toml.llm.model, "from-env");
        assert_eq!(config.llm_api_key.as_deref(), Some("gem-key"));
        assert_eq!(config.sandbox_api_key.as_deref(), Some("sbx-key"));
    }

    #[test]
    fn test_explicit_api_key_wins_over_gemini_key() {
        let dir = tempdir().unwrap();
        let env = env_from(&[
            ("SANDSMITH_LLM_API_KEY", "primary"),
            ("GEMINI_API_KEY", "secondary"),
        ]);
        let config = Config::load_with_env(dir.path().to_path_buf(), false, &env).unwrap();
        assert_eq!(config.llm_api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn test_db_path_is_under_project_dir() {
        let dir = tempdir().unwrap();
        let config = Config::load_with_env(dir.path().to_path_buf(), false, &|_| None).unwrap();
        assert_eq!(
            config.db_path,
            dir.path().canonicalize().unwrap().join(".sandsmith/sandsmith.db")
        );
    }

    #[test]
    fn test_validate_flags_zero_iterations() {
        let mut toml = SandsmithToml::default();
        assert!(toml.validate().is_empty());
        toml.workflow.max_iterations = 0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_iterations"));
    }

    #[test]
    fn test_workflow_settings_clamp_attempts() {
        let mut toml = SandsmithToml::default();
        toml.workflow.max_attempts = 0;
        let settings = WorkflowSettings::from_toml(&toml);
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(settings.idle_timeout, Duration::from_secs(600));
    }
}
