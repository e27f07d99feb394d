//! Remote execution sandboxes.
//!
//! A run owns exactly one sandbox, created once and then addressed by id:
//! every durable step reconnects through [`SandboxProvider::connect`]
//! instead of holding a live handle across step boundaries, so a resumed
//! run can pick the sandbox back up as long as its idle timeout has not
//! expired.

pub mod http;

pub use http::HttpSandboxProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

/// Identifies a created sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxRef {
    pub sandbox_id: String,
    pub created_at: String,
}

/// Which stream a chunk of command output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Creates sandboxes and reconnects to them by id.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, template: &str) -> Result<SandboxRef, SandboxError>;

    /// Fails with [`SandboxError::NotFound`] once the sandbox has expired.
    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// A connected sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a shell command, streaming output chunks to `on_output` as they
    /// arrive. A non-zero exit code is returned as
    /// [`SandboxError::CommandFailed`]; chunks already delivered stay with
    /// the caller.
    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'s> FnMut(OutputStream, &'s str) + Send),
    ) -> Result<CommandOutput, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Public URL of `port` inside the sandbox.
    fn public_url(&self, port: u16) -> String;

    async fn set_idle_timeout(&self, timeout: Duration) -> Result<(), SandboxError>;
}

/// Public URL scheme shared by providers: `https://{port}-{id}.{domain}`.
pub fn preview_url(sandbox_id: &str, port: u16, preview_domain: &str) -> String {
    format!("https://{}-{}.{}", port, sandbox_id, preview_domain)
}
