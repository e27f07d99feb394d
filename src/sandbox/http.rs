//! Sandbox provider backed by a remote REST API.
//!
//! | Method | Path                          | Purpose                        |
//! |--------|-------------------------------|--------------------------------|
//! | POST   | `/sandboxes`                  | create from a template         |
//! | GET    | `/sandboxes/{id}`             | liveness (404 once expired)    |
//! | POST   | `/sandboxes/{id}/timeout`     | set idle timeout               |
//! | POST   | `/sandboxes/{id}/commands`    | run a command, NDJSON output   |
//! | PUT    | `/sandboxes/{id}/files?path=` | write a file (raw body)        |
//! | GET    | `/sandboxes/{id}/files?path=` | read a file (raw body)         |
//!
//! Command output arrives as one JSON object per line:
//! `{"type":"stdout","data":".."}`, `{"type":"stderr","data":".."}`, and a
//! final `{"type":"exit","exit_code":0,"error":null}`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{CommandOutput, OutputStream, Sandbox, SandboxProvider, SandboxRef, preview_url};
use crate::errors::SandboxError;
use crate::store::now_timestamp;

#[derive(Clone)]
struct ApiClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, SandboxError> {
        builder
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))
    }
}

/// Map a non-success response onto a `SandboxError`.
async fn error_for(response: Response, not_found: SandboxError) -> SandboxError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return not_found;
    }
    let body = response.text().await.unwrap_or_default();
    SandboxError::Api {
        status: status.as_u16(),
        body,
    }
}

/// Provider for the REST sandbox API.
pub struct HttpSandboxProvider {
    api: ApiClient,
    preview_domain: String,
}

impl HttpSandboxProvider {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        preview_domain: impl Into<String>,
    ) -> Self {
        Self {
            api: ApiClient {
                client: Client::new(),
                api_url: api_url.into().trim_end_matches('/').to_string(),
                api_key,
            },
            preview_domain: preview_domain.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self, template: &str) -> Result<SandboxRef, SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::POST, "/sandboxes")
                    .json(&json!({ "template": template })),
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Api { status, body });
        }
        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Protocol(format!("create response: {}", e)))?;

        tracing::info!(sandbox_id = %created.sandbox_id, template, "Sandbox created");
        Ok(SandboxRef {
            sandbox_id: created.sandbox_id,
            created_at: now_timestamp(),
        })
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::GET, &format!("/sandboxes/{}", sandbox_id)),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_for(
                response,
                SandboxError::NotFound {
                    id: sandbox_id.to_string(),
                },
            )
            .await);
        }
        Ok(Box::new(HttpSandbox {
            api: self.api.clone(),
            id: sandbox_id.to_string(),
            preview_domain: self.preview_domain.clone(),
        }))
    }
}

/// A sandbox reached through the REST API.
pub struct HttpSandbox {
    api: ApiClient,
    id: String,
    preview_domain: String,
}

impl HttpSandbox {
    fn path(&self, suffix: &str) -> String {
        format!("/sandboxes/{}{}", self.id, suffix)
    }

    fn not_found(&self) -> SandboxError {
        SandboxError::NotFound {
            id: self.id.clone(),
        }
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'s> FnMut(OutputStream, &'s str) + Send),
    ) -> Result<CommandOutput, SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::POST, &self.path("/commands"))
                    .json(&json!({ "cmd": command })),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, self.not_found()).await);
        }

        let mut output = CommandOutput::default();
        let mut lines = LineBuffer::default();
        let mut exit: Option<(i32, Option<String>)> = None;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Transport(e.to_string()))?;
            for line in lines.push(&chunk) {
                if let Some(status) = apply_event(&line, &mut output, on_output)? {
                    exit = Some(status);
                }
            }
        }
        if let Some(line) = lines.finish()
            && let Some(status) = apply_event(&line, &mut output, on_output)?
        {
            exit = Some(status);
        }

        match exit {
            Some((0, _)) => Ok(output),
            Some((exit_code, message)) => Err(SandboxError::CommandFailed { exit_code, message }),
            None => Err(SandboxError::Protocol(
                "command stream ended without an exit event".to_string(),
            )),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::PUT, &self.path("/files"))
                    .query(&[("path", path)])
                    .body(content.to_string()),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, self.not_found()).await);
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::GET, &self.path("/files"))
                    .query(&[("path", path)]),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_for(
                response,
                SandboxError::FileNotFound {
                    path: path.to_string(),
                },
            )
            .await);
        }
        response
            .text()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))
    }

    fn public_url(&self, port: u16) -> String {
        preview_url(&self.id, port, &self.preview_domain)
    }

    async fn set_idle_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let response = self
            .api
            .send(
                self.api
                    .request(reqwest::Method::POST, &self.path("/timeout"))
                    .json(&json!({ "timeout_ms": timeout.as_millis() as u64 })),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, self.not_found()).await);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CommandEvent {
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Exit {
        exit_code: i32,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Apply one NDJSON line. Returns the exit status when the line is the exit event.
fn apply_event(
    line: &str,
    output: &mut CommandOutput,
    on_output: &mut (dyn for<'s> FnMut(OutputStream, &'s str) + Send),
) -> Result<Option<(i32, Option<String>)>, SandboxError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: CommandEvent = serde_json::from_str(line)
        .map_err(|e| SandboxError::Protocol(format!("bad command event '{}': {}", line, e)))?;
    match event {
        CommandEvent::Stdout { data } => {
            on_output(OutputStream::Stdout, &data);
            output.stdout.push_str(&data);
            Ok(None)
        }
        CommandEvent::Stderr { data } => {
            on_output(OutputStream::Stderr, &data);
            output.stderr.push_str(&data);
            Ok(None)
        }
        CommandEvent::Exit { exit_code, error } => {
            output.exit_code = exit_code;
            Ok(Some((exit_code, error)))
        }
    }
}

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}
