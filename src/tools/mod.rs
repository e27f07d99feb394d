//! Tools the code agent can call against its sandbox.
//!
//! The set is closed: a [`ToolInvocation`] is parsed from the model's raw
//! [`ToolCall`] before anything runs, and bad input becomes a textual
//! result for the model instead of an error for the run.
//!
//! | Tool                | Arguments                     | Result                      |
//! |---------------------|-------------------------------|-----------------------------|
//! | `run-shell-command` | `{command}`                   | stdout, or failure report   |
//! | `write-files`       | `{files: [{path, content}]}`  | written / failed paths      |
//! | `read-files`        | `{paths: [..]}`               | JSON `[{path, content}]`    |

mod files;
mod shell;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::ToolArgsError;
use crate::llm::{FunctionDefinition, ToolCall, ToolDefinition};
use crate::sandbox::Sandbox;

pub const RUN_SHELL_COMMAND: &str = "run-shell-command";
pub const WRITE_FILES: &str = "write-files";
pub const READ_FILES: &str = "read-files";

/// One file to create or overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    RunShellCommand { command: String },
    WriteFiles { files: Vec<FileWrite> },
    ReadFiles { paths: Vec<String> },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellArgs {
    command: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteArgs {
    files: Vec<FileWrite>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadArgs {
    paths: Vec<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, raw: &str) -> Result<T, ToolArgsError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|source| ToolArgsError::Malformed {
        tool: tool.to_string(),
        source,
    })
}

fn invalid(tool: &str, reason: &str) -> ToolArgsError {
    ToolArgsError::Invalid {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
}

impl ToolInvocation {
    /// Validate a raw tool call from the model.
    pub fn parse(call: &ToolCall) -> Result<Self, ToolArgsError> {
        let name = call.function.name.as_str();
        let raw = call.function.arguments.as_str();
        match name {
            RUN_SHELL_COMMAND => {
                let args: ShellArgs = parse_args(name, raw)?;
                if args.command.trim().is_empty() {
                    return Err(invalid(name, "command must not be empty"));
                }
                Ok(Self::RunShellCommand {
                    command: args.command,
                })
            }
            WRITE_FILES => {
                let args: WriteArgs = parse_args(name, raw)?;
                if args.files.is_empty() {
                    return Err(invalid(name, "files must not be empty"));
                }
                if args.files.iter().any(|f| f.path.trim().is_empty()) {
                    return Err(invalid(name, "every file needs a non-empty path"));
                }
                Ok(Self::WriteFiles { files: args.files })
            }
            READ_FILES => {
                let args: ReadArgs = parse_args(name, raw)?;
                if args.paths.is_empty() {
                    return Err(invalid(name, "paths must not be empty"));
                }
                if args.paths.iter().any(|p| p.trim().is_empty()) {
                    return Err(invalid(name, "paths must not contain empty entries"));
                }
                Ok(Self::ReadFiles { paths: args.paths })
            }
            other => Err(ToolArgsError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RunShellCommand { .. } => RUN_SHELL_COMMAND,
            Self::WriteFiles { .. } => WRITE_FILES,
            Self::ReadFiles { .. } => READ_FILES,
        }
    }

    /// Run the tool. Tool-level failures are folded into the outcome text;
    /// the caller decides how to surface sandbox connectivity problems.
    pub async fn execute(&self, sandbox: &dyn Sandbox) -> ToolOutcome {
        match self {
            Self::RunShellCommand { command } => {
                ToolOutcome::text(shell::run(sandbox, command).await)
            }
            Self::WriteFiles { files } => files::write(sandbox, files).await,
            Self::ReadFiles { paths } => ToolOutcome::text(files::read(sandbox, paths).await),
        }
    }

    /// File contents to merge into agent state, given the positions of
    /// the entries a write actually persisted.
    pub fn written_files<'a>(
        &'a self,
        written: &'a [usize],
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let files: &'a [FileWrite] = match self {
            Self::WriteFiles { files } => files,
            _ => &[],
        };
        written
            .iter()
            .filter_map(move |&i| files.get(i))
            .map(|f| (f.path.as_str(), f.content.as_str()))
    }
}

/// Recorded result of one tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Text returned to the model
    pub result: String,
    /// Positions of the write-files entries that were persisted
    #[serde(default)]
    pub written: Vec<usize>,
}

impl ToolOutcome {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            written: Vec::new(),
        }
    }
}

/// Definitions advertised to the code agent.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        definition(
            RUN_SHELL_COMMAND,
            "Run a shell command in the sandbox (for example to install packages). Returns stdout, or a failure report with stdout and stderr.",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command to run, e.g. `npm install lucide-react --yes`"
                    }
                },
                "required": ["command"]
            }),
        ),
        definition(
            WRITE_FILES,
            "Create or overwrite files in the sandbox. Paths are relative to the app root.",
            json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "content": { "type": "string" }
                            },
                            "required": ["path", "content"]
                        }
                    }
                },
                "required": ["files"]
            }),
        ),
        definition(
            READ_FILES,
            "Read files from the sandbox. Returns a JSON array of {path, content}.",
            json!({
                "type": "object",
                "properties": {
                    "paths": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                },
                "required": ["paths"]
            }),
        ),
    ]
}

fn definition(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::new("call_0", name, args)
    }

    #[test]
    fn test_parse_shell_command() {
        let inv =
            ToolInvocation::parse(&call(RUN_SHELL_COMMAND, r#"{"command":"ls -la"}"#)).unwrap();
        assert_eq!(
            inv,
            ToolInvocation::RunShellCommand {
                command: "ls -la".into()
            }
        );
        assert_eq!(inv.name(), RUN_SHELL_COMMAND);
    }

    #[test]
    fn test_parse_rejects_empty_command() {
        let err =
            ToolInvocation::parse(&call(RUN_SHELL_COMMAND, r#"{"command":"  "}"#)).unwrap_err();
        assert!(matches!(err, ToolArgsError::Invalid { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = ToolInvocation::parse(&call(WRITE_FILES, "{not json")).unwrap_err();
        assert!(matches!(err, ToolArgsError::Malformed { .. }));
        assert!(err.to_string().starts_with("Invalid arguments for write-files"));
    }

    #[test]
    fn test_parse_missing_arguments_is_malformed() {
        let err = ToolInvocation::parse(&call(READ_FILES, "")).unwrap_err();
        assert!(matches!(err, ToolArgsError::Malformed { .. }));
    }

    #[test]
    fn test_parse_rejects_empty_paths() {
        assert!(ToolInvocation::parse(&call(READ_FILES, r#"{"paths":[]}"#)).is_err());
        assert!(ToolInvocation::parse(&call(READ_FILES, r#"{"paths":["a", ""]}"#)).is_err());
        assert!(
            ToolInvocation::parse(&call(WRITE_FILES, r#"{"files":[{"path":"","content":"x"}]}"#))
                .is_err()
        );
    }

    #[test]
    fn test_parse_unknown_tool() {
        let err = ToolInvocation::parse(&call("deleteEverything", "{}")).unwrap_err();
        assert_eq!(err.to_string(), "Unknown tool 'deleteEverything'");
    }

    #[test]
    fn test_written_files_follows_persisted_positions() {
        let inv = ToolInvocation::WriteFiles {
            files: vec![
                FileWrite {
                    path: "a.txt".into(),
                    content: "A".into(),
                },
                FileWrite {
                    path: "b.txt".into(),
                    content: "B".into(),
                },
            ],
        };
        let written = vec![1];
        let merged: Vec<_> = inv.written_files(&written).collect();
        assert_eq!(merged, vec![("b.txt", "B")]);
    }

    #[test]
    fn test_definitions_cover_every_tool() {
        let defs = definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec![RUN_SHELL_COMMAND, WRITE_FILES, READ_FILES]);
        for def in &defs {
            assert_eq!(def.tool_type, "function");
            assert_eq!(def.function.parameters["type"], "object");
        }
    }
}
