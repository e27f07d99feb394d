use serde::Serialize;

use super::{FileWrite, ToolOutcome};
use crate::sandbox::Sandbox;

/// Write each file independently. Failures are reported per path and do
/// not stop the remaining writes.
pub(super) async fn write(sandbox: &dyn Sandbox, files: &[FileWrite]) -> ToolOutcome {
    let mut written = Vec::new();
    let mut failed = Vec::new();

    for (index, file) in files.iter().enumerate() {
        match sandbox.write_file(&file.path, &file.content).await {
            Ok(()) => written.push(index),
            Err(e) => {
                tracing::warn!(path = %file.path, error = %e, "Failed to write file");
                failed.push(format!("- {}: {}", file.path, e));
            }
        }
    }

    let mut result = format!("Wrote {} file(s)", written.len());
    if !written.is_empty() {
        result.push_str(": ");
        let paths: Vec<&str> = written.iter().map(|&i| files[i].path.as_str()).collect();
        result.push_str(&paths.join(", "));
    }
    if !failed.is_empty() {
        result.push_str(&format!("\nFailed to write {} file(s):\n", failed.len()));
        result.push_str(&failed.join("\n"));
    }

    ToolOutcome { result, written }
}

#[derive(Serialize)]
struct FileContent<'a> {
    path: &'a str,
    content: String,
}

/// Read every path, or report the first failure as `Error: ...`.
pub(super) async fn read(sandbox: &dyn Sandbox, paths: &[String]) -> String {
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        match sandbox.read_file(path).await {
            Ok(content) => contents.push(FileContent { path, content }),
            Err(e) => return format!("Error: {}", e),
        }
    }
    serde_json::to_string(&contents).unwrap_or_else(|e| format!("Error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxProvider;
    use crate::tools::ToolInvocation;
    use crate::test_support::FakeSandboxProvider;

    fn file(path: &str, content: &str) -> FileWrite {
        FileWrite {
            path: path.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_write_reports_each_path() {
        let provider = FakeSandboxProvider::new();
        provider.fail_writes_to("locked.txt");
        let sandbox_ref = provider.create("t").await.unwrap();
        let sandbox = provider.connect(&sandbox_ref.sandbox_id).await.unwrap();

        let outcome = write(
            sandbox.as_ref(),
            &[file("app/page.tsx", "x"), file("locked.txt", "y")],
        )
        .await;

        assert_eq!(outcome.written, vec![0]);
        assert!(outcome.result.starts_with("Wrote 1 file(s): app/page.tsx"));
        assert!(outcome.result.contains("Failed to write 1 file(s):\n- locked.txt"));
        assert_eq!(
            provider.file(&sandbox_ref.sandbox_id, "app/page.tsx").as_deref(),
            Some("x")
        );
    }

    #[tokio::test]
    async fn test_write_tracks_repeated_path_by_position() {
        let provider = FakeSandboxProvider::new();
        provider.fail_writes_after(1);
        let sandbox_ref = provider.create("t").await.unwrap();
        let sandbox = provider.connect(&sandbox_ref.sandbox_id).await.unwrap();

        let invocation = ToolInvocation::WriteFiles {
            files: vec![file("app/page.tsx", "first"), file("app/page.tsx", "second")],
        };
        let outcome = invocation.execute(sandbox.as_ref()).await;

        assert_eq!(outcome.written, vec![0]);
        assert!(outcome.result.contains("Failed to write 1 file(s):\n- app/page.tsx"));
        let merged: Vec<_> = invocation.written_files(&outcome.written).collect();
        assert_eq!(merged, vec![("app/page.tsx", "first")]);
        assert_eq!(
            provider.file(&sandbox_ref.sandbox_id, "app/page.tsx").as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_read_returns_json_array() {
        let provider = FakeSandboxProvider::new();
        let sandbox_ref = provider.create("t").await.unwrap();
        let sandbox = provider.connect(&sandbox_ref.sandbox_id).await.unwrap();
        sandbox.write_file("a.txt", "hello").await.unwrap();

        let out = read(sandbox.as_ref(), &["a.txt".to_string()]).await;
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["path"], "a.txt");
        assert_eq!(parsed[0]["content"], "hello");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_string() {
        let provider = FakeSandboxProvider::new();
        let sandbox_ref = provider.create("t").await.unwrap();
        let sandbox = provider.connect(&sandbox_ref.sandbox_id).await.unwrap();

        let out = read(sandbox.as_ref(), &["missing.txt".to_string()]).await;
        assert_eq!(out, "Error: File not found in sandbox: missing.txt");
    }
}
