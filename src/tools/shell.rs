use crate::sandbox::{OutputStream, Sandbox};

/// Run `command` and return its stdout, or a failure report carrying
/// whatever output was streamed before the failure.
pub(super) async fn run(sandbox: &dyn Sandbox, command: &str) -> String {
    let mut stdout = String::new();
    let mut stderr = String::new();

    let result = sandbox
        .run_command(command, &mut |stream, chunk| match stream {
            OutputStream::Stdout => stdout.push_str(chunk),
            OutputStream::Stderr => stderr.push_str(chunk),
        })
        .await;

    match result {
        Ok(_) => stdout,
        Err(e) => {
            tracing::debug!(command, error = %e, "Shell command failed");
            format!("Command failed: {}\nstdout: {}\nstderr: {}", e, stdout, stderr)
        }
    }
}
