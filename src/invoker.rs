use std::process::Command;

use serde::Serialize;

/// Outcome of one external snapshot attempt. Produced once per host per run;
/// the controller never infers success from the absence of an error.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub host: String,
    pub success: bool,
    pub detail: Option<String>,
}

/// The external mechanism that captures the storage volume or VM state of a
/// host. Treated as a black box: it may block for the duration of the volume
/// operation and it owns its own timeout/retry policy.
pub trait SnapshotInvoker {
    fn name(&self) -> &str;

    /// Capture a snapshot of the given host. Blocks until the underlying
    /// operation finishes one way or the other.
    fn snapshot(&self, host: &str) -> SnapshotResult;
}

/// Invokes a separately deployed executable as `<command> <host>` and maps its
/// exit status to a result.
pub struct CommandInvoker {
    command: String,
}

impl CommandInvoker {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl SnapshotInvoker for CommandInvoker {
    fn name(&self) -> &str {
        &self.command
    }

    fn snapshot(&self, host: &str) -> SnapshotResult {
        match Command::new(&self.command).arg(host).status() {
            Ok(status) if status.success() => SnapshotResult {
                host: host.to_string(),
                success: true,
                detail: None,
            },
            Ok(status) => SnapshotResult {
                host: host.to_string(),
                success: false,
                detail: Some(format!("{} exited with {}", self.command, status)),
            },
            Err(err) => SnapshotResult {
                host: host.to_string(),
                success: false,
                detail: Some(format!("failed to spawn {}: {}", self.command, err)),
            },
        }
    }
}
