use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;
use vmbroker_core::{Error, HypervisorControl, HypervisorSettings, Result, VmState};

/// Hypervisor control through a libvirt-style command line tool.
///
/// Each state change runs `<program> [-c <uri>] <verb> <uuid>`, where the
/// verb is `start`, `destroy` or `reset`.
pub struct CommandControl {
    program: String,
    program_path: Option<PathBuf>,
    connect_uri: Option<String>,
}

impl CommandControl {
    pub fn new(settings: &HypervisorSettings) -> Self {
        let program_path = which::which(&settings.program).ok();
        if program_path.is_none() {
            tracing::warn!(program = %settings.program, "hypervisor control program not found in PATH");
        }

        Self {
            program: settings.program.clone(),
            program_path,
            connect_uri: settings.connect_uri.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.program_path.is_some()
    }

    fn build_args(&self, id: Uuid, state: VmState) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(uri) = &self.connect_uri {
            args.push("-c".to_string());
            args.push(uri.clone());
        }
        let verb = match state {
            VmState::Start => "start",
            VmState::Stop => "destroy",
            VmState::Reset => "reset",
        };
        args.push(verb.to_string());
        args.push(id.to_string());
        args
    }
}

/// Maps a failed invocation to the error the recycler acts on.
fn classify_failure(id: Uuid, state: VmState, status: &str, stderr: &str) -> Error {
    let stderr = stderr.trim();
    if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
        return Error::VmNotFound(id);
    }

    let reason = if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {stderr}")
    };
    Error::StateChangeFailed { id, state, reason }
}

#[async_trait]
impl HypervisorControl for CommandControl {
    fn name(&self) -> &str {
        &self.program
    }

    async fn request_state_change(&self, id: Uuid, state: VmState) -> Result<()> {
        let program_path = self
            .program_path
            .as_ref()
            .ok_or_else(|| Error::BackendUnavailable {
                name: self.program.clone(),
                reason: format!("{} binary not found in PATH", self.program),
            })?;

        let args = self.build_args(id, state);
        tracing::debug!(program = %self.program, ?args, "requesting VM state change");

        let output = Command::new(program_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::StateChangeFailed {
                id,
                state,
                reason: format!("failed to run {}: {e}", self.program),
            })?;

        if output.status.success() {
            tracing::trace!(%id, %state, "VM state change accepted");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(id, state, &output.status.to_string(), &stderr))
        }
    }
}
