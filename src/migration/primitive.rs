use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::settings::RelocationSettings;
use crate::core::guest::{GuestId, GuestKind};
use crate::errors::RelocationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocationRequest {
    pub guest: GuestId,
    pub guest_name: String,
    pub kind: GuestKind,
    pub source: String,
    pub target: String,
    pub live: bool,
}

/// Outcome of the last-moment check before a relocation is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// The plan no longer matches reality; the move is skipped.
    Stale(String),
}

/// Opaque token for a relocation still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelocationHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationStatus {
    Completed,
    Pending(RelocationHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Completed,
    Failed(String),
}

/// The platform operation that actually moves a guest.
#[async_trait]
pub trait RelocationPrimitive: Send + Sync {
    async fn preflight(&self, request: &RelocationRequest) -> Result<Preflight, RelocationError>;

    async fn relocate(&self, request: &RelocationRequest) -> Result<RelocationStatus, RelocationError>;

    async fn poll(
        &self,
        request: &RelocationRequest,
        handle: &RelocationHandle,
    ) -> Result<PollStatus, RelocationError>;

    /// Stops tracking a relocation the executor gave up on. The platform operation keeps running.
    async fn abandon(&self, _request: &RelocationRequest, _handle: &RelocationHandle) {}
}

/// Drives `qm migrate` / `pct migrate` (or whatever the templates say) as child processes.
pub struct CommandRelocator {
    settings: RelocationSettings,
    running: Mutex<HashMap<RelocationHandle, Child>>,
}

impl CommandRelocator {
    pub fn new(settings: RelocationSettings) -> Self {
        Self {
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn render(template: &[String], request: &RelocationRequest) -> Vec<String> {
        template
            .iter()
            .map(|part| {
                part.replace("{id}", &request.guest.to_string())
                    .replace("{source}", &request.source)
                    .replace("{target}", &request.target)
            })
            .collect()
    }

    fn command(args: &[String]) -> Result<Command, RelocationError> {
        let (program, rest) = args.split_first().ok_or_else(|| {
            RelocationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command template",
            ))
        })?;
        let mut command = Command::new(program);
        command.args(rest);
        Ok(command)
    }

    /// Runs a template to completion; `None` when it exited zero, else its stderr.
    async fn check(args: &[String]) -> Result<Option<String>, RelocationError> {
        let output = Self::command(args)?.output().await?;
        if output.status.success() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    fn status_template(&self, kind: GuestKind) -> &[String] {
        match kind {
            GuestKind::Vm => &self.settings.vm_status_command,
            GuestKind::Container => &self.settings.ct_status_command,
        }
    }

    fn migrate_args(&self, request: &RelocationRequest) -> Vec<String> {
        let (template, live_args) = match request.kind {
            GuestKind::Vm => (&self.settings.vm_command, &self.settings.vm_live_args),
            GuestKind::Container => (&self.settings.ct_command, &self.settings.ct_live_args),
        };
        let mut args = Self::render(template, request);
        if request.live {
            args.extend(Self::render(live_args, request));
        }
        args
    }
}

/// Parses `status: running` style output.
fn parse_status(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(str::trim)
}

#[async_trait]
impl RelocationPrimitive for CommandRelocator {
    async fn preflight(&self, request: &RelocationRequest) -> Result<Preflight, RelocationError> {
        let args = Self::render(self.status_template(request.kind), request);
        let output = Self::command(&args)?.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Ok(Preflight::Stale(format!(
                "guest {} not found on {}: {}",
                request.guest, request.source, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_status(&stdout) {
            Some("running") => {}
            Some(state) => return Ok(Preflight::Stale(format!("guest is {}", state))),
            None => return Ok(Preflight::Stale("guest status unknown".to_string())),
        }

        if self.settings.node_status_command.is_empty() {
            return Ok(Preflight::Ready);
        }
        let args = Self::render(&self.settings.node_status_command, request);
        match Self::check(&args).await? {
            None => Ok(Preflight::Ready),
            Some(stderr) => Ok(Preflight::Stale(format!(
                "target {} is not reachable: {}",
                request.target, stderr
            ))),
        }
    }

    async fn relocate(&self, request: &RelocationRequest) -> Result<RelocationStatus, RelocationError> {
        let args = self.migrate_args(request);
        info!(guest = %request.guest_name, command = %args.join(" "), "Starting relocation");
        let child = Self::command(&args)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let handle = RelocationHandle(format!(
            "{}:{}->{}:{}",
            request.guest,
            request.source,
            request.target,
            Uuid::new_v4()
        ));
        self.running.lock().await.insert(handle.clone(), child);
        Ok(RelocationStatus::Pending(handle))
    }

    async fn poll(
        &self,
        request: &RelocationRequest,
        handle: &RelocationHandle,
    ) -> Result<PollStatus, RelocationError> {
        let mut running = self.running.lock().await;
        let Some(child) = running.get_mut(handle) else {
            return Err(RelocationError::Failed {
                guest: request.guest_name.clone(),
                message: format!("unknown relocation handle {}", handle.0),
            });
        };
        let Some(status) = child.try_wait()? else {
            debug!(guest = %request.guest_name, "Relocation still running");
            return Ok(PollStatus::Running);
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            if let Err(e) = pipe.read_to_string(&mut stderr).await {
                warn!(error = %e, "Could not read relocation stderr");
            }
        }
        running.remove(handle);
        if status.success() {
            Ok(PollStatus::Completed)
        } else {
            Ok(PollStatus::Failed(format!("exit {}: {}", status, stderr.trim())))
        }
    }

    async fn abandon(&self, request: &RelocationRequest, handle: &RelocationHandle) {
        let Some(mut child) = self.running.lock().await.remove(handle) else {
            return;
        };
        warn!(guest = %request.guest_name, handle = %handle.0, "Abandoning relocation, reaping in background");
        drop(child.stderr.take());
        let guest = request.guest_name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(guest = %guest, %status, "Abandoned relocation exited"),
                Err(e) => warn!(guest = %guest, error = %e, "Could not reap abandoned relocation"),
            }
        });
    }
}
