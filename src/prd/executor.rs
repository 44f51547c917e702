//! Phase execution boundary
//!
//! The engine hands each phase of a story to a [`PhaseExecutor`] and treats
//! the work as opaque. Only the reported success flag decides whether the
//! story may be marked complete.

use super::types::{Phase, Story};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::process::Command;

/// One unit of work handed to an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRequest {
    pub document_path: PathBuf,
    pub document_name: String,
    pub story: Story,
    /// None when the story declares no phases
    pub phase: Option<Phase>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl PhaseOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            output: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Runs the work for one story phase
///
/// `Err` means the executor itself broke; `Ok` with `success: false` means
/// the work ran and failed. The engine records both as a failed iteration.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutcome>;
}

/// Runs a shell command for every phase
///
/// The request is exposed through `PRD_DOCUMENT`, `PRD_DOCUMENT_NAME`,
/// `PRD_STORY_ID`, `PRD_PHASE` (empty for phase-less stories) and
/// `PRD_CAPABILITIES` (comma separated). Exit status decides success.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build(&self, request: &PhaseRequest) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", self.command.as_str()]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", self.command.as_str()]);
            cmd
        };

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.env("PRD_DOCUMENT", &request.document_path)
            .env("PRD_DOCUMENT_NAME", &request.document_name)
            .env("PRD_STORY_ID", &request.story.id)
            .env(
                "PRD_PHASE",
                request
                    .phase
                    .map(|p| p.number().to_string())
                    .unwrap_or_default(),
            )
            .env("PRD_CAPABILITIES", request.capabilities.join(","))
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PhaseExecutor for ShellExecutor {
    async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutcome> {
        let out = self.build(request).output().await?;

        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);

        let outcome = if out.status.success() {
            PhaseOutcome::success(stdout.trim())
        } else {
            let message = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else if !stdout.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                format!("Command exited with code: {:?}", out.status.code())
            };
            PhaseOutcome::failure(message)
        };

        Ok(match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(output) => outcome.with_output(output),
            Err(_) => outcome,
        })
    }
}
