//! Run reports with persistence.
//!
//! A report is created for every deploy or destroy run. It records the
//! planned order and the outcome of each stack, and is saved after every
//! stack when a log directory is configured, so a partial run can be
//! inspected after the fact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, Phase};
use crate::stack::StackId;

/// The action a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    Deploy,
    Destroy,
}

impl std::fmt::Display for RunAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunAction::Deploy => write!(f, "deploy"),
            RunAction::Destroy => write!(f, "destroy"),
        }
    }
}

/// Run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run has not started
    #[default]
    Pending,
    /// Run is in progress
    Running,
    /// Every stack in the run succeeded
    Completed,
    /// A stack failed; earlier stacks stay as they are
    Failed,
    /// The run was cancelled between stacks
    Cancelled,
}

/// Outcome of a single stack in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackOutcome {
    pub stack: StackId,
    pub success: bool,
    /// Phase the stack failed in, if it failed.
    pub phase: Option<Phase>,
    pub message: Option<String>,
    /// Export names published by this stack.
    #[serde(default)]
    pub exports: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Persistent record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub action: RunAction,
    pub state: RunState,
    /// Selected stacks; empty means the whole graph.
    pub selection: Vec<StackId>,
    /// Stacks in the order the run processes them.
    pub planned: Vec<StackId>,
    pub outcomes: Vec<StackOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// First failing stack.
    pub failed_stack: Option<StackId>,
    pub error: Option<String>,
    /// Directory the report is saved into, if any.
    #[serde(skip)]
    pub log_dir: Option<PathBuf>,
}

impl RunReport {
    pub fn new(action: RunAction, selection: Vec<StackId>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            action,
            state: RunState::Pending,
            selection,
            planned: Vec::new(),
            outcomes: Vec::new(),
            started_at: None,
            completed_at: None,
            failed_stack: None,
            error: None,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Stacks that completed successfully, in completion order.
    pub fn succeeded(&self) -> Vec<&StackId> {
        self.outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| &o.stack)
            .collect()
    }

    /// Planned stacks that were never processed.
    pub fn pending(&self) -> Vec<&StackId> {
        self.planned
            .iter()
            .filter(|id| !self.outcomes.iter().any(|o| &o.stack == *id))
            .collect()
    }

    pub(crate) fn start(&mut self, planned: Vec<StackId>) {
        self.planned = planned;
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn record(&mut self, outcome: StackOutcome) -> CoreResult<()> {
        self.outcomes.push(outcome);
        self.save()
    }

    pub(crate) fn finish(&mut self, error: Option<&CoreError>) -> CoreResult<()> {
        self.completed_at = Some(Utc::now());
        match error {
            None => self.state = RunState::Completed,
            Some(err) => {
                self.state = if matches!(err.root(), CoreError::Cancelled(_)) {
                    RunState::Cancelled
                } else {
                    RunState::Failed
                };
                if self.failed_stack.is_none() {
                    self.failed_stack = err.failing_stack().cloned();
                }
                self.error = Some(err.to_string());
            }
        }
        self.save()
    }

    /// Path of the report file inside `log_dir`.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.json", self.action, self.run_id)))
    }

    /// Save the report to disk. A no-op without a log directory.
    pub fn save(&self) -> CoreResult<()> {
        let Some(path) = self.log_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        fs::write(&path, json)?;
        debug!("Saved run report to {:?}", path);
        Ok(())
    }

    /// Load a report from disk.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut report: Self =
            serde_json::from_str(&content).map_err(|e| CoreError::Serialization(e.to_string()))?;
        report.log_dir = path.parent().map(Path::to_path_buf);
        Ok(report)
    }
}
