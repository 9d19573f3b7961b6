use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::GitCommitRecord;

use super::plan::Action;

/// State machine: Pending → Planning → Executing → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Planning,
    Executing,
    Succeeded,
    Failed,
    /// Infrastructure provisioning succeeded but artifact publishing (or the
    /// sync handoff) did not. Flagged for operator attention, never dropped.
    PartiallyCompleted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PartiallyCompleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    pub action: Action,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One execution of the plan-and-apply cycle for a project.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub project: String,
    /// Idempotency key: content hash of the spec this run applied.
    pub spec_hash: String,
    pub status: RunStatus,
    pub actions: Vec<PlannedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<GitCommitRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconciliationRun {
    pub fn new(project: &str, spec_hash: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.to_owned(),
            spec_hash: spec_hash.to_owned(),
            status: RunStatus::Pending,
            actions: Vec::new(),
            commit: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn set_plan(&mut self, actions: Vec<Action>) {
        self.status = RunStatus::Planning;
        self.actions = actions
            .into_iter()
            .map(|action| PlannedAction {
                action,
                status: ActionStatus::Pending,
                error: None,
            })
            .collect();
    }

    pub(crate) fn mark(&mut self, index: usize, status: ActionStatus, error: Option<String>) {
        if let Some(entry) = self.actions.get_mut(index) {
            entry.status = status;
            entry.error = error;
        }
    }

    /// Mark every still-pending action as skipped (used when a run halts).
    pub(crate) fn skip_remaining(&mut self) {
        for entry in &mut self.actions {
            if entry.status == ActionStatus::Pending {
                entry.status = ActionStatus::Skipped;
            }
        }
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Most advanced completed stage, for user-visible status.
    pub fn completed_stage(&self) -> Option<&Action> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.status == ActionStatus::Succeeded)
            .map(|a| &a.action)
    }

    /// Exact failure point, if any action failed.
    pub fn failure_point(&self) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.status == ActionStatus::Failed)
    }
}
