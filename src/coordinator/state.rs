//! Coordinated task records
//!
//! Same snapshot discipline as negotiations: the coordinator swaps whole `CoordinatedTask`
//! values under its write lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::domain::{AgentId, Task};
use crate::error::{ContractNetError, Result};

/// Lifecycle of a composite task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationState {
    Decomposing,
    Bidding,
    Executing,
    Completed,
    Failed,
}

impl CoordinationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinationState::Completed | CoordinationState::Failed)
    }

    pub fn can_transition_to(&self, to: CoordinationState) -> bool {
        use CoordinationState::*;
        matches!(
            (self, to),
            (Decomposing, Bidding)
                | (Decomposing, Failed)
                | (Bidding, Executing)
                | (Bidding, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

impl std::fmt::Display for CoordinationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationState::Decomposing => write!(f, "decomposing"),
            CoordinationState::Bidding => write!(f, "bidding"),
            CoordinationState::Executing => write!(f, "executing"),
            CoordinationState::Completed => write!(f, "completed"),
            CoordinationState::Failed => write!(f, "failed"),
        }
    }
}

/// One sub-task of a composite and who is doing it
#[derive(Debug, Clone, Serialize)]
pub struct SubTaskAllocation {
    pub subtask_id: String,
    pub task: Task,
    pub announcement_id: Option<String>,
    pub assigned_agent: Option<AgentId>,
    pub complete: bool,
    pub failed: bool,
    pub result: Option<String>,
}

impl SubTaskAllocation {
    pub fn new(subtask_id: impl Into<String>, task: Task) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            task,
            announcement_id: None,
            assigned_agent: None,
            complete: false,
            failed: false,
            result: None,
        }
    }

    /// Assigned, not finished and not failed
    pub fn is_outstanding(&self) -> bool {
        self.assigned_agent.is_some() && !self.complete && !self.failed
    }
}

/// A composite task and its sub-task allocations
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatedTask {
    task_id: String,
    original: Task,
    requester_id: AgentId,
    state: CoordinationState,
    subtasks: Vec<SubTaskAllocation>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

impl CoordinatedTask {
    pub fn new(
        task_id: impl Into<String>,
        original: Task,
        requester_id: AgentId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            original,
            requester_id,
            state: CoordinationState::Decomposing,
            subtasks: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            failure_reason: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn original(&self) -> &Task {
        &self.original
    }

    pub fn requester_id(&self) -> AgentId {
        self.requester_id
    }

    pub fn state(&self) -> CoordinationState {
        self.state
    }

    pub fn subtasks(&self) -> &[SubTaskAllocation] {
        &self.subtasks
    }

    pub fn subtask(&self, subtask_id: &str) -> Option<&SubTaskAllocation> {
        self.subtasks.iter().find(|s| s.subtask_id == subtask_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Fraction of sub-tasks reported complete
    pub fn progress(&self) -> f64 {
        if self.subtasks.is_empty() {
            return 0.0;
        }
        let done = self.subtasks.iter().filter(|s| s.complete).count();
        done as f64 / self.subtasks.len() as f64
    }

    pub fn all_complete(&self) -> bool {
        !self.subtasks.is_empty() && self.subtasks.iter().all(|s| s.complete)
    }

    /// Sub-tasks nobody holds: never awarded, or failed after award
    pub fn unallocated(&self) -> impl Iterator<Item = &SubTaskAllocation> {
        self.subtasks
            .iter()
            .filter(|s| !s.complete && (s.assigned_agent.is_none() || s.failed))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn age_since_finished(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.finished_at
            .map(|done| (now - done).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn with_state(&self, state: CoordinationState, now: DateTime<Utc>) -> Result<Self> {
        if !self.state.can_transition_to(state) {
            return Err(ContractNetError::InvalidStateTransition {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        let mut next = self.clone();
        next.state = state;
        next.updated_at = now;
        if state.is_terminal() {
            next.finished_at = Some(now);
        }
        Ok(next)
    }

    pub fn with_failure(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.with_state(CoordinationState::Failed, now)?;
        next.failure_reason = Some(reason.into());
        Ok(next)
    }

    pub fn with_subtasks(&self, subtasks: Vec<SubTaskAllocation>, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.subtasks = subtasks;
        next.updated_at = now;
        next
    }

    /// Apply `f` to one allocation; `None` if the sub-task is unknown
    pub fn with_subtask(
        &self,
        subtask_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut SubTaskAllocation),
    ) -> Option<Self> {
        let mut next = self.clone();
        let allocation = next
            .subtasks
            .iter_mut()
            .find(|s| s.subtask_id == subtask_id)?;
        f(allocation);
        next.updated_at = now;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn coordinated() -> CoordinatedTask {
        let now = Utc::now();
        let task = CoordinatedTask::new("coord_1", Task::new("build"), Uuid::new_v4(), now);
        task.with_subtasks(
            vec![
                SubTaskAllocation::new("coord_1_sub0", Task::new("gather")),
                SubTaskAllocation::new("coord_1_sub1", Task::new("place")),
            ],
            now,
        )
    }

    #[test]
    fn progress_counts_completed_subtasks() {
        let now = Utc::now();
        let task = coordinated();
        assert_eq!(task.progress(), 0.0);
        assert!(!task.all_complete());

        let task = task
            .with_subtask("coord_1_sub0", now, |s| s.complete = true)
            .unwrap();
        assert_eq!(task.progress(), 0.5);
        assert!(task.with_subtask("coord_1_sub9", now, |_| {}).is_none());

        let task = task
            .with_subtask("coord_1_sub1", now, |s| s.complete = true)
            .unwrap();
        assert!(task.all_complete());
    }

    #[test]
    fn state_table_is_enforced() {
        let now = Utc::now();
        let task = coordinated();
        assert!(task.with_state(CoordinationState::Completed, now).is_err());

        let failed = task.with_failure("decomposer crashed", now).unwrap();
        assert_eq!(failed.state(), CoordinationState::Failed);
        assert_eq!(failed.finished_at(), Some(now));
        assert!(failed.with_state(CoordinationState::Bidding, now).is_err());
    }

    #[test]
    fn unallocated_includes_failed_and_unawarded() {
        let now = Utc::now();
        let worker = Uuid::new_v4();
        let task = coordinated()
            .with_subtask("coord_1_sub0", now, |s| {
                s.assigned_agent = Some(worker);
                s.failed = true;
            })
            .unwrap();

        let ids: Vec<_> = task.unallocated().map(|s| s.subtask_id.as_str()).collect();
        assert_eq!(ids, vec!["coord_1_sub0", "coord_1_sub1"]);
        assert!(!task.subtask("coord_1_sub0").unwrap().is_outstanding());
    }
}
