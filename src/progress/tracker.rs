//! Progress of one awarded unit of work.
//!
//! A `TaskProgress` is created in `Assigned` once a contract is awarded and is driven by the
//! worker's reports until it reaches `Completed`, `Failed` or `Timeout`. Terminal statuses are
//! sticky: later reports are ignored.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use crate::domain::AgentId;
use crate::error::{ContractNetError, Result};
use crate::events::{EventHub, Listener, ListenerId};

const INITIAL_STEP: &str = "Initializing";
/// Percentage changes below this are not reported
const PERCENT_NOISE: f64 = 0.01;

/// Lifecycle of a tracked task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Announced,
    Bidding,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Assigned or in progress
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match to {
            Failed | Timeout => true,
            Bidding => *self == Announced,
            Assigned => matches!(self, Announced | Bidding),
            InProgress => *self == Assigned,
            Completed => matches!(self, Assigned | InProgress),
            Announced => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Announced => write!(f, "announced"),
            TaskStatus::Bidding => write!(f, "bidding"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Events emitted by a [`TaskProgress`]
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    ProgressUpdated {
        task_id: String,
        from: f64,
        to: f64,
    },
    CheckpointReached {
        task_id: String,
        checkpoint: Checkpoint,
    },
    StepChanged {
        task_id: String,
        from: String,
        to: String,
    },
    /// Reached a terminal status; `detail` is the result or failure reason
    TaskCompleted {
        task_id: String,
        success: bool,
        detail: String,
    },
}

/// Point-in-time copy of a tracker
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub announcement_id: String,
    pub worker_id: AgentId,
    pub status: TaskStatus,
    pub percentage: f64,
    pub current_step: String,
    pub steps_completed: u32,
    pub total_steps: Option<u32>,
    pub checkpoints: Vec<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub result: Map<String, Value>,
}

#[derive(Debug)]
struct ProgressState {
    status: TaskStatus,
    percentage: f64,
    checkpoints: Vec<Checkpoint>,
    current_step: String,
    steps_completed: u32,
    total_steps: Option<u32>,
    completed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    result: Map<String, Value>,
}

pub struct TaskProgress {
    task_id: String,
    announcement_id: String,
    worker_id: AgentId,
    description: Option<String>,
    created_at: DateTime<Utc>,
    assigned_at: DateTime<Utc>,
    state: RwLock<ProgressState>,
    events: EventHub<ProgressEvent>,
}

impl TaskProgress {
    pub fn new(
        task_id: impl Into<String>,
        announcement_id: impl Into<String>,
        worker_id: AgentId,
    ) -> Self {
        Self::new_at(task_id, announcement_id, worker_id, Utc::now())
    }

    /// Tracker assigned at `now`
    pub fn new_at(
        task_id: impl Into<String>,
        announcement_id: impl Into<String>,
        worker_id: AgentId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            announcement_id: announcement_id.into(),
            worker_id,
            description: None,
            created_at: now,
            assigned_at: now,
            state: RwLock::new(ProgressState {
                status: TaskStatus::Assigned,
                percentage: 0.0,
                checkpoints: Vec::new(),
                current_step: INITIAL_STEP.to_string(),
                steps_completed: 0,
                total_steps: None,
                completed_at: None,
                failure_reason: None,
                result: Map::new(),
            }),
            events: EventHub::new("progress"),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn announcement_id(&self) -> &str {
        &self.announcement_id
    }

    pub fn worker_id(&self) -> AgentId {
        self.worker_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn assigned_at(&self) -> DateTime<Utc> {
        self.assigned_at
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn percentage(&self) -> f64 {
        self.state.read().percentage
    }

    pub fn current_step(&self) -> String {
        self.state.read().current_step.clone()
    }

    pub fn steps_completed(&self) -> u32 {
        self.state.read().steps_completed
    }

    pub fn total_steps(&self) -> Option<u32> {
        self.state.read().total_steps
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.state.read().checkpoints.clone()
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.state.read().checkpoints.last().cloned()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().completed_at
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.state.read().failure_reason.clone()
    }

    pub fn result(&self, key: &str) -> Option<Value> {
        self.state.read().result.get(key).cloned()
    }

    pub fn put_result(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.write().result.insert(key.into(), value.into());
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Move to `status`. `Ok(false)` when already there, an error when the transition table
    /// does not allow it.
    pub fn set_status(&self, status: TaskStatus) -> Result<bool> {
        let from = {
            let mut state = self.state.write();
            let from = state.status;
            if from == status {
                return Ok(false);
            }
            if !from.can_transition_to(status) {
                return Err(ContractNetError::InvalidStateTransition {
                    from: from.to_string(),
                    to: status.to_string(),
                });
            }
            state.status = status;
            if status.is_terminal() {
                state.completed_at = Some(Utc::now());
            }
            from
        };

        info!(task_id = %self.task_id, %from, to = %status, "Task status changed");
        self.events.emit(ProgressEvent::StatusChanged {
            task_id: self.task_id.clone(),
            from,
            to: status,
        });
        Ok(true)
    }

    /// Assigned to in progress
    pub fn start(&self) -> Result<bool> {
        self.set_status(TaskStatus::InProgress)
    }

    /// Clamp to 0-100 and store. Returns whether a notable change was reported.
    /// Ignored once the task is terminal.
    pub fn set_completion_percentage(&self, percentage: f64) -> bool {
        if percentage.is_nan() {
            return false;
        }
        let clamped = percentage.clamp(0.0, 100.0);
        let from = {
            let mut state = self.state.write();
            if state.status.is_terminal() {
                return false;
            }
            std::mem::replace(&mut state.percentage, clamped)
        };
        self.report_percentage(from, clamped)
    }

    /// Add `amount` (may be negative) and return the clamped result
    pub fn increment_progress(&self, amount: f64) -> f64 {
        let (from, to) = {
            let mut state = self.state.write();
            if state.status.is_terminal() || amount.is_nan() {
                return state.percentage;
            }
            let from = state.percentage;
            state.percentage = (from + amount).clamp(0.0, 100.0);
            (from, state.percentage)
        };
        self.report_percentage(from, to);
        to
    }

    fn report_percentage(&self, from: f64, to: f64) -> bool {
        if (from - to).abs() < PERCENT_NOISE {
            return false;
        }
        debug!(task_id = %self.task_id, percentage = to, "Task progress");
        self.events.emit(ProgressEvent::ProgressUpdated {
            task_id: self.task_id.clone(),
            from,
            to,
        });
        true
    }

    /// Append a checkpoint and force the percentage to it
    pub fn add_checkpoint(&self, checkpoint: Checkpoint) -> bool {
        let from = {
            let mut state = self.state.write();
            if state.status.is_terminal() {
                return false;
            }
            state.checkpoints.push(checkpoint.clone());
            std::mem::replace(&mut state.percentage, checkpoint.percentage)
        };

        info!(task_id = %self.task_id, checkpoint = %checkpoint, "Checkpoint reached");
        self.report_percentage(from, checkpoint.percentage);
        self.events.emit(ProgressEvent::CheckpointReached {
            task_id: self.task_id.clone(),
            checkpoint,
        });
        true
    }

    pub fn set_current_step(&self, step: impl Into<String>) -> bool {
        let step = step.into();
        let from = {
            let mut state = self.state.write();
            if state.current_step == step {
                return false;
            }
            std::mem::replace(&mut state.current_step, step.clone())
        };

        info!(task_id = %self.task_id, %from, to = %step, "Task step changed");
        self.events.emit(ProgressEvent::StepChanged {
            task_id: self.task_id.clone(),
            from,
            to: step,
        });
        true
    }

    /// Count the current step as done and move to `next_step`
    pub fn complete_step(&self, next_step: impl Into<String>) -> u32 {
        let completed = {
            let mut state = self.state.write();
            state.steps_completed += 1;
            state.steps_completed
        };
        self.set_current_step(next_step);
        completed
    }

    pub fn set_total_steps(&self, total: u32) {
        self.state.write().total_steps = Some(total);
    }

    pub fn mark_completed(&self, result: impl Into<String>) -> bool {
        let result = result.into();
        let from = {
            let mut state = self.state.write();
            if !state.status.can_transition_to(TaskStatus::Completed) {
                return false;
            }
            let from = (state.status, state.percentage);
            state.status = TaskStatus::Completed;
            state.percentage = 100.0;
            state.completed_at = Some(Utc::now());
            state
                .result
                .insert("result".to_string(), Value::String(result.clone()));
            from
        };

        info!(task_id = %self.task_id, worker = %self.worker_id, result = %result, "Task completed");
        self.finish(from, TaskStatus::Completed, true, result);
        true
    }

    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.terminate(TaskStatus::Failed, Some(reason.clone())) {
            return false;
        }
        warn!(task_id = %self.task_id, worker = %self.worker_id, reason = %reason, "Task failed");
        true
    }

    pub fn mark_timed_out(&self) -> bool {
        if !self.terminate(TaskStatus::Timeout, None) {
            return false;
        }
        warn!(task_id = %self.task_id, worker = %self.worker_id, "Task timed out");
        true
    }

    fn terminate(&self, status: TaskStatus, reason: Option<String>) -> bool {
        let from = {
            let mut state = self.state.write();
            if !state.status.can_transition_to(status) {
                return false;
            }
            let from = (state.status, state.percentage);
            state.status = status;
            state.completed_at = Some(Utc::now());
            match &reason {
                Some(r) => {
                    state.failure_reason = Some(r.clone());
                    state
                        .result
                        .insert("failure_reason".to_string(), Value::String(r.clone()));
                }
                None => {
                    state.result.insert("timeout".to_string(), Value::Bool(true));
                }
            }
            from
        };

        let detail = reason.unwrap_or_else(|| "Timeout".to_string());
        self.finish(from, status, false, detail);
        true
    }

    fn finish(&self, from: (TaskStatus, f64), to: TaskStatus, success: bool, detail: String) {
        let (from_status, from_pct) = from;
        self.events.emit(ProgressEvent::StatusChanged {
            task_id: self.task_id.clone(),
            from: from_status,
            to,
        });
        if success {
            self.report_percentage(from_pct, 100.0);
        }
        self.events.emit(ProgressEvent::TaskCompleted {
            task_id: self.task_id.clone(),
            success,
            detail,
        });
    }

    /// Time since creation, frozen at completion
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let end = self.completed_at().unwrap_or(now);
        (end - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    /// Assignment to completion; `None` until terminal
    pub fn execution_time(&self) -> Option<Duration> {
        self.completed_at()
            .map(|done| (done - self.assigned_at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Percent per second; zero with under a second elapsed or no progress yet
    pub fn progress_rate_at(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = self.elapsed_at(now);
        let pct = self.percentage();
        if elapsed < Duration::from_secs(1) || pct < PERCENT_NOISE {
            return 0.0;
        }
        pct / elapsed.as_secs_f64()
    }

    pub fn progress_rate(&self) -> f64 {
        self.progress_rate_at(Utc::now())
    }

    /// Linear extrapolation of the remaining time; `None` when the rate is not positive
    pub fn estimated_time_remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let rate = self.progress_rate_at(now);
        if rate <= 0.0 {
            return None;
        }
        let remaining = (100.0 - self.percentage()).max(0.0);
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.estimated_time_remaining_at(Utc::now())
    }

    /// Time since reaching a terminal status; `None` while active
    pub fn age_since_completion(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.completed_at()
            .map(|done| (now - done).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read();
        ProgressSnapshot {
            task_id: self.task_id.clone(),
            announcement_id: self.announcement_id.clone(),
            worker_id: self.worker_id,
            status: state.status,
            percentage: state.percentage,
            current_step: state.current_step.clone(),
            steps_completed: state.steps_completed,
            total_steps: state.total_steps,
            checkpoints: state.checkpoints.clone(),
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            completed_at: state.completed_at,
            failure_reason: state.failure_reason.clone(),
            result: state.result.clone(),
        }
    }

    pub fn add_listener(&self, listener: impl Listener<ProgressEvent> + 'static) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        let worker = self.worker_id.simple().to_string();
        write!(
            f,
            "TaskProgress[{}, worker={}, status={}, progress={:.1}%, step='{}']",
            self.task_id,
            &worker[..8],
            state.status,
            state.percentage,
            state.current_step
        )
    }
}
