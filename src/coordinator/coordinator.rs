//! Composite task coordination
//!
//! `coordinate_task` registers the composite and spawns its driver:
//!   - decompose through the configured `TaskDecomposer`
//!   - announce every sub-task, all sharing one bidding window
//!   - wait out the window plus a grace period, then award each sub-task
//!   - dispatch winners through the `WorkerDispatch`
//!
//! Sub-task reports arrive through `handle_task_report`, or are picked up from the progress
//! trackers by `monitor_progress`. A periodic sweep evicts finished composites and those stuck
//! in decomposition.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::collaborators::{IdentityDecomposer, LoggingDispatch, TaskDecomposer, WorkerDispatch};
use super::protocol::{progress_task_id, ContractNetProtocol};
use super::state::{CoordinatedTask, CoordinationState, SubTaskAllocation};
use crate::config::CoordinatorConfig;
use crate::domain::{AgentId, Task};
use crate::error::{ContractNetError, Result};
use crate::events::{EventHub, Listener, ListenerId};
use crate::progress::TaskStatus;

/// Events emitted by the [`Coordinator`]
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    StateChanged {
        task_id: String,
        from: CoordinationState,
        to: CoordinationState,
    },
    SubtaskCompleted {
        task_id: String,
        subtask_id: String,
        worker: Option<AgentId>,
    },
    SubtaskFailed {
        task_id: String,
        subtask_id: String,
        worker: Option<AgentId>,
        reason: String,
    },
    ReassignmentCandidate {
        task_id: String,
        subtask_id: String,
        previous_worker: Option<AgentId>,
    },
    /// Evicted after sitting in decomposition past the timeout
    DecompositionStalled { task_id: String },
}

/// A sub-task that needs a new worker
#[derive(Debug, Clone, Serialize)]
pub struct ReassignmentCandidate {
    pub task_id: String,
    pub subtask_id: String,
    pub task: Task,
    pub previous_worker: Option<AgentId>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    protocol: Arc<ContractNetProtocol>,
    decomposer: Arc<dyn TaskDecomposer>,
    dispatch: Arc<dyn WorkerDispatch>,
    config: CoordinatorConfig,
    tasks: DashMap<String, Arc<CoordinatedTask>>,
    write_lock: Mutex<()>,
    events: EventHub<CoordinatorEvent>,
    running: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Coordinator with the identity decomposer and log-only dispatch
    pub fn new(protocol: Arc<ContractNetProtocol>, config: CoordinatorConfig) -> Result<Self> {
        Self::with_collaborators(
            protocol,
            config,
            Arc::new(IdentityDecomposer),
            Arc::new(LoggingDispatch),
        )
    }

    pub fn with_collaborators(
        protocol: Arc<ContractNetProtocol>,
        config: CoordinatorConfig,
        decomposer: Arc<dyn TaskDecomposer>,
        dispatch: Arc<dyn WorkerDispatch>,
    ) -> Result<Self> {
        config.validate().map_err(ContractNetError::InvalidConfig)?;

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                protocol,
                decomposer,
                dispatch,
                config,
                tasks: DashMap::new(),
                write_lock: Mutex::new(()),
                events: EventHub::new("coordinator"),
                running: AtomicBool::new(true),
                loops: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn protocol(&self) -> &Arc<ContractNetProtocol> {
        &self.inner.protocol
    }

    /// Register a composite task and start driving it. Returns the coordinated task id.
    pub fn coordinate_task(&self, task: Task, requester_id: AgentId) -> Result<String> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ContractNetError::NotRunning);
        }
        if task.action.trim().is_empty() {
            return Err(ContractNetError::invalid("task action cannot be blank"));
        }
        if requester_id.is_nil() {
            return Err(ContractNetError::invalid("requester id cannot be nil"));
        }
        let runtime = Handle::try_current()
            .map_err(|_| ContractNetError::NoRuntime("task coordination".to_string()))?;

        let task_id = generate_task_id();
        let record = CoordinatedTask::new(task_id.clone(), task, requester_id, Utc::now());
        {
            let _guard = self.inner.write_lock.lock();
            self.inner.tasks.insert(task_id.clone(), Arc::new(record));
        }
        info!(task_id = %task_id, requester = %requester_id, "Coordination started");

        let inner = self.inner.clone();
        let id = task_id.clone();
        runtime.spawn(async move {
            inner.drive(&id).await;
        });

        Ok(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Arc<CoordinatedTask>> {
        self.inner.snapshot(task_id)
    }

    pub fn tasks(&self) -> Vec<Arc<CoordinatedTask>> {
        self.inner
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Composites not yet completed or failed
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    /// Record a sub-task outcome reported by its worker
    pub fn handle_task_report(&self, subtask_id: &str, success: bool, result: &str) -> bool {
        self.inner.handle_task_report(subtask_id, success, result)
    }

    /// Outstanding sub-tasks held by a worker that reports itself idle
    pub fn rebalance_on_agent_idle(&self, worker: AgentId) -> Vec<ReassignmentCandidate> {
        let candidates: Vec<ReassignmentCandidate> = self
            .inner
            .tasks
            .iter()
            .filter(|e| e.value().state() == CoordinationState::Executing)
            .flat_map(|e| {
                let task = e.value().clone();
                task.subtasks()
                    .iter()
                    .filter(|s| s.is_outstanding() && s.assigned_agent == Some(worker))
                    .map(|s| ReassignmentCandidate {
                        task_id: task.task_id().to_string(),
                        subtask_id: s.subtask_id.clone(),
                        task: s.task.clone(),
                        previous_worker: s.assigned_agent,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        if !candidates.is_empty() {
            info!(worker = %worker, count = candidates.len(), "Idle worker holds outstanding sub-tasks");
        }
        for c in &candidates {
            self.inner.events.emit(CoordinatorEvent::ReassignmentCandidate {
                task_id: c.task_id.clone(),
                subtask_id: c.subtask_id.clone(),
                previous_worker: c.previous_worker,
            });
        }
        candidates
    }

    /// Sub-tasks of executing composites that were never awarded or whose worker failed
    pub fn reassignment_candidates(&self) -> Vec<ReassignmentCandidate> {
        self.inner
            .tasks
            .iter()
            .filter(|e| e.value().state() == CoordinationState::Executing)
            .flat_map(|e| {
                let task = e.value().clone();
                task.unallocated()
                    .map(|s| ReassignmentCandidate {
                        task_id: task.task_id().to_string(),
                        subtask_id: s.subtask_id.clone(),
                        task: s.task.clone(),
                        previous_worker: s.assigned_agent,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Pull sub-task outcomes from the protocol's progress trackers and finish composites
    /// whose sub-tasks are all complete. Returns the number of composites completed.
    pub fn monitor_progress(&self) -> usize {
        self.inner.monitor_progress()
    }

    pub fn cleanup(&self) -> usize {
        self.inner.cleanup_at(Utc::now())
    }

    /// Evict finished composites past retention and composites stuck in decomposition
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.cleanup_at(now)
    }

    /// Spawn the monitor and cleanup loops
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| ContractNetError::NoRuntime("coordinator loops".to_string()))?;
        let mut loops = self.inner.loops.lock();
        if !loops.is_empty() {
            return Ok(());
        }

        let monitor_every = Duration::from_secs(self.inner.config.monitor_interval_secs);
        let cleanup_every = Duration::from_secs(self.inner.config.cleanup_interval_secs);

        let inner = self.inner.clone();
        loops.push(runtime.spawn(async move {
            let mut interval = tokio::time::interval(monitor_every);
            while inner.running.load(Ordering::SeqCst) {
                interval.tick().await;
                inner.monitor_progress();
            }
        }));

        let inner = self.inner.clone();
        loops.push(runtime.spawn(async move {
            let mut interval = tokio::time::interval(cleanup_every);
            while inner.running.load(Ordering::SeqCst) {
                interval.tick().await;
                inner.cleanup_at(Utc::now());
            }
        }));

        info!("Coordinator loops started");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for handle in self.inner.loops.lock().drain(..) {
            handle.abort();
        }
        info!("Coordinator shut down");
    }

    pub fn add_listener(&self, listener: impl Listener<CoordinatorEvent> + 'static) -> ListenerId {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }
}

impl CoordinatorInner {
    fn snapshot(&self, task_id: &str) -> Option<Arc<CoordinatedTask>> {
        self.tasks.get(task_id).map(|e| e.value().clone())
    }

    /// Replace the record under the write lock. `f` returns `None` to leave it untouched.
    fn update<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&CoordinatedTask) -> Option<(CoordinatedTask, T)>,
    ) -> Option<T> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot(task_id)?;
        let (next, out) = f(current.as_ref())?;
        self.tasks.insert(task_id.to_string(), Arc::new(next));
        Some(out)
    }

    fn transition(&self, task_id: &str, to: CoordinationState, reason: Option<String>) -> bool {
        self.transition_at(task_id, to, reason, Utc::now())
    }

    fn transition_at(
        &self,
        task_id: &str,
        to: CoordinationState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let from = self.update(task_id, |current| {
            let next = match &reason {
                Some(r) if to == CoordinationState::Failed => current.with_failure(r.clone(), now),
                _ => current.with_state(to, now),
            };
            match next {
                Ok(next) => Some((next, current.state())),
                Err(e) => {
                    debug!(task_id, error = %e, "Coordination transition refused");
                    None
                }
            }
        });

        let Some(from) = from else {
            return false;
        };
        match &reason {
            Some(r) => warn!(task_id, %from, %to, reason = %r, "Coordination state changed"),
            None => info!(task_id, %from, %to, "Coordination state changed"),
        }
        self.events.emit(CoordinatorEvent::StateChanged {
            task_id: task_id.to_string(),
            from,
            to,
        });
        true
    }

    async fn drive(&self, task_id: &str) {
        let Some(record) = self.snapshot(task_id) else {
            return;
        };

        let parts = match self.decomposer.decompose(record.original()).await {
            Ok(parts) if !parts.is_empty() => parts,
            Ok(_) => {
                self.transition(
                    task_id,
                    CoordinationState::Failed,
                    Some("decomposition produced no sub-tasks".to_string()),
                );
                return;
            }
            Err(e) => {
                error!(task_id, error = %e, "Decomposition failed");
                self.transition(
                    task_id,
                    CoordinationState::Failed,
                    Some(format!("decomposition failed: {e}")),
                );
                return;
            }
        };

        // Announce every sub-task with one shared window
        let window = self.config.bidding_window();
        let requester = record.requester_id();
        let allocations: Vec<SubTaskAllocation> = parts
            .into_iter()
            .enumerate()
            .map(|(n, part)| {
                let mut allocation = SubTaskAllocation::new(format!("{task_id}_sub{n}"), part);
                match self
                    .protocol
                    .announce_task(allocation.task.clone(), requester, Some(window))
                {
                    Ok(announcement_id) => allocation.announcement_id = Some(announcement_id),
                    Err(e) => warn!(
                        task_id,
                        subtask_id = %allocation.subtask_id,
                        error = %e,
                        "Sub-task announcement failed"
                    ),
                }
                allocation
            })
            .collect();

        let count = allocations.len();
        let now = Utc::now();
        if self
            .update(task_id, |current| {
                Some((current.with_subtasks(allocations, now), ()))
            })
            .is_none()
        {
            return;
        }
        if !self.transition(task_id, CoordinationState::Bidding, None) {
            return;
        }
        info!(task_id, subtasks = count, "Sub-tasks announced");

        tokio::time::sleep(self.config.award_delay()).await;

        let Some(record) = self.snapshot(task_id) else {
            return;
        };
        let mut winners = Vec::new();
        for allocation in record.subtasks() {
            let Some(announcement_id) = &allocation.announcement_id else {
                continue;
            };
            let Some(winner) = self.protocol.select_winner(announcement_id) else {
                warn!(task_id, subtask_id = %allocation.subtask_id, "Sub-task not awarded");
                continue;
            };
            let worker = winner.bidder_id();

            self.update(task_id, |current| {
                current
                    .with_subtask(&allocation.subtask_id, Utc::now(), |s| {
                        s.assigned_agent = Some(worker)
                    })
                    .map(|next| (next, ()))
            });
            winners.push((allocation, worker));
        }

        let dispatches = winners.iter().map(|(allocation, worker)| {
            self.dispatch
                .dispatch(*worker, &allocation.subtask_id, &allocation.task)
        });
        let results = futures::future::join_all(dispatches).await;

        let mut awarded = 0usize;
        for ((allocation, _), result) in winners.iter().zip(results) {
            match result {
                Ok(()) => awarded += 1,
                Err(e) => {
                    self.fail_subtask(
                        task_id,
                        &allocation.subtask_id,
                        &format!("dispatch failed: {e}"),
                    );
                }
            }
        }

        if awarded > 0 {
            self.transition(task_id, CoordinationState::Executing, None);
            info!(task_id, awarded, total = record.subtasks().len(), "Sub-tasks awarded");
            // Reports can land while dispatch is still awaited
            self.finish_if_complete(task_id);
        } else {
            self.transition(
                task_id,
                CoordinationState::Failed,
                Some("no sub-task could be awarded".to_string()),
            );
        }
    }

    fn find_subtask(&self, subtask_id: &str) -> Option<String> {
        self.tasks
            .iter()
            .find(|e| e.value().subtask(subtask_id).is_some())
            .map(|e| e.key().clone())
    }

    fn handle_task_report(&self, subtask_id: &str, success: bool, result: &str) -> bool {
        let Some(task_id) = self.find_subtask(subtask_id) else {
            warn!(subtask_id, "Report for unknown sub-task");
            return false;
        };

        let applied = if success {
            self.complete_subtask(&task_id, subtask_id, result)
        } else {
            self.fail_subtask(&task_id, subtask_id, result)
        };
        if !applied {
            return false;
        }

        // Keep the protocol's tracker and performance ledger in step
        let announcement_id = self
            .snapshot(&task_id)
            .and_then(|t| t.subtask(subtask_id).and_then(|s| s.announcement_id.clone()));
        if let Some(announcement_id) = announcement_id {
            self.protocol
                .record_completion(&progress_task_id(&announcement_id), success, result);
        }

        self.finish_if_complete(&task_id);
        true
    }

    fn complete_subtask(&self, task_id: &str, subtask_id: &str, result: &str) -> bool {
        let worker = self.update(task_id, |current| {
            let allocation = current.subtask(subtask_id)?;
            if allocation.complete || allocation.failed {
                return None;
            }
            let worker = allocation.assigned_agent;
            current
                .with_subtask(subtask_id, Utc::now(), |s| {
                    s.complete = true;
                    s.result = Some(result.to_string());
                })
                .map(|next| (next, worker))
        });

        let Some(worker) = worker else {
            return false;
        };
        info!(task_id, subtask_id, "Sub-task completed");
        self.events.emit(CoordinatorEvent::SubtaskCompleted {
            task_id: task_id.to_string(),
            subtask_id: subtask_id.to_string(),
            worker,
        });
        true
    }

    fn fail_subtask(&self, task_id: &str, subtask_id: &str, reason: &str) -> bool {
        let worker = self.update(task_id, |current| {
            let allocation = current.subtask(subtask_id)?;
            if allocation.complete || allocation.failed {
                return None;
            }
            let worker = allocation.assigned_agent;
            current
                .with_subtask(subtask_id, Utc::now(), |s| {
                    s.failed = true;
                    s.result = Some(reason.to_string());
                })
                .map(|next| (next, worker))
        });

        let Some(worker) = worker else {
            return false;
        };
        warn!(task_id, subtask_id, reason, "Sub-task failed");
        self.events.emit(CoordinatorEvent::SubtaskFailed {
            task_id: task_id.to_string(),
            subtask_id: subtask_id.to_string(),
            worker,
            reason: reason.to_string(),
        });
        self.events.emit(CoordinatorEvent::ReassignmentCandidate {
            task_id: task_id.to_string(),
            subtask_id: subtask_id.to_string(),
            previous_worker: worker,
        });
        true
    }

    fn finish_if_complete(&self, task_id: &str) -> bool {
        let ready = self
            .snapshot(task_id)
            .is_some_and(|t| t.state() == CoordinationState::Executing && t.all_complete());
        ready && self.transition(task_id, CoordinationState::Completed, None)
    }

    fn monitor_progress(&self) -> usize {
        let executing: Vec<Arc<CoordinatedTask>> = self
            .tasks
            .iter()
            .filter(|e| e.value().state() == CoordinationState::Executing)
            .map(|e| e.value().clone())
            .collect();

        let mut finished = 0;
        for task in executing {
            for allocation in task.subtasks().iter().filter(|s| s.is_outstanding()) {
                let Some(announcement_id) = &allocation.announcement_id else {
                    continue;
                };
                let Some(progress) = self.protocol.progress_for_announcement(announcement_id) else {
                    continue;
                };
                match progress.status() {
                    TaskStatus::Completed => {
                        let result = progress
                            .result("result")
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default();
                        self.complete_subtask(task.task_id(), &allocation.subtask_id, &result);
                    }
                    TaskStatus::Failed | TaskStatus::Timeout => {
                        let reason = progress
                            .failure_reason()
                            .unwrap_or_else(|| progress.status().to_string());
                        self.fail_subtask(task.task_id(), &allocation.subtask_id, &reason);
                    }
                    _ => {}
                }
            }

            if self.finish_if_complete(task.task_id()) {
                finished += 1;
            }
        }
        finished
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        // Executing composites with no recent update are failed first, then age out below
        let idle = self.config.execution_timeout();
        let overdue: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| {
                let task = e.value();
                task.state() == CoordinationState::Executing
                    && (now - task.updated_at()).to_std().is_ok_and(|age| age > idle)
            })
            .map(|e| e.key().clone())
            .collect();
        for task_id in overdue {
            self.transition_at(
                &task_id,
                CoordinationState::Failed,
                Some("execution timed out".to_string()),
                now,
            );
        }

        let retention = self.config.completed_retention();
        let stall = self.config.decomposition_timeout();
        let mut stalled = Vec::new();

        let removed = {
            let _guard = self.write_lock.lock();
            let before = self.tasks.len();
            self.tasks.retain(|id, task| match task.state() {
                CoordinationState::Completed | CoordinationState::Failed => task
                    .age_since_finished(now)
                    .map_or(true, |age| age <= retention),
                CoordinationState::Decomposing if task.age(now) > stall => {
                    stalled.push(id.clone());
                    false
                }
                _ => true,
            });
            before.saturating_sub(self.tasks.len())
        };

        for task_id in stalled {
            warn!(task_id = %task_id, "Decomposition stalled, task evicted");
            self.events
                .emit(CoordinatorEvent::DecompositionStalled { task_id });
        }
        if removed > 0 {
            debug!(removed, "Coordinated tasks cleaned up");
        }
        removed
    }
}

fn generate_task_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("coord_{}", &uuid[..8])
}
