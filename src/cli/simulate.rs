//! `cnp simulate`: one composite task allocated across simulated workers
//!
//! Workers listen for announcements and bid with random fitness. Winners receive their
//! sub-task through a channel-backed `WorkerDispatch`, walk it through a few checkpoints and
//! report back to the coordinator.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SimulateArgs;
use crate::config::AppConfig;
use crate::coordinator::{
    ContractNetProtocol, CoordinatedTask, CoordinationState, Coordinator, ProtocolEvent,
    TaskDecomposer, WorkerDispatch,
};
use crate::domain::{AgentId, Bid, BidParams, Task};
use crate::error::{ContractNetError, Result};
use crate::progress::Checkpoint;

const CHECKPOINTS: [(&str, f64); 3] = [("gathered", 25.0), ("underway", 60.0), ("finishing", 90.0)];

/// Splits a composite into `count` numbered parts
struct SplitDecomposer {
    count: usize,
}

#[async_trait]
impl TaskDecomposer for SplitDecomposer {
    async fn decompose(&self, task: &Task) -> anyhow::Result<Vec<Task>> {
        Ok((0..self.count)
            .map(|n| {
                Task::new(format!("{}_part", task.action))
                    .with_param("part", n as i64)
                    .with_param("of", self.count as i64)
            })
            .collect())
    }
}

struct Assignment {
    worker: AgentId,
    subtask_id: String,
}

/// Forwards assignments to the simulation loop
struct ChannelDispatch {
    tx: mpsc::UnboundedSender<Assignment>,
}

#[async_trait]
impl WorkerDispatch for ChannelDispatch {
    async fn dispatch(&self, worker: AgentId, subtask_id: &str, _task: &Task) -> anyhow::Result<()> {
        self.tx.send(Assignment {
            worker,
            subtask_id: subtask_id.to_string(),
        })?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct SubtaskRow {
    pub subtask: String,
    pub worker: String,
    pub bids: usize,
    pub outcome: String,
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub task_id: String,
    pub state: String,
    pub progress: f64,
    pub subtasks: Vec<SubtaskRow>,
    pub selections: u64,
    pub conflicts_resolved: u64,
}

pub async fn run_simulation(mut config: AppConfig, args: SimulateArgs) -> Result<SimulationSummary> {
    if args.workers == 0 || args.subtasks == 0 {
        return Err(ContractNetError::invalid("workers and subtasks must be positive"));
    }
    if args.deadline_ms == 0 {
        return Err(ContractNetError::invalid("deadline must be positive"));
    }
    if let Some(strategy) = args.strategy {
        config.award.strategy = strategy;
    }
    config.coordinator.bidding_window_ms = args.deadline_ms;
    config.coordinator.award_grace_ms = (args.deadline_ms / 5).max(10);

    let seed = args.seed.unwrap_or_else(rand::random);
    info!(
        workers = args.workers,
        subtasks = args.subtasks,
        deadline_ms = args.deadline_ms,
        strategy = %config.award.strategy,
        seed,
        "Starting simulation"
    );

    let coordinator_config = config.coordinator.clone();
    let protocol = Arc::new(ContractNetProtocol::new(config)?);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::with_collaborators(
        protocol.clone(),
        coordinator_config,
        Arc::new(SplitDecomposer {
            count: args.subtasks,
        }),
        Arc::new(ChannelDispatch { tx }),
    )?;

    let workers: Vec<AgentId> = (0..args.workers).map(|_| Uuid::new_v4()).collect();
    let bidders = spawn_bidders(&protocol, workers, StdRng::seed_from_u64(seed));

    let requester = Uuid::new_v4();
    let task_id = coordinator.coordinate_task(Task::new("construct"), requester)?;

    // Executions and the wait for a terminal state run side by side
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let wait = Duration::from_millis(args.deadline_ms * 4 + 2_000);
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if coordinator.task(&task_id).map_or(true, |t| settled(&t)) {
            break;
        }
        tokio::select! {
            Some(assignment) = rx.recv() => {
                let step = Duration::from_millis(rng.gen_range(5..40));
                let success = rng.gen_bool(0.9);
                tokio::spawn(execute(coordinator.clone(), assignment, step, success));
            }
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = tokio::time::sleep_until(deadline) => {
                warn!(task_id = %task_id, "Simulation timed out before the task finished");
                break;
            }
        }
    }

    bidders.abort();
    let record = coordinator.task(&task_id);
    let stats = protocol.statistics();
    coordinator.shutdown();
    protocol.shutdown();

    let Some(record) = record else {
        return Err(ContractNetError::invalid(format!("task {task_id} disappeared")));
    };
    Ok(summarize(&protocol, &record, stats.selector.selections_made, stats.selector.conflicts_resolved))
}

/// Finished, or executing with nothing left running
fn settled(task: &CoordinatedTask) -> bool {
    task.state().is_terminal()
        || (task.state() == CoordinationState::Executing
            && task.subtasks().iter().all(|s| !s.is_outstanding()))
}

/// Every worker bids on every announcement with random fitness
fn spawn_bidders(
    protocol: &Arc<ContractNetProtocol>,
    workers: Vec<AgentId>,
    mut rng: StdRng,
) -> tokio::task::JoinHandle<()> {
    let mut rx = protocol.subscribe();
    let protocol = protocol.clone();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let ProtocolEvent::TaskAnnounced { announcement } = event else {
                continue;
            };
            for worker in &workers {
                let params = BidParams::new(
                    announcement.id(),
                    *worker,
                    rng.gen_range(0.1..=1.0),
                    Duration::from_secs(rng.gen_range(1..=20)),
                    rng.gen_range(0.5..=1.0),
                )
                .distance(rng.gen_range(0.0..100.0))
                .current_load(rng.gen_range(0.0..=1.0))
                .cost(rng.gen_range(1.0..50.0));

                match Bid::new(params) {
                    Ok(bid) => {
                        protocol.submit_bid(bid);
                    }
                    Err(e) => debug!(worker = %worker, error = %e, "Simulated bid rejected"),
                }
            }
        }
    })
}

async fn execute(coordinator: Coordinator, assignment: Assignment, step: Duration, success: bool) {
    let Assignment { worker, subtask_id } = assignment;
    let tracker = coordinator
        .tasks()
        .iter()
        .find_map(|t| t.subtask(&subtask_id).and_then(|s| s.announcement_id.clone()))
        .and_then(|id| coordinator.protocol().progress_for_announcement(&id));

    if let Some(tracker) = &tracker {
        if let Err(e) = tracker.start() {
            debug!(subtask_id = %subtask_id, error = %e, "Tracker refused start");
        }
        for (name, pct) in CHECKPOINTS {
            tokio::time::sleep(step).await;
            if let Ok(checkpoint) = Checkpoint::new(name, pct) {
                tracker.add_checkpoint(checkpoint);
            }
        }
    }
    tokio::time::sleep(step).await;

    let result = if success {
        format!("done by {}", short_id(worker))
    } else {
        "worker gave up".to_string()
    };
    coordinator.handle_task_report(&subtask_id, success, &result);
}

fn summarize(
    protocol: &ContractNetProtocol,
    record: &CoordinatedTask,
    selections: u64,
    conflicts: u64,
) -> SimulationSummary {
    let bid_counts: HashMap<String, usize> = record
        .subtasks()
        .iter()
        .filter_map(|s| s.announcement_id.clone())
        .map(|id| {
            let count = protocol
                .manager()
                .negotiation(&id)
                .map_or(0, |n| n.bid_count());
            (id, count)
        })
        .collect();

    let subtasks = record
        .subtasks()
        .iter()
        .map(|s| {
            let outcome = if s.complete {
                "completed"
            } else if s.failed {
                "failed"
            } else if s.assigned_agent.is_some() {
                "running"
            } else {
                "unassigned"
            };
            SubtaskRow {
                subtask: s.subtask_id.clone(),
                worker: s.assigned_agent.map(short_id).unwrap_or_else(|| "-".to_string()),
                bids: s
                    .announcement_id
                    .as_ref()
                    .and_then(|id| bid_counts.get(id).copied())
                    .unwrap_or(0),
                outcome: outcome.to_string(),
                result: s.result.clone().unwrap_or_default(),
            }
        })
        .collect();

    SimulationSummary {
        task_id: record.task_id().to_string(),
        state: record.state().to_string(),
        progress: record.progress(),
        subtasks,
        selections,
        conflicts_resolved: conflicts,
    }
}

pub fn print_summary(summary: &SimulationSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{}", Table::new(&summary.subtasks));
    println!(
        "task {} {} ({:.0}% complete), {} selections, {} ties resolved",
        summary.task_id,
        summary.state,
        summary.progress * 100.0,
        summary.selections,
        summary.conflicts_resolved
    );
    Ok(())
}

fn short_id(id: AgentId) -> String {
    id.simple().to_string()[..8].to_string()
}
