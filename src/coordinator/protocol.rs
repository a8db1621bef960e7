//! Contract Net facade.
//!
//! Wires the negotiation manager, the timed bid collector and the award selector into one
//! announce → bid → award → track flow, and owns the progress trackers of awarded work.
//! The manager is authoritative; the collector is kept in step with it:
//!
//! - a collection that times out with no bids expires its negotiation
//! - every award creates a `TaskProgress` keyed `task_<announcement id>`

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
use tracing::{debug, info, warn};

use super::collaborators::EventPublisher;
use crate::award::{AwardSelector, ConflictResolver, Resolution, ResolverStats, SelectorStats};
use crate::config::AppConfig;
use crate::domain::{AgentId, Announcement, AnnouncementParams, Bid, Requirements, Task};
use crate::error::{ContractNetError, Result};
use crate::events::{EventHub, Listener, ListenerId};
use crate::negotiation::{
    BidCollector, CollectionEvent, CollectorStats, ContractEvent, ContractState, NegotiationManager,
};
use crate::progress::{ProgressEvent, TaskProgress};

/// Events emitted by the [`ContractNetProtocol`]
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    TaskAnnounced {
        announcement: Announcement,
    },
    BidSubmitted {
        announcement_id: String,
        bidder: AgentId,
    },
    ContractAwarded {
        announcement_id: String,
        task_id: String,
        winner: AgentId,
    },
    ProgressUpdated {
        task_id: String,
        percentage: f64,
    },
    TaskCompleted {
        task_id: String,
        success: bool,
    },
}

/// Entries evicted by one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub negotiations: usize,
    pub collections: usize,
    pub progress: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStats {
    pub negotiations: usize,
    pub active_negotiations: usize,
    pub tracked_tasks: usize,
    pub active_tasks: usize,
    pub collector: CollectorStats,
    pub selector: SelectorStats,
    pub resolver: ResolverStats,
}

/// Progress tracker id for an announcement
pub fn progress_task_id(announcement_id: &str) -> String {
    format!("task_{announcement_id}")
}

type ProgressMap = DashMap<String, Arc<TaskProgress>>;

pub struct ContractNetProtocol {
    config: AppConfig,
    manager: Arc<NegotiationManager>,
    collector: BidCollector,
    selector: Arc<AwardSelector>,
    progress: Arc<ProgressMap>,
    publisher: Option<Arc<dyn EventPublisher>>,
    events: Arc<EventHub<ProtocolEvent>>,
    running: Arc<AtomicBool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ContractNetProtocol {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate().map_err(ContractNetError::InvalidConfig)?;

        let resolver = Arc::new(ConflictResolver::new(config.award.strategy));
        let selector = Arc::new(AwardSelector::with_resolver(
            config.award.weights.clone(),
            config.award.tie_epsilon,
            resolver,
        )?);
        let manager = Arc::new(NegotiationManager::new(&config.negotiation));
        let collector = BidCollector::new();
        let progress: Arc<ProgressMap> = Arc::new(DashMap::new());
        let events = Arc::new(EventHub::new("protocol"));

        // Zero-bid timeouts expire the negotiation
        {
            let manager = manager.clone();
            collector.add_listener(move |event: &CollectionEvent| -> anyhow::Result<()> {
                if let CollectionEvent::TimedOut {
                    announcement_id,
                    bids,
                } = event
                {
                    if bids.is_empty() {
                        manager.close_negotiation(announcement_id, ContractState::Expired);
                    }
                }
                Ok(())
            });
        }

        // Every award gets a progress tracker
        {
            let progress = progress.clone();
            let events = events.clone();
            manager.add_listener(move |event: &ContractEvent| -> anyhow::Result<()> {
                if let ContractEvent::ContractAwarded {
                    announcement_id,
                    winner,
                } = event
                {
                    let task_id = progress_task_id(announcement_id);
                    let tracker = Arc::new(TaskProgress::new(
                        task_id.clone(),
                        announcement_id.clone(),
                        winner.bidder_id(),
                    ));
                    forward_progress(&tracker, events.clone());
                    progress.insert(task_id.clone(), tracker);

                    events.emit(ProtocolEvent::ContractAwarded {
                        announcement_id: announcement_id.clone(),
                        task_id,
                        winner: winner.bidder_id(),
                    });
                }
                Ok(())
            });
        }

        info!(
            strategy = %config.award.strategy,
            tie_epsilon = config.award.tie_epsilon,
            "Contract net protocol initialized"
        );

        Ok(Self {
            config,
            manager,
            collector,
            selector,
            progress,
            publisher: None,
            events,
            running: Arc::new(AtomicBool::new(true)),
            maintenance: Mutex::new(None),
        })
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<NegotiationManager> {
        &self.manager
    }

    pub fn collector(&self) -> &BidCollector {
        &self.collector
    }

    pub fn selector(&self) -> &Arc<AwardSelector> {
        &self.selector
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Announce with the configured default deadline and no requirements
    pub fn announce_task(&self, task: Task, requester_id: AgentId, deadline: Option<Duration>) -> Result<String> {
        let announcement = self.announce_task_with(AnnouncementParams {
            task,
            requester_id,
            deadline_in: deadline.unwrap_or_else(|| self.config.negotiation.default_deadline()),
            requirements: Requirements::default(),
        })?;
        Ok(announcement.id().to_string())
    }

    /// Open a negotiation and its timed collection. Requires a tokio runtime for the timeout.
    pub fn announce_task_with(&self, params: AnnouncementParams) -> Result<Announcement> {
        if !self.is_running() {
            return Err(ContractNetError::NotRunning);
        }
        Handle::try_current()
            .map_err(|_| ContractNetError::NoRuntime("bid collection timeout".to_string()))?;

        let deadline_in = params.deadline_in;
        let announcement = Announcement::new(params)?;
        self.register(&announcement, deadline_in)?;
        let id = announcement.id().to_string();

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish_announcement(&announcement) {
                warn!(announcement_id = %id, error = %e, "Failed to publish announcement");
            }
        }

        self.events.emit(ProtocolEvent::TaskAnnounced {
            announcement: announcement.clone(),
        });
        Ok(announcement)
    }

    /// Open the collection and negotiation for a fresh announcement. An id that is already
    /// collecting or negotiating is refused so the existing negotiation survives.
    fn register(&self, announcement: &Announcement, deadline_in: Duration) -> Result<()> {
        let id = announcement.id();
        if self.manager.negotiation(id).is_some() {
            return Err(ContractNetError::invalid(format!(
                "announcement id {id} is already negotiating"
            )));
        }
        if !self.collector.start_collection(id, deadline_in)? {
            return Err(ContractNetError::invalid(format!(
                "announcement id {id} is already collecting"
            )));
        }
        self.manager.open(announcement.clone());
        Ok(())
    }

    /// Submit to the negotiation; accepted bids are mirrored into the collection.
    ///
    /// Once the collection window has passed, a late bid is refused here when bids are
    /// already recorded, so it cannot expire a negotiation that is waiting to be awarded.
    pub fn submit_bid(&self, bid: Bid) -> bool {
        let announcement_id = bid.announcement_id().to_string();
        let bidder = bid.bidder_id();

        if self.awaiting_award(&announcement_id, Utc::now()) {
            debug!(announcement_id = %announcement_id, bidder = %bidder, "Late bid refused, awaiting award");
            return false;
        }
        if !self.manager.submit_bid(bid.clone()) {
            return false;
        }
        if !self.collector.receive_bid(bid) {
            debug!(announcement_id = %announcement_id, bidder = %bidder, "Collection did not take bid");
        }

        self.events.emit(ProtocolEvent::BidSubmitted {
            announcement_id,
            bidder,
        });
        true
    }

    pub fn bids(&self, announcement_id: &str) -> Vec<Bid> {
        self.manager.bids(announcement_id)
    }

    /// Collection window over with bids on record and the negotiation still open
    fn awaiting_award(&self, announcement_id: &str, now: DateTime<Utc>) -> bool {
        let Some(collection) = self.collector.collection(announcement_id) else {
            return false;
        };
        if collection.is_open() && now < collection.deadline() {
            return false;
        }
        self.manager
            .negotiation(announcement_id)
            .is_some_and(|n| n.is_open() && n.bid_count() > 0)
    }

    /// Close collection, score the bids and award the winner.
    /// Without bids the negotiation expires.
    pub fn select_winner(&self, announcement_id: &str) -> Option<Bid> {
        let negotiation = self.manager.negotiation(announcement_id)?;
        if !negotiation.is_open() {
            debug!(announcement_id, state = %negotiation.state(), "Selection skipped, negotiation closed");
            return None;
        }

        self.collector.close_collection(announcement_id);

        let bids = self.manager.bids(announcement_id);
        if bids.is_empty() {
            info!(announcement_id, "No bids received");
            self.manager
                .close_negotiation(announcement_id, ContractState::Expired);
            self.collector
                .cancel_collection(announcement_id, "no bids received");
            return None;
        }

        let winner = self.selector.select_best_bid(&bids)?;
        if !self.manager.award_contract(announcement_id, &winner) {
            return None;
        }
        self.collector
            .mark_completed(announcement_id, winner.bidder_id());
        Some(winner)
    }

    pub fn progress(&self, task_id: &str) -> Option<Arc<TaskProgress>> {
        self.progress.get(task_id).map(|e| e.value().clone())
    }

    pub fn progress_for_announcement(&self, announcement_id: &str) -> Option<Arc<TaskProgress>> {
        self.progress(&progress_task_id(announcement_id))
    }

    pub fn update_progress(&self, task_id: &str, percentage: f64) -> bool {
        match self.progress(task_id) {
            Some(p) => p.set_completion_percentage(percentage),
            None => {
                warn!(task_id, "Progress update for unknown task");
                false
            }
        }
    }

    /// Finish tracked work: terminal progress status, performance ledger entry and contract
    /// completion. `false` if unknown or already finished.
    pub fn record_completion(&self, task_id: &str, success: bool, detail: &str) -> bool {
        let Some(progress) = self.progress(task_id) else {
            warn!(task_id, "Completion for unknown task");
            return false;
        };

        let finished = if success {
            progress.mark_completed(detail)
        } else {
            progress.mark_failed(detail)
        };
        if !finished {
            return false;
        }

        let duration = progress.execution_time().unwrap_or(Duration::ZERO);
        self.selector
            .resolver()
            .record_task_completion(progress.worker_id(), success, duration);
        self.manager
            .complete_contract(progress.announcement_id(), success);
        true
    }

    /// Break a tie with the configured strategy
    pub fn handle_conflict(&self, tied: &[Bid]) -> Option<Resolution> {
        self.selector.resolver().resolve_detailed(tied)
    }

    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(Utc::now())
    }

    pub fn run_maintenance_at(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let report = MaintenanceReport {
            negotiations: self.manager.cleanup_at(now),
            collections: self
                .collector
                .cleanup_at(now, self.config.collection.max_age()),
            progress: cleanup_progress(&self.progress, now, self.config.progress.retention()),
        };
        if report != MaintenanceReport::default() {
            debug!(?report, "Maintenance pass");
        }
        report
    }

    /// Spawn the periodic cleanup loop; a no-op if one is already running
    pub fn start_maintenance(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| ContractNetError::NoRuntime("maintenance loop".to_string()))?;
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return Ok(());
        }

        let m = &self.config.maintenance;
        let negotiation_every = Duration::from_secs(m.negotiation_cleanup_secs);
        let collection_every = Duration::from_secs(m.collection_cleanup_secs);
        let progress_every = Duration::from_secs(m.progress_cleanup_secs);
        let max_age = self.config.collection.max_age();
        let retention = self.config.progress.retention();

        let manager = self.manager.clone();
        let collector = self.collector.clone();
        let progress = self.progress.clone();
        let running = self.running.clone();

        *slot = Some(runtime.spawn(async move {
            let mut negotiations = tokio::time::interval(negotiation_every);
            let mut collections = tokio::time::interval(collection_every);
            let mut trackers = tokio::time::interval(progress_every);

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = negotiations.tick() => {
                        manager.cleanup();
                    }
                    _ = collections.tick() => {
                        collector.cleanup(max_age);
                    }
                    _ = trackers.tick() => {
                        cleanup_progress(&progress, Utc::now(), retention);
                    }
                }
            }
            info!("Maintenance loop stopped");
        }));

        info!("Maintenance loop started");
        Ok(())
    }

    pub fn statistics(&self) -> ProtocolStats {
        ProtocolStats {
            negotiations: self.manager.len(),
            active_negotiations: self.manager.active_count(),
            tracked_tasks: self.progress.len(),
            active_tasks: self
                .progress
                .iter()
                .filter(|e| e.value().is_active())
                .count(),
            collector: self.collector.statistics(),
            selector: self.selector.statistics(),
            resolver: self.selector.resolver().statistics(),
        }
    }

    /// Stop maintenance and abort pending collection timeouts
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.collector.shutdown();
        info!("Contract net protocol shut down");
    }

    pub fn add_listener(&self, listener: impl Listener<ProtocolEvent> + 'static) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}

impl Drop for ContractNetProtocol {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }
}

fn forward_progress(tracker: &TaskProgress, events: Arc<EventHub<ProtocolEvent>>) {
    tracker.add_listener(move |event: &ProgressEvent| -> anyhow::Result<()> {
        match event {
            ProgressEvent::ProgressUpdated { task_id, to, .. } => {
                events.emit(ProtocolEvent::ProgressUpdated {
                    task_id: task_id.clone(),
                    percentage: *to,
                });
            }
            ProgressEvent::TaskCompleted {
                task_id, success, ..
            } => {
                events.emit(ProtocolEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    success: *success,
                });
            }
            _ => {}
        }
        Ok(())
    });
}

fn cleanup_progress(progress: &ProgressMap, now: DateTime<Utc>, retention: Duration) -> usize {
    let before = progress.len();
    progress.retain(|_, p| {
        p.age_since_completion(now)
            .map_or(true, |age| age <= retention)
    });
    let removed = before.saturating_sub(progress.len());
    if removed > 0 {
        debug!(removed, "Progress trackers cleaned up");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::collaborators::MockEventPublisher;
    use crate::domain::BidParams;
    use crate::progress::TaskStatus;
    use uuid::Uuid;

    fn protocol() -> ContractNetProtocol {
        ContractNetProtocol::new(AppConfig::default()).unwrap()
    }

    fn bid(announcement_id: &str, bidder: AgentId, score: f64, ms: u64, conf: f64) -> Bid {
        Bid::new(BidParams::new(
            announcement_id,
            bidder,
            score,
            Duration::from_millis(ms),
            conf,
        ))
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.award.weights.price = 0.5;
        assert!(matches!(
            ContractNetProtocol::new(config),
            Err(ContractNetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn announce_needs_runtime() {
        let p = protocol();
        let err = p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .unwrap_err();
        assert!(matches!(err, ContractNetError::NoRuntime(_)));
        assert!(p.manager().is_empty());
    }

    #[tokio::test]
    async fn full_round_creates_progress_and_feeds_ledger() {
        let p = protocol();
        let id = p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(p.submit_bid(bid(&id, a, 0.8, 5000, 0.9)));
        assert!(p.submit_bid(bid(&id, b, 0.6, 2000, 0.95)));
        assert!(!p.submit_bid(bid(&id, b, 0.9, 2000, 0.95)));
        assert_eq!(p.collector().bids(&id).len(), 2);

        let winner = p.select_winner(&id).unwrap();
        assert_eq!(winner.bidder_id(), b);
        assert!(p.select_winner(&id).is_none());

        let task_id = progress_task_id(&id);
        let tracker = p.progress(&task_id).unwrap();
        assert_eq!(tracker.worker_id(), b);
        assert_eq!(tracker.status(), TaskStatus::Assigned);
        assert_eq!(
            p.collector().collection(&id).unwrap().winner_id(),
            Some(b)
        );

        assert!(p.update_progress(&task_id, 40.0));
        assert!(p.record_completion(&task_id, true, "16 blocks mined"));
        assert!(!p.record_completion(&task_id, false, "too late"));

        assert_eq!(
            p.manager().negotiation(&id).unwrap().state(),
            ContractState::Completed
        );
        assert!(p.selector().resolver().ledger().has_history(b));

        let stats = p.statistics();
        assert_eq!(stats.tracked_tasks, 1);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.selector.selections_made, 1);
    }

    #[tokio::test]
    async fn no_bids_expires_negotiation() {
        let p = protocol();
        let id = p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .unwrap();
        assert!(p.select_winner(&id).is_none());
        assert_eq!(
            p.manager().negotiation(&id).unwrap().state(),
            ContractState::Expired
        );
    }

    #[tokio::test]
    async fn zero_bid_timeout_expires_negotiation() {
        let p = protocol();
        let id = p
            .announce_task(
                Task::new("mine"),
                Uuid::new_v4(),
                Some(Duration::from_millis(40)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            p.manager().negotiation(&id).unwrap().state(),
            ContractState::Expired
        );
    }

    #[tokio::test]
    async fn late_bid_cannot_expire_awaiting_negotiation() {
        let p = protocol();
        let id = p
            .announce_task(
                Task::new("mine"),
                Uuid::new_v4(),
                Some(Duration::from_millis(50)),
            )
            .unwrap();
        let early = Uuid::new_v4();
        assert!(p.submit_bid(bid(&id, early, 0.7, 1000, 0.9)));

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!p.submit_bid(bid(&id, Uuid::new_v4(), 0.9, 1000, 0.9)));
        let negotiation = p.manager().negotiation(&id).unwrap();
        assert_eq!(negotiation.state(), ContractState::Announced);
        assert_eq!(negotiation.bid_count(), 1);

        let winner = p.select_winner(&id).unwrap();
        assert_eq!(winner.bidder_id(), early);
        assert_eq!(
            p.manager().negotiation(&id).unwrap().state(),
            ContractState::Awarded
        );
    }

    #[tokio::test]
    async fn reused_announcement_id_is_refused() {
        let p = protocol();
        let announcement = Announcement::new(AnnouncementParams {
            task: Task::new("mine"),
            requester_id: Uuid::new_v4(),
            deadline_in: Duration::from_secs(5),
            requirements: Requirements::default(),
        })
        .unwrap();
        let id = announcement.id().to_string();

        p.register(&announcement, Duration::from_secs(5)).unwrap();
        assert!(p.submit_bid(bid(&id, Uuid::new_v4(), 0.7, 1000, 0.9)));

        assert!(matches!(
            p.register(&announcement, Duration::from_secs(5)),
            Err(ContractNetError::InvalidInput(_))
        ));
        assert_eq!(p.manager().negotiation(&id).unwrap().bid_count(), 1);
    }

    #[tokio::test]
    async fn publisher_failure_does_not_block_announce() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish_announcement()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("bus offline")));

        let p = protocol().with_publisher(Arc::new(publisher));
        assert!(p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .is_ok());
    }

    #[tokio::test]
    async fn maintenance_evicts_finished_progress() {
        let p = protocol();
        let id = p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .unwrap();
        p.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5));
        p.select_winner(&id).unwrap();
        p.record_completion(&progress_task_id(&id), false, "stuck");

        assert_eq!(p.run_maintenance(), MaintenanceReport::default());

        let later = Utc::now() + chrono::Duration::seconds(301);
        let report = p.run_maintenance_at(later);
        assert_eq!(report.negotiations, 1);
        assert_eq!(report.collections, 1);
        assert_eq!(report.progress, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_announcements() {
        let p = protocol();
        p.start_maintenance().unwrap();
        p.shutdown();
        assert!(!p.is_running());
        assert!(matches!(
            p.announce_task(Task::new("mine"), Uuid::new_v4(), None),
            Err(ContractNetError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let p = protocol();
        let mut rx = p.subscribe();
        let id = p
            .announce_task(Task::new("mine"), Uuid::new_v4(), None)
            .unwrap();
        p.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5));
        p.select_winner(&id).unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                ProtocolEvent::TaskAnnounced { .. } => "announced",
                ProtocolEvent::BidSubmitted { .. } => "bid",
                ProtocolEvent::ContractAwarded { .. } => "awarded",
                ProtocolEvent::ProgressUpdated { .. } => "progress",
                ProtocolEvent::TaskCompleted { .. } => "completed",
            });
        }
        assert_eq!(kinds, vec!["announced", "bid", "awarded"]);
    }

    #[tokio::test]
    async fn conflict_handling_uses_configured_strategy() {
        let p = protocol();
        let low = Bid::new(
            BidParams::new("announce_x", Uuid::from_u128(1), 0.5, Duration::from_secs(1), 0.5)
                .current_load(0.1),
        )
        .unwrap();
        let high = Bid::new(
            BidParams::new("announce_x", Uuid::from_u128(2), 0.5, Duration::from_secs(1), 0.5)
                .current_load(0.8),
        )
        .unwrap();

        let resolution = p.handle_conflict(&[high, low]).unwrap();
        assert_eq!(resolution.selected.bidder_id(), Uuid::from_u128(1));
    }
}
