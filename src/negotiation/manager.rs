//! Authoritative negotiation state per announcement.
//!
//! Every read-modify-write of a negotiation happens under the manager's write lock; reads
//! clone the stored `Arc<Negotiation>` and never block on writers. Listener callbacks run
//! after the lock has been released.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::record::Negotiation;
use super::state::ContractState;
use crate::config::NegotiationConfig;
use crate::domain::{AgentId, Announcement, AnnouncementParams, Bid, Requirements, Task};
use crate::error::Result;
use crate::events::{EventHub, Listener, ListenerId};

/// Events emitted by the [`NegotiationManager`]
#[derive(Debug, Clone)]
pub enum ContractEvent {
    /// A new announcement is open for bids
    Announced { announcement: Announcement },
    /// A bid was accepted
    BidSubmitted { announcement_id: String, bid: Bid },
    /// A winner was bound to the announcement
    ContractAwarded {
        announcement_id: String,
        winner: Bid,
    },
    /// Deadline elapsed, or no bids existed at award time
    NegotiationExpired {
        announcement_id: String,
        bid_count: usize,
    },
    /// Closed explicitly into a terminal state other than expired
    NegotiationClosed {
        announcement_id: String,
        state: ContractState,
    },
    /// Awarded work reported back as finished
    ContractFinished {
        announcement_id: String,
        worker: AgentId,
        success: bool,
    },
}

pub struct NegotiationManager {
    negotiations: DashMap<String, Arc<Negotiation>>,
    write_lock: Mutex<()>,
    retention: Duration,
    events: EventHub<ContractEvent>,
}

impl NegotiationManager {
    pub fn new(config: &NegotiationConfig) -> Self {
        Self::with_retention(config.retention())
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            negotiations: DashMap::new(),
            write_lock: Mutex::new(()),
            retention,
            events: EventHub::new("negotiation"),
        }
    }

    /// Open a negotiation for `task`, returning the announcement id
    pub fn announce(&self, task: Task, requester_id: AgentId, deadline: Duration) -> Result<String> {
        let announcement = self.announce_with(AnnouncementParams {
            task,
            requester_id,
            deadline_in: deadline,
            requirements: Requirements::default(),
        })?;
        Ok(announcement.id().to_string())
    }

    /// Open a negotiation with eligibility requirements attached
    pub fn announce_with(&self, params: AnnouncementParams) -> Result<Announcement> {
        let announcement = Announcement::new(params)?;
        self.open(announcement.clone());
        Ok(announcement)
    }

    /// Register an announcement built elsewhere
    pub fn open(&self, announcement: Announcement) {
        let id = announcement.id().to_string();
        {
            let _guard = self.write_lock.lock();
            self.negotiations
                .insert(id.clone(), Arc::new(Negotiation::new(announcement.clone())));
        }

        info!(
            announcement_id = %id,
            action = %announcement.task().action,
            requester = %announcement.requester_id(),
            deadline = %announcement.deadline(),
            "Task announced"
        );
        self.events.emit(ContractEvent::Announced { announcement });
    }

    pub fn submit_bid(&self, bid: Bid) -> bool {
        self.submit_bid_at(bid, Utc::now())
    }

    /// Record `bid` if its negotiation is open, unexpired at `now`, and has no bid from the
    /// same bidder. Expiry discovered here closes the negotiation as `Expired`.
    pub fn submit_bid_at(&self, bid: Bid, now: DateTime<Utc>) -> bool {
        let id = bid.announcement_id().to_string();
        let bidder = bid.bidder_id();

        let event = {
            let _guard = self.write_lock.lock();
            let Some(current) = self.snapshot(&id) else {
                warn!(announcement_id = %id, bidder = %bidder, "Bid for unknown announcement");
                return false;
            };

            if !current.is_open() {
                warn!(
                    announcement_id = %id,
                    bidder = %bidder,
                    state = %current.state(),
                    "Bid rejected, negotiation closed"
                );
                return false;
            }

            if current.announcement().is_expired_at(now) {
                match current.with_state(ContractState::Expired, now) {
                    Ok(expired) => {
                        self.negotiations.insert(id.clone(), Arc::new(expired));
                    }
                    Err(e) => {
                        warn!(announcement_id = %id, error = %e, "Failed to expire negotiation");
                        return false;
                    }
                }
                warn!(announcement_id = %id, bidder = %bidder, "Bid rejected, deadline passed");
                ContractEvent::NegotiationExpired {
                    announcement_id: id.clone(),
                    bid_count: current.bid_count(),
                }
            } else if current.has_bid_from(bidder) {
                warn!(announcement_id = %id, bidder = %bidder, "Duplicate bid rejected");
                return false;
            } else {
                self.negotiations
                    .insert(id.clone(), Arc::new(current.with_bid(bid.clone())));
                info!(
                    announcement_id = %id,
                    bidder = %bidder,
                    value = bid.value(),
                    "Bid accepted"
                );
                ContractEvent::BidSubmitted {
                    announcement_id: id.clone(),
                    bid,
                }
            }
        };

        let accepted = matches!(event, ContractEvent::BidSubmitted { .. });
        self.events.emit(event);
        accepted
    }

    /// Snapshot of the bids recorded for an announcement
    pub fn bids(&self, announcement_id: &str) -> Vec<Bid> {
        self.snapshot(announcement_id)
            .map(|n| n.bids().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest ranked bid by value, then shorter time, then lower bidder id
    pub fn select_winner(&self, announcement_id: &str) -> Option<Bid> {
        let negotiation = self.snapshot(announcement_id)?;
        Bid::best(negotiation.bids()).cloned()
    }

    /// Bind `winner` to the announcement. Fails if the negotiation is missing, closed, or
    /// does not hold this bid.
    pub fn award_contract(&self, announcement_id: &str, winner: &Bid) -> bool {
        let now = Utc::now();
        {
            let _guard = self.write_lock.lock();
            let Some(current) = self.snapshot(announcement_id) else {
                warn!(announcement_id, "Award for unknown announcement");
                return false;
            };

            if !current.is_open() {
                warn!(
                    announcement_id,
                    state = %current.state(),
                    "Award refused, negotiation closed"
                );
                return false;
            }

            if !current.contains(winner) {
                warn!(
                    announcement_id,
                    bidder = %winner.bidder_id(),
                    "Award refused, bid not recorded"
                );
                return false;
            }

            // Use the stored bid, not the caller's copy
            let stored = current
                .bid_from(winner.bidder_id())
                .cloned()
                .unwrap_or_else(|| winner.clone());
            match current.with_winning_bid(stored, now) {
                Ok(next) => {
                    self.negotiations
                        .insert(announcement_id.to_string(), Arc::new(next));
                }
                Err(e) => {
                    warn!(announcement_id, error = %e, "Award refused");
                    return false;
                }
            }
        }

        info!(
            announcement_id,
            winner = %winner.bidder_id(),
            value = winner.value(),
            "Contract awarded"
        );
        self.events.emit(ContractEvent::ContractAwarded {
            announcement_id: announcement_id.to_string(),
            winner: winner.clone(),
        });
        true
    }

    /// Select and award in one step. With no bids the negotiation is closed as expired.
    pub fn award_to_best_bidder(&self, announcement_id: &str) -> Option<Bid> {
        let negotiation = self.snapshot(announcement_id)?;
        if !negotiation.is_open() {
            return None;
        }

        match self.select_winner(announcement_id) {
            Some(winner) if self.award_contract(announcement_id, &winner) => Some(winner),
            Some(_) => None,
            None => {
                self.close_negotiation(announcement_id, ContractState::Expired);
                None
            }
        }
    }

    /// Close an open negotiation into a terminal state. No-op if it is already closed.
    pub fn close_negotiation(&self, announcement_id: &str, state: ContractState) -> bool {
        if !state.is_terminal() {
            warn!(announcement_id, %state, "Close requested with non-terminal state");
            return false;
        }

        let bid_count = {
            let _guard = self.write_lock.lock();
            let Some(current) = self.snapshot(announcement_id) else {
                return false;
            };
            if !current.is_open() {
                debug!(announcement_id, state = %current.state(), "Negotiation already closed");
                return false;
            }
            match current.with_state(state, Utc::now()) {
                Ok(next) => {
                    self.negotiations
                        .insert(announcement_id.to_string(), Arc::new(next));
                }
                Err(e) => {
                    warn!(announcement_id, error = %e, "Close refused");
                    return false;
                }
            }
            current.bid_count()
        };

        info!(announcement_id, %state, bid_count, "Negotiation closed");
        let event = if state == ContractState::Expired {
            ContractEvent::NegotiationExpired {
                announcement_id: announcement_id.to_string(),
                bid_count,
            }
        } else {
            ContractEvent::NegotiationClosed {
                announcement_id: announcement_id.to_string(),
                state,
            }
        };
        self.events.emit(event);
        true
    }

    /// Finish an awarded contract as completed or failed
    pub fn complete_contract(&self, announcement_id: &str, success: bool) -> bool {
        let target = if success {
            ContractState::Completed
        } else {
            ContractState::Failed
        };

        let worker = {
            let _guard = self.write_lock.lock();
            let Some(current) = self.snapshot(announcement_id) else {
                return false;
            };
            if current.state() != ContractState::Awarded {
                warn!(
                    announcement_id,
                    state = %current.state(),
                    "Completion refused, contract not awarded"
                );
                return false;
            }
            let Ok(next) = current.with_state(target, Utc::now()) else {
                return false;
            };
            self.negotiations
                .insert(announcement_id.to_string(), Arc::new(next));
            current.awarded_to()
        };

        let Some(worker) = worker else {
            return false;
        };
        info!(announcement_id, worker = %worker, success, "Contract finished");
        self.events.emit(ContractEvent::ContractFinished {
            announcement_id: announcement_id.to_string(),
            worker,
            success,
        });
        true
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    /// Evict terminal negotiations closed longer than the retention window ago, and open
    /// negotiations whose deadline passed without anyone closing them.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let _guard = self.write_lock.lock();
        let before = self.negotiations.len();
        let retention = self.retention;

        self.negotiations.retain(|_, n| {
            if n.state().is_terminal() {
                n.age(now) <= retention
            } else if n.is_open() {
                !n.announcement().is_expired_at(now)
            } else {
                true
            }
        });

        let removed = before.saturating_sub(self.negotiations.len());
        if removed > 0 {
            debug!(removed, remaining = self.negotiations.len(), "Negotiations cleaned up");
        }
        removed
    }

    pub fn negotiation(&self, announcement_id: &str) -> Option<Arc<Negotiation>> {
        self.snapshot(announcement_id)
    }

    pub fn negotiations(&self) -> Vec<Arc<Negotiation>> {
        self.negotiations.iter().map(|e| e.value().clone()).collect()
    }

    /// Negotiations that are open or awarded
    pub fn active_count(&self) -> usize {
        self.negotiations
            .iter()
            .filter(|e| e.value().state().is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.negotiations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.negotiations.is_empty()
    }

    pub fn add_listener(&self, listener: impl Listener<ContractEvent> + 'static) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContractEvent> {
        self.events.subscribe()
    }

    fn snapshot(&self, announcement_id: &str) -> Option<Arc<Negotiation>> {
        self.negotiations
            .get(announcement_id)
            .map(|e| e.value().clone())
    }
}

impl Default for NegotiationManager {
    fn default() -> Self {
        Self::new(&NegotiationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BidParams;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

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

    fn announce(manager: &NegotiationManager, deadline: Duration) -> String {
        manager
            .announce(Task::new("collect"), Uuid::new_v4(), deadline)
            .unwrap()
    }

    #[test]
    fn duplicate_bid_is_rejected() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        let bidder = Uuid::new_v4();

        assert!(manager.submit_bid(bid(&id, bidder, 0.5, 1000, 0.5)));
        assert!(!manager.submit_bid(bid(&id, bidder, 0.9, 500, 0.9)));
        assert_eq!(manager.bids(&id).len(), 1);
        assert_eq!(manager.bids(&id)[0].score(), 0.5);
    }

    #[test]
    fn bid_for_unknown_announcement_is_rejected() {
        let manager = NegotiationManager::default();
        assert!(!manager.submit_bid(bid("announce_missing", Uuid::new_v4(), 0.5, 1000, 0.5)));
    }

    #[test]
    fn late_bid_expires_negotiation() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        let later = Utc::now() + chrono::Duration::seconds(31);

        assert!(!manager.submit_bid_at(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5), later));
        assert_eq!(
            manager.negotiation(&id).unwrap().state(),
            ContractState::Expired
        );
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn bid_after_close_is_rejected() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));

        assert!(manager.close_negotiation(&id, ContractState::Failed));
        assert!(!manager.close_negotiation(&id, ContractState::Expired));
        assert!(!manager.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5)));
        assert_eq!(manager.negotiation(&id).unwrap().state(), ContractState::Failed);
    }

    #[test]
    fn example_scenario_awards_higher_value() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(manager.submit_bid(bid(&id, a, 0.8, 5000, 0.9)));
        assert!(manager.submit_bid(bid(&id, b, 0.6, 2000, 0.95)));

        let winner = manager.select_winner(&id).unwrap();
        assert_eq!(winner.bidder_id(), b);

        let awarded = manager.award_to_best_bidder(&id).unwrap();
        assert_eq!(awarded.bidder_id(), b);
        let n = manager.negotiation(&id).unwrap();
        assert_eq!(n.state(), ContractState::Awarded);
        assert_eq!(n.awarded_to(), Some(b));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn award_of_unrecorded_bid_fails() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        assert!(manager.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5)));

        let stranger = bid(&id, Uuid::new_v4(), 1.0, 100, 1.0);
        assert!(!manager.award_contract(&id, &stranger));

        let n = manager.negotiation(&id).unwrap();
        assert_eq!(n.state(), ContractState::Announced);
        assert!(n.awarded_to().is_none());
    }

    #[test]
    fn award_without_bids_expires() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));

        assert!(manager.award_to_best_bidder(&id).is_none());
        assert_eq!(manager.negotiation(&id).unwrap().state(), ContractState::Expired);
    }

    #[test]
    fn second_award_is_refused() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        let first = bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5);
        let second = bid(&id, Uuid::new_v4(), 0.4, 1000, 0.5);
        manager.submit_bid(first.clone());
        manager.submit_bid(second.clone());

        assert!(manager.award_contract(&id, &first));
        assert!(!manager.award_contract(&id, &second));
        assert_eq!(manager.negotiation(&id).unwrap().awarded_to(), Some(first.bidder_id()));
    }

    #[test]
    fn complete_contract_requires_award() {
        let manager = NegotiationManager::default();
        let id = announce(&manager, Duration::from_secs(30));
        assert!(!manager.complete_contract(&id, true));

        manager.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5));
        manager.award_to_best_bidder(&id).unwrap();
        assert!(manager.complete_contract(&id, false));
        assert_eq!(manager.negotiation(&id).unwrap().state(), ContractState::Failed);
        assert!(!manager.complete_contract(&id, true));
    }

    #[test]
    fn cleanup_removes_only_stale_records() {
        let manager = NegotiationManager::with_retention(Duration::from_secs(300));
        let closed = announce(&manager, Duration::from_secs(30));
        let awarded = announce(&manager, Duration::from_secs(30));
        let open = announce(&manager, Duration::from_secs(600));
        let lapsed = announce(&manager, Duration::from_secs(30));

        manager.close_negotiation(&closed, ContractState::Failed);
        manager.submit_bid(bid(&awarded, Uuid::new_v4(), 0.5, 1000, 0.5));
        manager.award_to_best_bidder(&awarded).unwrap();

        // Inside retention and before any deadline nothing goes
        assert_eq!(manager.cleanup_at(Utc::now()), 0);

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(manager.cleanup_at(later), 2);
        assert!(manager.negotiation(&closed).is_none());
        assert!(manager.negotiation(&lapsed).is_none());
        assert!(manager.negotiation(&awarded).is_some());
        assert!(manager.negotiation(&open).is_some());
    }

    #[test]
    fn listeners_see_lifecycle_and_failures_are_isolated() {
        let manager = NegotiationManager::default();
        let awarded = Arc::new(AtomicUsize::new(0));
        let counter = awarded.clone();

        manager.add_listener(|_: &ContractEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener down")
        });
        manager.add_listener(move |e: &ContractEvent| -> anyhow::Result<()> {
            if matches!(e, ContractEvent::ContractAwarded { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        let id = announce(&manager, Duration::from_secs(30));
        assert!(manager.submit_bid(bid(&id, Uuid::new_v4(), 0.5, 1000, 0.5)));
        assert!(manager.award_to_best_bidder(&id).is_some());
        assert_eq!(awarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_duplicates_accept_once() {
        let manager = Arc::new(NegotiationManager::default());
        let id = announce(&manager, Duration::from_secs(30));
        let bidder = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let id = id.clone();
                std::thread::spawn(move || manager.submit_bid(bid(&id, bidder, 0.5, 1000, 0.5)))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(manager.bids(&id).len(), 1);
    }
}
