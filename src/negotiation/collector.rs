//! Timed bid collection.
//!
//! A collection stays open until it is closed, completed or cancelled by a caller, or until
//! its one-shot timeout fires. The timeout task re-checks the state under the write lock and
//! does nothing if a caller got there first.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::record::BidCollection;
use super::state::CollectionState;
use crate::domain::{AgentId, Bid};
use crate::error::{ContractNetError, Result};
use crate::events::{EventHub, Listener, ListenerId};

/// Events emitted by the [`BidCollector`]
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    BidReceived {
        announcement_id: String,
        bid: Bid,
    },
    /// Closed by a caller; carries the frozen bid set
    Closed {
        announcement_id: String,
        bids: Vec<Bid>,
    },
    /// Timeout fired while the collection was still open
    TimedOut {
        announcement_id: String,
        bids: Vec<Bid>,
    },
    Cancelled {
        announcement_id: String,
        reason: String,
    },
    Completed {
        announcement_id: String,
        winner: AgentId,
    },
}

/// Collector counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStats {
    pub total_collections: u64,
    pub total_bids: u64,
    pub total_timeouts: u64,
    pub active_collections: usize,
}

#[derive(Clone)]
pub struct BidCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    collections: DashMap<String, Arc<BidCollection>>,
    timers: DashMap<String, AbortHandle>,
    write_lock: Mutex<()>,
    events: EventHub<CollectionEvent>,
    total_collections: AtomicU64,
    total_bids: AtomicU64,
    total_timeouts: AtomicU64,
}

impl BidCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                collections: DashMap::new(),
                timers: DashMap::new(),
                write_lock: Mutex::new(()),
                events: EventHub::new("collection"),
                total_collections: AtomicU64::new(0),
                total_bids: AtomicU64::new(0),
                total_timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Open a collection and schedule its timeout.
    ///
    /// Returns `Ok(false)` if a collection already exists for the id. Must be called from
    /// within a tokio runtime.
    pub fn start_collection(&self, announcement_id: &str, timeout: Duration) -> Result<bool> {
        if announcement_id.trim().is_empty() {
            return Err(ContractNetError::invalid("announcement id cannot be blank"));
        }
        if timeout.is_zero() {
            return Err(ContractNetError::invalid("collection timeout must be positive"));
        }
        let runtime = Handle::try_current()
            .map_err(|_| ContractNetError::NoRuntime(format!("timeout for {announcement_id}")))?;

        {
            let _guard = self.inner.write_lock.lock();
            if self.inner.collections.contains_key(announcement_id) {
                warn!(announcement_id, "Collection already exists");
                return Ok(false);
            }

            self.inner.collections.insert(
                announcement_id.to_string(),
                Arc::new(BidCollection::new(announcement_id, timeout, Utc::now())),
            );

            let weak: Weak<CollectorInner> = Arc::downgrade(&self.inner);
            let id = announcement_id.to_string();
            let task = runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.handle_timeout(&id);
                }
            });
            self.inner
                .timers
                .insert(announcement_id.to_string(), task.abort_handle());
        }

        self.inner.total_collections.fetch_add(1, Ordering::Relaxed);
        info!(
            announcement_id,
            timeout_ms = timeout.as_millis() as u64,
            "Bid collection started"
        );
        Ok(true)
    }

    pub fn receive_bid(&self, bid: Bid) -> bool {
        self.receive_bid_at(bid, Utc::now())
    }

    /// Record a bid against an open, unexpired collection. A bid arriving after the
    /// timeout elapsed expires the collection even if the timer has not fired yet.
    pub fn receive_bid_at(&self, bid: Bid, now: DateTime<Utc>) -> bool {
        let id = bid.announcement_id().to_string();
        let bidder = bid.bidder_id();

        let event = {
            let _guard = self.inner.write_lock.lock();
            let Some(current) = self.inner.snapshot(&id) else {
                warn!(announcement_id = %id, bidder = %bidder, "Bid for unknown collection");
                return false;
            };

            if !current.is_open() {
                warn!(
                    announcement_id = %id,
                    bidder = %bidder,
                    state = %current.state(),
                    "Bid rejected, collection not open"
                );
                return false;
            }

            if now >= current.deadline() {
                let Ok(expired) = current.with_state(CollectionState::Expired, now) else {
                    return false;
                };
                self.inner.collections.insert(id.clone(), Arc::new(expired));
                self.inner.cancel_timer(&id);
                self.inner.total_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(announcement_id = %id, bidder = %bidder, "Bid rejected, collection timed out");
                CollectionEvent::TimedOut {
                    announcement_id: id.clone(),
                    bids: current.bid_list(),
                }
            } else if current.has_bid_from(bidder) {
                warn!(announcement_id = %id, bidder = %bidder, "Duplicate bid rejected");
                return false;
            } else {
                self.inner
                    .collections
                    .insert(id.clone(), Arc::new(current.with_bid(bid.clone())));
                self.inner.total_bids.fetch_add(1, Ordering::Relaxed);
                debug!(announcement_id = %id, bidder = %bidder, "Bid received");
                CollectionEvent::BidReceived {
                    announcement_id: id.clone(),
                    bid,
                }
            }
        };

        let accepted = matches!(event, CollectionEvent::BidReceived { .. });
        self.inner.events.emit(event);
        accepted
    }

    /// Freeze the bid set. Only an open collection can be closed.
    pub fn close_collection(&self, announcement_id: &str) -> bool {
        let bids = {
            let _guard = self.inner.write_lock.lock();
            let Some(current) = self.inner.snapshot(announcement_id) else {
                return false;
            };
            let Ok(closed) = current.with_state(CollectionState::Closed, Utc::now()) else {
                debug!(announcement_id, state = %current.state(), "Collection not open");
                return false;
            };
            let bids = closed.bid_list();
            self.inner
                .collections
                .insert(announcement_id.to_string(), Arc::new(closed));
            self.inner.cancel_timer(announcement_id);
            bids
        };

        info!(announcement_id, bid_count = bids.len(), "Bid collection closed");
        self.inner.events.emit(CollectionEvent::Closed {
            announcement_id: announcement_id.to_string(),
            bids,
        });
        true
    }

    /// Record the winner of an open or closed collection
    pub fn mark_completed(&self, announcement_id: &str, winner: AgentId) -> bool {
        {
            let _guard = self.inner.write_lock.lock();
            let Some(current) = self.inner.snapshot(announcement_id) else {
                return false;
            };
            let Ok(done) = current.with_winner(winner, Utc::now()) else {
                debug!(announcement_id, state = %current.state(), "Collection cannot complete");
                return false;
            };
            self.inner
                .collections
                .insert(announcement_id.to_string(), Arc::new(done));
            self.inner.cancel_timer(announcement_id);
        }

        info!(announcement_id, winner = %winner, "Bid collection completed");
        self.inner.events.emit(CollectionEvent::Completed {
            announcement_id: announcement_id.to_string(),
            winner,
        });
        true
    }

    /// Cancel a collection that has not reached a decision
    pub fn cancel_collection(&self, announcement_id: &str, reason: &str) -> bool {
        {
            let _guard = self.inner.write_lock.lock();
            let Some(current) = self.inner.snapshot(announcement_id) else {
                return false;
            };
            if current.is_complete() {
                warn!(announcement_id, state = %current.state(), "Cannot cancel finished collection");
                return false;
            }
            let Ok(cancelled) = current.with_cancellation(reason, Utc::now()) else {
                return false;
            };
            self.inner
                .collections
                .insert(announcement_id.to_string(), Arc::new(cancelled));
            self.inner.cancel_timer(announcement_id);
        }

        info!(announcement_id, reason, "Bid collection cancelled");
        self.inner.events.emit(CollectionEvent::Cancelled {
            announcement_id: announcement_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    pub fn collection(&self, announcement_id: &str) -> Option<Arc<BidCollection>> {
        self.inner.snapshot(announcement_id)
    }

    pub fn bids(&self, announcement_id: &str) -> Vec<Bid> {
        self.inner
            .snapshot(announcement_id)
            .map(|c| c.bid_list())
            .unwrap_or_default()
    }

    pub fn is_collection_complete(&self, announcement_id: &str) -> bool {
        self.inner
            .snapshot(announcement_id)
            .is_some_and(|c| c.is_complete())
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .collections
            .iter()
            .filter(|e| e.value().is_open())
            .count()
    }

    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(Utc::now(), max_age)
    }

    /// Evict collections that ended more than `max_age` before `now`
    pub fn cleanup_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let _guard = self.inner.write_lock.lock();
        let before = self.inner.collections.len();

        self.inner
            .collections
            .retain(|_, c| c.age(now).map_or(true, |age| age <= max_age));
        self.inner
            .timers
            .retain(|id, _| self.inner.collections.contains_key(id));

        let removed = before.saturating_sub(self.inner.collections.len());
        if removed > 0 {
            debug!(removed, "Bid collections cleaned up");
        }
        removed
    }

    pub fn statistics(&self) -> CollectorStats {
        CollectorStats {
            total_collections: self.inner.total_collections.load(Ordering::Relaxed),
            total_bids: self.inner.total_bids.load(Ordering::Relaxed),
            total_timeouts: self.inner.total_timeouts.load(Ordering::Relaxed),
            active_collections: self.active_count(),
        }
    }

    /// Abort every pending timeout and drop all collections
    pub fn shutdown(&self) {
        let _guard = self.inner.write_lock.lock();
        for timer in self.inner.timers.iter() {
            timer.value().abort();
        }
        self.inner.timers.clear();
        self.inner.collections.clear();
        info!("Bid collector shut down");
    }

    pub fn add_listener(&self, listener: impl Listener<CollectionEvent> + 'static) -> ListenerId {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for BidCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorInner {
    fn snapshot(&self, announcement_id: &str) -> Option<Arc<BidCollection>> {
        self.collections
            .get(announcement_id)
            .map(|e| e.value().clone())
    }

    fn cancel_timer(&self, announcement_id: &str) {
        if let Some((_, timer)) = self.timers.remove(announcement_id) {
            timer.abort();
        }
    }

    fn handle_timeout(&self, announcement_id: &str) {
        let bids = {
            let _guard = self.write_lock.lock();
            self.timers.remove(announcement_id);
            let Some(current) = self.snapshot(announcement_id) else {
                return;
            };
            if !current.is_open() {
                return;
            }
            let Ok(expired) = current.with_state(CollectionState::Expired, Utc::now()) else {
                return;
            };
            self.collections
                .insert(announcement_id.to_string(), Arc::new(expired));
            current.bid_list()
        };

        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(announcement_id, bid_count = bids.len(), "Bid collection timed out");
        self.events.emit(CollectionEvent::TimedOut {
            announcement_id: announcement_id.to_string(),
            bids,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BidParams;
    use uuid::Uuid;

    fn bid(announcement_id: &str, bidder: AgentId) -> Bid {
        Bid::new(BidParams::new(
            announcement_id,
            bidder,
            0.5,
            Duration::from_secs(1),
            0.5,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn start_rejects_invalid_and_duplicate() {
        let collector = BidCollector::new();
        assert!(collector.start_collection("", Duration::from_secs(1)).is_err());
        assert!(collector.start_collection("announce_a", Duration::ZERO).is_err());
        assert!(collector.start_collection("announce_a", Duration::from_secs(5)).unwrap());
        assert!(!collector.start_collection("announce_a", Duration::from_secs(5)).unwrap());
        assert_eq!(collector.statistics().total_collections, 1);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let collector = BidCollector::new();
        let err = collector
            .start_collection("announce_a", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ContractNetError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn receive_rejects_duplicates_and_closed() {
        let collector = BidCollector::new();
        collector.start_collection("announce_a", Duration::from_secs(5)).unwrap();
        let bidder = Uuid::new_v4();

        assert!(collector.receive_bid(bid("announce_a", bidder)));
        assert!(!collector.receive_bid(bid("announce_a", bidder)));
        assert!(!collector.receive_bid(bid("announce_missing", bidder)));

        assert!(collector.close_collection("announce_a"));
        assert!(!collector.close_collection("announce_a"));
        assert!(!collector.receive_bid(bid("announce_a", Uuid::new_v4())));
        assert_eq!(collector.bids("announce_a").len(), 1);
        assert_eq!(collector.statistics().total_bids, 1);
    }

    #[tokio::test]
    async fn timeout_expires_open_collection() {
        let collector = BidCollector::new();
        let mut events = collector.subscribe();
        collector.start_collection("announce_t", Duration::from_millis(50)).unwrap();
        collector.receive_bid(bid("announce_t", Uuid::new_v4()));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let c = collector.collection("announce_t").unwrap();
        assert_eq!(c.state(), CollectionState::Expired);
        assert!(collector.is_collection_complete("announce_t"));
        assert_eq!(collector.statistics().total_timeouts, 1);

        // Close after expiry is a no-op
        assert!(!collector.close_collection("announce_t"));

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if let CollectionEvent::TimedOut { bids, .. } = event {
                assert_eq!(bids.len(), 1);
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn close_cancels_pending_timeout() {
        let collector = BidCollector::new();
        collector.start_collection("announce_c", Duration::from_millis(50)).unwrap();
        assert!(collector.close_collection("announce_c"));

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            collector.collection("announce_c").unwrap().state(),
            CollectionState::Closed
        );
        assert_eq!(collector.statistics().total_timeouts, 0);
    }

    #[tokio::test]
    async fn late_bid_expires_before_timer() {
        let collector = BidCollector::new();
        collector.start_collection("announce_l", Duration::from_secs(10)).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(11);

        assert!(!collector.receive_bid_at(bid("announce_l", Uuid::new_v4()), later));
        assert_eq!(
            collector.collection("announce_l").unwrap().state(),
            CollectionState::Expired
        );
    }

    #[tokio::test]
    async fn complete_and_cancel_rules() {
        let collector = BidCollector::new();
        let winner = Uuid::new_v4();
        collector.start_collection("announce_w", Duration::from_secs(5)).unwrap();
        collector.start_collection("announce_x", Duration::from_secs(5)).unwrap();

        assert!(collector.close_collection("announce_w"));
        assert!(collector.mark_completed("announce_w", winner));
        assert_eq!(collector.collection("announce_w").unwrap().winner_id(), Some(winner));
        assert!(!collector.cancel_collection("announce_w", "too late"));

        assert!(collector.cancel_collection("announce_x", "requester gone"));
        assert!(!collector.mark_completed("announce_x", winner));
        assert_eq!(
            collector.collection("announce_x").unwrap().cancellation_reason(),
            Some("requester gone")
        );
        assert_eq!(collector.active_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_finished_collections() {
        let collector = BidCollector::new();
        collector.start_collection("announce_open", Duration::from_secs(60)).unwrap();
        collector.start_collection("announce_done", Duration::from_secs(60)).unwrap();
        collector.close_collection("announce_done");

        let max_age = Duration::from_secs(300);
        assert_eq!(collector.cleanup_at(Utc::now(), max_age), 0);

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(collector.cleanup_at(later, max_age), 1);
        assert!(collector.collection("announce_done").is_none());
        assert!(collector.collection("announce_open").is_some());
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let collector = BidCollector::new();
        collector.start_collection("announce_s", Duration::from_millis(50)).unwrap();
        collector.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.collection("announce_s").is_none());
        assert_eq!(collector.statistics().total_timeouts, 0);
    }
}
