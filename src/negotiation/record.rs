//! Immutable negotiation snapshots.
//!
//! Records are never mutated in place. Each `with_*` call returns a new snapshot which the
//! owning authority swaps into its map while holding its write lock, so readers cloning the
//! stored `Arc` always see a consistent record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::state::{CollectionState, ContractState};
use crate::domain::{AgentId, Announcement, Bid};
use crate::error::Result;

/// One announcement's bids and outcome, owned by the `NegotiationManager`
#[derive(Debug, Clone, Serialize)]
pub struct Negotiation {
    announcement: Announcement,
    bids: BTreeMap<AgentId, Bid>,
    state: ContractState,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    winning_bid: Option<Bid>,
    awarded_to: Option<AgentId>,
}

impl Negotiation {
    pub fn new(announcement: Announcement) -> Self {
        let created_at = announcement.created_at();
        Self {
            announcement,
            bids: BTreeMap::new(),
            state: ContractState::Announced,
            created_at,
            closed_at: None,
            winning_bid: None,
            awarded_to: None,
        }
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn announcement_id(&self) -> &str {
        self.announcement.id()
    }

    pub fn state(&self) -> ContractState {
        self.state
    }

    pub fn bids(&self) -> impl Iterator<Item = &Bid> {
        self.bids.values()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn bid_from(&self, bidder: AgentId) -> Option<&Bid> {
        self.bids.get(&bidder)
    }

    pub fn has_bid_from(&self, bidder: AgentId) -> bool {
        self.bids.contains_key(&bidder)
    }

    /// Whether this exact bid (by announcement and bidder) is recorded
    pub fn contains(&self, bid: &Bid) -> bool {
        self.bids.get(&bid.bidder_id()).is_some_and(|b| b == bid)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn winning_bid(&self) -> Option<&Bid> {
        self.winning_bid.as_ref()
    }

    pub fn awarded_to(&self) -> Option<AgentId> {
        self.awarded_to
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn with_bid(&self, bid: Bid) -> Self {
        let mut next = self.clone();
        next.bids.insert(bid.bidder_id(), bid);
        next
    }

    /// Move to `state`, stamping the close time the first time the record leaves `Announced`
    pub fn with_state(&self, state: ContractState, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.clone();
        next.state = self.state.transition(state)?;
        if next.closed_at.is_none() {
            next.closed_at = Some(now);
        }
        Ok(next)
    }

    pub fn with_winning_bid(&self, bid: Bid, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.with_state(ContractState::Awarded, now)?;
        next.awarded_to = Some(bid.bidder_id());
        next.winning_bid = Some(bid);
        Ok(next)
    }

    /// Time since the record left `Announced`, or since creation while still open
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let since = self.closed_at.unwrap_or(self.created_at);
        (now - since).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Timed bid collection for one announcement, owned by the `BidCollector`
#[derive(Debug, Clone, Serialize)]
pub struct BidCollection {
    announcement_id: String,
    bids: BTreeMap<AgentId, Bid>,
    state: CollectionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_ms")]
    timeout: Duration,
    winner_id: Option<AgentId>,
    cancellation_reason: Option<String>,
}

impl BidCollection {
    pub fn new(announcement_id: impl Into<String>, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            announcement_id: announcement_id.into(),
            bids: BTreeMap::new(),
            state: CollectionState::Open,
            started_at: now,
            ended_at: None,
            timeout,
            winner_id: None,
            cancellation_reason: None,
        }
    }

    pub fn announcement_id(&self) -> &str {
        &self.announcement_id
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn bids(&self) -> impl Iterator<Item = &Bid> {
        self.bids.values()
    }

    pub fn bid_list(&self) -> Vec<Bid> {
        self.bids.values().cloned().collect()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn has_bid_from(&self, bidder: AgentId) -> bool {
        self.bids.contains_key(&bidder)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX)
    }

    pub fn winner_id(&self) -> Option<AgentId> {
        self.winner_id
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn with_bid(&self, bid: Bid) -> Self {
        let mut next = self.clone();
        next.bids.insert(bid.bidder_id(), bid);
        next
    }

    pub fn with_state(&self, state: CollectionState, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.clone();
        next.state = self.state.transition(state)?;
        if next.ended_at.is_none() {
            next.ended_at = Some(now);
        }
        Ok(next)
    }

    pub fn with_winner(&self, winner: AgentId, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.with_state(CollectionState::Completed, now)?;
        next.winner_id = Some(winner);
        Ok(next)
    }

    pub fn with_cancellation(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.with_state(CollectionState::Cancelled, now)?;
        next.cancellation_reason = Some(reason.into());
        Ok(next)
    }

    /// Time since the collection ended; `None` while still open
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.ended_at
            .map(|ended| (now - ended).to_std().unwrap_or(Duration::ZERO))
    }
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
