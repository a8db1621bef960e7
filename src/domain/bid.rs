use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ContractNetError, Result};

/// Identifier of a worker (bidder or requester)
pub type AgentId = Uuid;

/// Well-known capability keys carried in `Bid::capabilities`
pub mod capability {
    pub const DISTANCE: &str = "distance";
    pub const CURRENT_LOAD: &str = "current_load";
    pub const COST: &str = "cost";
}

/// Construction parameters for a [`Bid`]
#[derive(Debug, Clone)]
pub struct BidParams {
    pub announcement_id: String,
    pub bidder_id: AgentId,
    /// Self-assessed capability in [0, 1]
    pub score: f64,
    /// Estimated completion time, must be positive
    pub estimated_time: Duration,
    /// Confidence in the estimate, in [0, 1]
    pub confidence: f64,
    /// Contextual capabilities (distance, current load, cost, ...)
    pub capabilities: Map<String, Value>,
}

impl BidParams {
    pub fn new(
        announcement_id: impl Into<String>,
        bidder_id: AgentId,
        score: f64,
        estimated_time: Duration,
        confidence: f64,
    ) -> Self {
        Self {
            announcement_id: announcement_id.into(),
            bidder_id,
            score,
            estimated_time,
            confidence,
            capabilities: Map::new(),
        }
    }

    pub fn capability(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    pub fn distance(self, distance: f64) -> Self {
        self.capability(capability::DISTANCE, distance)
    }

    pub fn current_load(self, load: f64) -> Self {
        self.capability(capability::CURRENT_LOAD, load)
    }

    pub fn cost(self, cost: f64) -> Self {
        self.capability(capability::COST, cost)
    }
}

/// An immutable offer from one worker for one announcement.
///
/// Two bids are equal when they share announcement and bidder, regardless of the offer
/// itself, so a second offer from the same bidder is recognised as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    announcement_id: String,
    bidder_id: AgentId,
    score: f64,
    #[serde(with = "duration_ms")]
    estimated_time: Duration,
    confidence: f64,
    capabilities: Map<String, Value>,
}

impl Bid {
    pub fn new(params: BidParams) -> Result<Self> {
        if params.announcement_id.trim().is_empty() {
            return Err(ContractNetError::invalid("announcement id cannot be blank"));
        }
        if !unit_range(params.score) {
            return Err(ContractNetError::invalid(format!(
                "bid score must be between 0 and 1, got {}",
                params.score
            )));
        }
        if !unit_range(params.confidence) {
            return Err(ContractNetError::invalid(format!(
                "bid confidence must be between 0 and 1, got {}",
                params.confidence
            )));
        }
        if params.estimated_time.is_zero() {
            return Err(ContractNetError::invalid("estimated time must be positive"));
        }

        let bid = Self {
            announcement_id: params.announcement_id,
            bidder_id: params.bidder_id,
            score: params.score,
            estimated_time: params.estimated_time,
            confidence: params.confidence,
            capabilities: params.capabilities,
        };

        if let Some(load) = bid.number(capability::CURRENT_LOAD) {
            if !unit_range(load) {
                return Err(ContractNetError::invalid(format!(
                    "current load must be between 0 and 1, got {load}"
                )));
            }
        }
        if let Some(distance) = bid.distance() {
            if distance.is_nan() || distance < 0.0 {
                return Err(ContractNetError::invalid(format!(
                    "distance cannot be negative, got {distance}"
                )));
            }
        }
        if bid.cost().is_nan() || bid.cost() < 0.0 {
            return Err(ContractNetError::invalid(format!(
                "cost cannot be negative, got {}",
                bid.cost()
            )));
        }

        Ok(bid)
    }

    pub fn announcement_id(&self) -> &str {
        &self.announcement_id
    }

    pub fn bidder_id(&self) -> AgentId {
        self.bidder_id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn estimated_time(&self) -> Duration {
        self.estimated_time
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn capabilities(&self) -> &Map<String, Value> {
        &self.capabilities
    }

    /// Expected value per second: `score * confidence / max(1, seconds)`
    pub fn value(&self) -> f64 {
        let secs = self.estimated_time.as_secs_f64().max(1.0);
        self.score * self.confidence / secs
    }

    /// Reported distance to the work site, if the bidder supplied one
    pub fn distance(&self) -> Option<f64> {
        self.number(capability::DISTANCE)
    }

    /// Reported load in [0, 1]; idle when absent
    pub fn current_load(&self) -> f64 {
        self.number(capability::CURRENT_LOAD).unwrap_or(0.0)
    }

    /// Resource-cost signal used by price scoring; free when absent
    pub fn cost(&self) -> f64 {
        self.number(capability::COST).unwrap_or(0.0)
    }

    /// Compares by bid value, then shorter estimated time, then lower bidder id.
    /// `Ordering::Greater` means `self` is the better bid.
    pub fn rank(&self, other: &Bid) -> Ordering {
        self.value()
            .total_cmp(&other.value())
            .then_with(|| other.estimated_time.cmp(&self.estimated_time))
            .then_with(|| other.bidder_id.cmp(&self.bidder_id))
    }

    /// Best bid of a set by [`Bid::rank`]
    pub fn best<'a>(bids: impl IntoIterator<Item = &'a Bid>) -> Option<&'a Bid> {
        bids.into_iter().max_by(|a, b| a.rank(b))
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.capabilities.get(key).and_then(Value::as_f64)
    }
}

impl PartialEq for Bid {
    fn eq(&self, other: &Self) -> bool {
        self.announcement_id == other.announcement_id && self.bidder_id == other.bidder_id
    }
}

impl Eq for Bid {}

impl Hash for Bid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.announcement_id.hash(state);
        self.bidder_id.hash(state);
    }
}

impl std::fmt::Display for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bid[{} on {}: score={:.2}, time={}ms, conf={:.2}, value={:.3}]",
            self.bidder_id,
            self.announcement_id,
            self.score,
            self.estimated_time.as_millis(),
            self.confidence,
            self.value()
        )
    }
}

fn unit_range(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(bidder: AgentId, score: f64, ms: u64, conf: f64) -> Bid {
        Bid::new(BidParams::new(
            "announce_test",
            bidder,
            score,
            Duration::from_millis(ms),
            conf,
        ))
        .unwrap()
    }

    #[test]
    fn value_uses_seconds_floored_at_one() {
        let a = bid(Uuid::new_v4(), 0.8, 5000, 0.9);
        let b = bid(Uuid::new_v4(), 0.6, 2000, 0.95);
        let quick = bid(Uuid::new_v4(), 0.5, 200, 1.0);

        assert!((a.value() - 0.144).abs() < 1e-9);
        assert!((b.value() - 0.285).abs() < 1e-9);
        assert!((quick.value() - 0.5).abs() < 1e-9);
        assert_eq!(Bid::best([&a, &b]).unwrap().bidder_id(), b.bidder_id());
    }

    #[test]
    fn equal_value_prefers_shorter_time_then_lower_id() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        // Both floor to one second, so values tie
        let slow = bid(high, 0.5, 900, 1.0);
        let fast = bid(high, 0.5, 300, 1.0);
        assert_eq!(fast.rank(&slow), Ordering::Greater);

        let a = bid(low, 0.5, 300, 1.0);
        let b = bid(high, 0.5, 300, 1.0);
        assert_eq!(Bid::best([&b, &a]).unwrap().bidder_id(), low);
    }

    #[test]
    fn equality_ignores_offer() {
        let id = Uuid::new_v4();
        assert_eq!(bid(id, 0.1, 1000, 0.1), bid(id, 0.9, 4000, 0.9));
    }

    #[test]
    fn rejects_out_of_range_input() {
        let id = Uuid::new_v4();
        let base = || BidParams::new("announce_x", id, 0.5, Duration::from_secs(1), 0.5);

        assert!(Bid::new(BidParams { score: 1.2, ..base() }).is_err());
        assert!(Bid::new(BidParams { confidence: -0.1, ..base() }).is_err());
        assert!(Bid::new(BidParams { estimated_time: Duration::ZERO, ..base() }).is_err());
        assert!(Bid::new(BidParams { announcement_id: " ".into(), ..base() }).is_err());
        assert!(Bid::new(base().current_load(1.5)).is_err());
        assert!(Bid::new(base().distance(-3.0)).is_err());
        assert!(Bid::new(base().cost(-1.0)).is_err());
    }

    #[test]
    fn capability_defaults() {
        let b = bid(Uuid::new_v4(), 0.5, 1000, 0.5);
        assert_eq!(b.distance(), None);
        assert_eq!(b.current_load(), 0.0);
        assert_eq!(b.cost(), 0.0);

        let c = Bid::new(
            BidParams::new("announce_x", Uuid::new_v4(), 0.5, Duration::from_secs(1), 0.5)
                .distance(12.0)
                .current_load(0.25),
        )
        .unwrap();
        assert_eq!(c.distance(), Some(12.0));
        assert_eq!(c.current_load(), 0.25);
    }
}
