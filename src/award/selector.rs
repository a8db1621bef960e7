//! Weighted award scoring.
//!
//! Each bid gets five component scores in [0, 1]:
//!
//! | component    | score                                    |
//! |--------------|------------------------------------------|
//! | capability   | the bid's own score                      |
//! | price        | `1 - cost / max cost` (1 when all free)  |
//! | time         | `1 - estimated time / max estimated time`|
//! | availability | `1 - current load`                       |
//! | performance  | confidence, or ledger success rate       |
//!
//! The weighted sum decides the award. Bids within `tie_epsilon` of the best score are handed
//! to the [`ConflictResolver`].

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::conflict::{ConflictResolver, Resolution};
use super::performance::PerformanceLedger;
use crate::config::AwardConfig;
use crate::domain::Bid;
use crate::error::{ContractNetError, Result};

const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Component weights, must sum to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capability: f64,
    pub price: f64,
    pub time: f64,
    pub availability: f64,
    pub performance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.40,
            price: 0.20,
            time: 0.20,
            availability: 0.10,
            performance: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.capability + self.price + self.time + self.availability + self.performance
    }

    pub fn validate(&self) -> Result<()> {
        let named = [
            ("capability", self.capability),
            ("price", self.price),
            ("time", self.time),
            ("availability", self.availability),
            ("performance", self.performance),
        ];
        for (name, w) in named {
            if !w.is_finite() || w < 0.0 {
                return Err(ContractNetError::InvalidWeights(format!(
                    "{name} weight must be a non-negative number, got {w}"
                )));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ContractNetError::InvalidWeights(format!(
                "weights must sum to 1.0, got {sum:.3}"
            )));
        }
        Ok(())
    }
}

/// Score breakdown for one bid
#[derive(Debug, Clone, Serialize)]
pub struct ScoredBid {
    pub bid: Bid,
    pub capability: f64,
    pub price: f64,
    pub time: f64,
    pub availability: f64,
    pub performance: f64,
    pub total: f64,
}

/// Full outcome of a selection
#[derive(Debug, Clone, Serialize)]
pub struct AwardResult {
    pub winner: Option<Bid>,
    /// Every bid, best first
    pub scored: Vec<ScoredBid>,
    /// Present when the winner came out of a tie
    pub resolution: Option<Resolution>,
    pub selection_time: Duration,
}

impl AwardResult {
    pub fn was_tie(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Selector counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectorStats {
    pub selections_made: u64,
    pub conflicts_resolved: u64,
    pub average_selection_time: Duration,
    pub conflict_rate: f64,
}

#[derive(Default)]
struct Counters {
    selections: u64,
    conflicts: u64,
    total_time: Duration,
}

pub struct AwardSelector {
    weights: ScoringWeights,
    tie_epsilon: f64,
    resolver: Arc<ConflictResolver>,
    counters: Mutex<Counters>,
}

impl AwardSelector {
    pub fn new(config: &AwardConfig) -> Result<Self> {
        let resolver = Arc::new(ConflictResolver::new(config.strategy));
        Self::with_resolver(config.weights.clone(), config.tie_epsilon, resolver)
    }

    pub fn with_resolver(
        weights: ScoringWeights,
        tie_epsilon: f64,
        resolver: Arc<ConflictResolver>,
    ) -> Result<Self> {
        weights.validate()?;
        if !(tie_epsilon > 0.0 && tie_epsilon < 1.0) {
            return Err(ContractNetError::invalid(format!(
                "tie epsilon must be between 0 and 1, got {tie_epsilon}"
            )));
        }
        Ok(Self {
            weights,
            tie_epsilon,
            resolver,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn select_best_bid(&self, bids: &[Bid]) -> Option<Bid> {
        self.select_detailed(bids).winner
    }

    pub fn select_detailed(&self, bids: &[Bid]) -> AwardResult {
        self.select_inner(bids, |b| b.confidence())
    }

    /// Like [`select_best_bid`](Self::select_best_bid) but the performance component is the
    /// bidder's success rate from `ledger`
    pub fn select_best_bid_with_history(&self, bids: &[Bid], ledger: &PerformanceLedger) -> Option<Bid> {
        self.select_detailed_with_history(bids, ledger).winner
    }

    pub fn select_detailed_with_history(&self, bids: &[Bid], ledger: &PerformanceLedger) -> AwardResult {
        self.select_inner(bids, |b| ledger.success_rate(b.bidder_id()))
    }

    /// Score every bid without selecting
    pub fn score_bids(&self, bids: &[Bid], performance: impl Fn(&Bid) -> f64) -> Vec<ScoredBid> {
        let max_cost = bids.iter().map(Bid::cost).fold(0.0, f64::max);
        let max_time = bids
            .iter()
            .map(|b| b.estimated_time().as_secs_f64())
            .fold(0.0, f64::max);
        let w = &self.weights;

        let mut scored: Vec<ScoredBid> = bids
            .iter()
            .map(|bid| {
                let capability = bid.score();
                let price = if max_cost > 0.0 {
                    1.0 - bid.cost() / max_cost
                } else {
                    1.0
                };
                let time = if max_time > 0.0 {
                    1.0 - bid.estimated_time().as_secs_f64() / max_time
                } else {
                    1.0
                };
                let availability = 1.0 - bid.current_load();
                let performance = performance(bid).clamp(0.0, 1.0);
                let total = w.capability * capability
                    + w.price * price
                    + w.time * time
                    + w.availability * availability
                    + w.performance * performance;

                ScoredBid {
                    bid: bid.clone(),
                    capability,
                    price,
                    time,
                    availability,
                    performance,
                    total,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            OrderedFloat(b.total)
                .cmp(&OrderedFloat(a.total))
                .then_with(|| b.bid.rank(&a.bid))
        });
        scored
    }

    fn select_inner(&self, bids: &[Bid], performance: impl Fn(&Bid) -> f64) -> AwardResult {
        let started = Instant::now();
        let scored = self.score_bids(bids, performance);

        if scored.is_empty() {
            return AwardResult {
                winner: None,
                scored,
                resolution: None,
                selection_time: started.elapsed(),
            };
        }
        let best = &scored[0];

        let tied: Vec<Bid> = scored
            .iter()
            .take_while(|s| best.total - s.total < self.tie_epsilon)
            .map(|s| s.bid.clone())
            .collect();

        let (winner, resolution) = if tied.len() > 1 {
            match self.resolver.resolve_detailed(&tied) {
                Some(r) => (r.selected.clone(), Some(r)),
                None => (best.bid.clone(), None),
            }
        } else {
            (best.bid.clone(), None)
        };

        let selection_time = started.elapsed();
        {
            let mut counters = self.counters.lock();
            counters.selections += 1;
            counters.total_time += selection_time;
            if resolution.is_some() {
                counters.conflicts += 1;
            }
        }

        if let Some(r) = &resolution {
            debug!(tied = tied.len(), strategy = %r.strategy, "Award tie resolved");
        }
        info!(
            announcement_id = %winner.announcement_id(),
            winner = %winner.bidder_id(),
            score = best.total,
            candidates = scored.len(),
            "Best bid selected"
        );

        AwardResult {
            winner: Some(winner),
            scored,
            resolution,
            selection_time,
        }
    }

    pub fn statistics(&self) -> SelectorStats {
        let counters = self.counters.lock();
        let (average_selection_time, conflict_rate) = match counters.selections {
            0 => (Duration::ZERO, 0.0),
            n => (
                counters.total_time / n as u32,
                counters.conflicts as f64 / n as f64,
            ),
        };
        SelectorStats {
            selections_made: counters.selections,
            conflicts_resolved: counters.conflicts,
            average_selection_time,
            conflict_rate,
        }
    }

    pub fn reset_statistics(&self) {
        *self.counters.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::award::ResolutionStrategy;
    use crate::domain::{AgentId, BidParams};
    use uuid::Uuid;

    fn selector(strategy: ResolutionStrategy) -> AwardSelector {
        AwardSelector::new(&AwardConfig {
            strategy,
            ..AwardConfig::default()
        })
        .unwrap()
    }

    fn bid(bidder: AgentId, score: f64, ms: u64, conf: f64) -> Bid {
        Bid::new(BidParams::new(
            "announce_award",
            bidder,
            score,
            Duration::from_millis(ms),
            conf,
        ))
        .unwrap()
    }

    #[test]
    fn weights_must_sum_to_one() {
        assert!(ScoringWeights::default().validate().is_ok());

        let heavy = ScoringWeights {
            capability: 0.9,
            ..ScoringWeights::default()
        };
        assert!(matches!(
            heavy.validate(),
            Err(ContractNetError::InvalidWeights(_))
        ));

        let negative = ScoringWeights {
            capability: 0.7,
            price: -0.1,
            ..ScoringWeights::default()
        };
        assert!(negative.validate().is_err());

        let within_tolerance = ScoringWeights {
            capability: 0.405,
            ..ScoringWeights::default()
        };
        assert!(within_tolerance.validate().is_ok());
    }

    #[test]
    fn example_bids_score_as_expected() {
        let selector = selector(ResolutionStrategy::LoadBalancing);
        let a = bid(Uuid::new_v4(), 0.8, 5000, 0.9);
        let b = bid(Uuid::new_v4(), 0.6, 2000, 0.95);

        let result = selector.select_detailed(&[a.clone(), b.clone()]);
        assert_eq!(result.winner.as_ref().unwrap().bidder_id(), b.bidder_id());
        assert!(!result.was_tie());

        let top = &result.scored[0];
        assert!((top.total - 0.755).abs() < 1e-9);
        assert!((top.time - 0.6).abs() < 1e-9);
        let second = &result.scored[1];
        assert!((second.total - 0.71).abs() < 1e-9);
        assert_eq!(second.time, 0.0);
    }

    #[test]
    fn price_uses_relative_cost() {
        let selector = selector(ResolutionStrategy::LoadBalancing);
        let cheap = Bid::new(
            BidParams::new("announce_award", Uuid::new_v4(), 0.5, Duration::from_secs(1), 0.5)
                .cost(10.0),
        )
        .unwrap();
        let dear = Bid::new(
            BidParams::new("announce_award", Uuid::new_v4(), 0.5, Duration::from_secs(1), 0.5)
                .cost(40.0),
        )
        .unwrap();

        let scored = selector.score_bids(&[cheap.clone(), dear], Bid::confidence);
        assert_eq!(scored[0].bid.bidder_id(), cheap.bidder_id());
        assert!((scored[0].price - 0.75).abs() < 1e-9);
        assert_eq!(scored[1].price, 0.0);
    }

    #[test]
    fn ties_go_to_the_resolver() {
        let selector = selector(ResolutionStrategy::DistanceBased);
        let far = Bid::new(
            BidParams::new("announce_award", Uuid::from_u128(1), 0.5, Duration::from_secs(2), 0.5)
                .distance(50.0),
        )
        .unwrap();
        let near = Bid::new(
            BidParams::new("announce_award", Uuid::from_u128(2), 0.5, Duration::from_secs(2), 0.5)
                .distance(3.0),
        )
        .unwrap();

        let result = selector.select_detailed(&[far, near.clone()]);
        assert!(result.was_tie());
        assert_eq!(result.winner.unwrap().bidder_id(), near.bidder_id());
        assert_eq!(result.resolution.unwrap().tied.len(), 2);

        let stats = selector.statistics();
        assert_eq!(stats.selections_made, 1);
        assert_eq!(stats.conflicts_resolved, 1);
        assert_eq!(stats.conflict_rate, 1.0);
    }

    #[test]
    fn history_replaces_confidence() {
        let selector = selector(ResolutionStrategy::LoadBalancing);
        let ledger = PerformanceLedger::new();
        let reliable = bid(Uuid::new_v4(), 0.5, 1000, 0.1);
        let flaky = bid(Uuid::new_v4(), 0.5, 1000, 1.0);
        for _ in 0..4 {
            ledger.record_completion(reliable.bidder_id(), true, Duration::from_secs(1));
            ledger.record_completion(flaky.bidder_id(), false, Duration::from_secs(1));
        }

        let bids = [reliable.clone(), flaky.clone()];
        assert_eq!(
            selector.select_best_bid(&bids).unwrap().bidder_id(),
            flaky.bidder_id()
        );
        assert_eq!(
            selector
                .select_best_bid_with_history(&bids, &ledger)
                .unwrap()
                .bidder_id(),
            reliable.bidder_id()
        );
    }

    #[test]
    fn empty_input_selects_nothing() {
        let selector = selector(ResolutionStrategy::Random);
        let result = selector.select_detailed(&[]);
        assert!(result.winner.is_none());
        assert!(result.scored.is_empty());
        assert_eq!(selector.statistics().selections_made, 0);
    }

    #[test]
    fn rejects_bad_epsilon() {
        let resolver = Arc::new(ConflictResolver::new(ResolutionStrategy::Random));
        assert!(AwardSelector::with_resolver(ScoringWeights::default(), 0.0, resolver).is_err());
    }
}
