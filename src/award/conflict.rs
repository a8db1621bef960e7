//! Tie breaking between equally scored bids
//!
//! A resolver applies one of five strategies to a tie set and records why it picked the
//! winner. Tie sets are ordered by bidder id before a strategy runs, so the outcome never
//! depends on the order bids were collected in.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::performance::PerformanceLedger;
use crate::domain::{AgentId, Bid};
use crate::error::ContractNetError;

/// Tie-break strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Uniform pick
    Random,
    /// Cycle through the tie set with a counter kept across calls
    RoundRobin,
    /// Lowest reported load
    LoadBalancing,
    /// Best historical success rate, falling back to confidence
    PerformanceBased,
    /// Smallest reported distance
    DistanceBased,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 5] = [
        ResolutionStrategy::Random,
        ResolutionStrategy::RoundRobin,
        ResolutionStrategy::LoadBalancing,
        ResolutionStrategy::PerformanceBased,
        ResolutionStrategy::DistanceBased,
    ];
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::Random => write!(f, "random"),
            ResolutionStrategy::RoundRobin => write!(f, "round_robin"),
            ResolutionStrategy::LoadBalancing => write!(f, "load_balancing"),
            ResolutionStrategy::PerformanceBased => write!(f, "performance_based"),
            ResolutionStrategy::DistanceBased => write!(f, "distance_based"),
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ContractNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ResolutionStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.to_string() == normalized)
            .ok_or_else(|| ContractNetError::invalid(format!("unknown resolution strategy: {s}")))
    }
}

/// Outcome of one tie resolution, kept for explainability
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub selected: Bid,
    pub strategy: ResolutionStrategy,
    pub tied: Vec<Bid>,
    pub reasoning: String,
    pub resolved_at: DateTime<Utc>,
}

/// Resolver counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverStats {
    pub total_conflicts: u64,
    pub average_resolution_time: Duration,
    pub strategy_usage: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Counters {
    total_conflicts: u64,
    total_time: Duration,
    usage: HashMap<ResolutionStrategy, u64>,
}

pub struct ConflictResolver {
    strategy: Mutex<ResolutionStrategy>,
    ledger: Arc<PerformanceLedger>,
    rng: Mutex<StdRng>,
    round_robin: AtomicUsize,
    counters: Mutex<Counters>,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self::with_ledger(strategy, Arc::new(PerformanceLedger::new()))
    }

    pub fn with_ledger(strategy: ResolutionStrategy, ledger: Arc<PerformanceLedger>) -> Self {
        Self::build(strategy, ledger, StdRng::from_entropy())
    }

    /// Resolver with a fixed RNG seed, for reproducible random tie breaks
    pub fn with_seed(strategy: ResolutionStrategy, ledger: Arc<PerformanceLedger>, seed: u64) -> Self {
        Self::build(strategy, ledger, StdRng::seed_from_u64(seed))
    }

    fn build(strategy: ResolutionStrategy, ledger: Arc<PerformanceLedger>, rng: StdRng) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            ledger,
            rng: Mutex::new(rng),
            round_robin: AtomicUsize::new(0),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        *self.strategy.lock()
    }

    pub fn set_strategy(&self, strategy: ResolutionStrategy) {
        *self.strategy.lock() = strategy;
    }

    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    /// Winner of the tie set under the configured strategy
    pub fn resolve(&self, tied: &[Bid]) -> Option<Bid> {
        self.resolve_detailed(tied).map(|r| r.selected)
    }

    pub fn resolve_detailed(&self, tied: &[Bid]) -> Option<Resolution> {
        self.resolve_with(tied, self.strategy())
    }

    /// Resolve with an explicit strategy, ignoring the configured one
    pub fn resolve_with(&self, tied: &[Bid], strategy: ResolutionStrategy) -> Option<Resolution> {
        let started = Instant::now();
        let mut candidates = tied.to_vec();
        candidates.sort_by_key(|b| b.bidder_id());

        let (selected, reasoning) = match candidates.len() {
            0 => return None,
            1 => {
                let only = candidates[0].clone();
                let reasoning = format!("Selected {} as the only candidate", only.bidder_id());
                (only, reasoning)
            }
            _ => match strategy {
                ResolutionStrategy::Random => self.by_random(&candidates),
                ResolutionStrategy::RoundRobin => self.by_round_robin(&candidates),
                ResolutionStrategy::LoadBalancing => by_load(&candidates),
                ResolutionStrategy::PerformanceBased => self.by_performance(&candidates),
                ResolutionStrategy::DistanceBased => by_distance(&candidates),
            },
        };

        {
            let mut counters = self.counters.lock();
            counters.total_conflicts += 1;
            counters.total_time += started.elapsed();
            *counters.usage.entry(strategy).or_insert(0) += 1;
        }

        debug!(
            %strategy,
            tied = candidates.len(),
            winner = %selected.bidder_id(),
            reasoning = %reasoning,
            "Conflict resolved"
        );

        Some(Resolution {
            selected,
            strategy,
            tied: candidates,
            reasoning,
            resolved_at: Utc::now(),
        })
    }

    fn by_random(&self, tied: &[Bid]) -> (Bid, String) {
        let index = self.rng.lock().gen_range(0..tied.len());
        let bid = tied[index].clone();
        let reasoning = format!(
            "Selected {} by random selection from {} tied agents",
            bid.bidder_id(),
            tied.len()
        );
        (bid, reasoning)
    }

    fn by_round_robin(&self, tied: &[Bid]) -> (Bid, String) {
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % tied.len();
        let bid = tied[index].clone();
        let reasoning = format!("Selected {} by round-robin (index {})", bid.bidder_id(), index);
        (bid, reasoning)
    }

    fn by_performance(&self, tied: &[Bid]) -> (Bid, String) {
        if tied.iter().any(|b| self.ledger.has_history(b.bidder_id())) {
            let best = first_max_by(tied, |b| self.ledger.success_rate(b.bidder_id()));
            let record = self.ledger.get(best.bidder_id());
            let reasoning = format!(
                "Selected {} with best success rate ({:.1}%, {} completed)",
                best.bidder_id(),
                self.ledger.success_rate(best.bidder_id()) * 100.0,
                record.map(|r| r.completed).unwrap_or(0)
            );
            (best.clone(), reasoning)
        } else {
            let best = first_max_by(tied, Bid::confidence);
            let reasoning = format!(
                "Selected {} with highest confidence ({:.2})",
                best.bidder_id(),
                best.confidence()
            );
            (best.clone(), reasoning)
        }
    }

    pub fn record_task_completion(&self, agent_id: AgentId, success: bool, duration: Duration) {
        self.ledger.record_completion(agent_id, success, duration);
    }

    pub fn clear_performance_history(&self) {
        self.ledger.clear();
    }

    pub fn set_round_robin_index(&self, index: usize) {
        self.round_robin.store(index, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> ResolverStats {
        let counters = self.counters.lock();
        let average_resolution_time = match counters.total_conflicts {
            0 => Duration::ZERO,
            n => counters.total_time / n as u32,
        };
        ResolverStats {
            total_conflicts: counters.total_conflicts,
            average_resolution_time,
            strategy_usage: counters
                .usage
                .iter()
                .map(|(s, n)| (s.to_string(), *n))
                .collect(),
        }
    }

    pub fn reset_statistics(&self) {
        *self.counters.lock() = Counters::default();
    }
}

fn by_load(tied: &[Bid]) -> (Bid, String) {
    let best = first_max_by(tied, |b| -b.current_load());
    let reasoning = format!(
        "Selected {} with lowest load ({:.0}%)",
        best.bidder_id(),
        best.current_load() * 100.0
    );
    (best.clone(), reasoning)
}

fn by_distance(tied: &[Bid]) -> (Bid, String) {
    let best = first_max_by(tied, |b| -b.distance().unwrap_or(f64::INFINITY));
    let reasoning = match best.distance() {
        Some(d) => format!("Selected {} as closest agent ({:.1} blocks)", best.bidder_id(), d),
        None => format!("Selected {} with no distance reported", best.bidder_id()),
    };
    (best.clone(), reasoning)
}

/// First element with the greatest key; earlier elements win ties
fn first_max_by<'a>(bids: &'a [Bid], key: impl Fn(&Bid) -> f64) -> &'a Bid {
    let mut best = &bids[0];
    let mut best_key = key(best);
    for bid in &bids[1..] {
        let k = key(bid);
        if k > best_key {
            best = bid;
            best_key = k;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BidParams;
    use uuid::Uuid;

    fn tied_bid(n: u128, load: f64, distance: f64, confidence: f64) -> Bid {
        Bid::new(
            BidParams::new(
                "announce_tie",
                Uuid::from_u128(n),
                0.5,
                Duration::from_secs(1),
                confidence,
            )
            .current_load(load)
            .distance(distance),
        )
        .unwrap()
    }

    fn three() -> Vec<Bid> {
        vec![
            tied_bid(3, 0.6, 5.0, 0.7),
            tied_bid(1, 0.2, 30.0, 0.5),
            tied_bid(2, 0.9, 2.0, 0.9),
        ]
    }

    #[test]
    fn load_balancing_is_deterministic() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LoadBalancing);
        for _ in 0..5 {
            let winner = resolver.resolve(&three()).unwrap();
            assert_eq!(winner.bidder_id(), Uuid::from_u128(1));
        }
        let detail = resolver.resolve_detailed(&three()).unwrap();
        assert!(detail.reasoning.contains("lowest load (20%)"));
        assert_eq!(detail.tied.len(), 3);
    }

    #[test]
    fn round_robin_cycles_before_repeating() {
        let resolver = ConflictResolver::new(ResolutionStrategy::RoundRobin);
        let picks: Vec<_> = (0..6)
            .map(|_| resolver.resolve(&three()).unwrap().bidder_id())
            .collect();

        assert_eq!(
            &picks[..3],
            &[Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)]
        );
        assert_eq!(&picks[..3], &picks[3..]);

        resolver.set_round_robin_index(2);
        assert_eq!(resolver.resolve(&three()).unwrap().bidder_id(), Uuid::from_u128(3));
    }

    #[test]
    fn distance_prefers_closest() {
        let resolver = ConflictResolver::new(ResolutionStrategy::DistanceBased);
        let detail = resolver.resolve_detailed(&three()).unwrap();
        assert_eq!(detail.selected.bidder_id(), Uuid::from_u128(2));
        assert!(detail.reasoning.contains("closest agent (2.0 blocks)"));
    }

    #[test]
    fn performance_falls_back_to_confidence() {
        let resolver = ConflictResolver::new(ResolutionStrategy::PerformanceBased);
        assert_eq!(resolver.resolve(&three()).unwrap().bidder_id(), Uuid::from_u128(2));

        // With history for any tied bidder, success rate decides
        resolver.record_task_completion(Uuid::from_u128(3), true, Duration::from_secs(1));
        let detail = resolver.resolve_detailed(&three()).unwrap();
        assert_eq!(detail.selected.bidder_id(), Uuid::from_u128(3));
        assert!(detail.reasoning.contains("best success rate"));

        resolver.clear_performance_history();
        assert_eq!(resolver.resolve(&three()).unwrap().bidder_id(), Uuid::from_u128(2));
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let ledger = Arc::new(PerformanceLedger::new());
        let a = ConflictResolver::with_seed(ResolutionStrategy::Random, ledger.clone(), 7);
        let b = ConflictResolver::with_seed(ResolutionStrategy::Random, ledger, 7);
        for _ in 0..10 {
            assert_eq!(
                a.resolve(&three()).unwrap().bidder_id(),
                b.resolve(&three()).unwrap().bidder_id()
            );
        }
    }

    #[test]
    fn statistics_count_usage() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LoadBalancing);
        assert!(resolver.resolve(&[]).is_none());
        resolver.resolve(&three());
        resolver.resolve_with(&three(), ResolutionStrategy::DistanceBased);

        let stats = resolver.statistics();
        assert_eq!(stats.total_conflicts, 2);
        assert_eq!(stats.strategy_usage.get("load_balancing"), Some(&1));
        assert_eq!(stats.strategy_usage.get("distance_based"), Some(&1));

        resolver.reset_statistics();
        assert_eq!(resolver.statistics().total_conflicts, 0);
    }

    #[test]
    fn strategy_parses_from_cli_forms() {
        assert_eq!(
            "round-robin".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::RoundRobin
        );
        assert_eq!(
            "LOAD_BALANCING".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::LoadBalancing
        );
        assert!("fastest".parse::<ResolutionStrategy>().is_err());
    }
}
