//! Award scoring, tie resolution and the performance ledger

pub mod conflict;
pub mod performance;
pub mod selector;

pub use conflict::{ConflictResolver, Resolution, ResolutionStrategy, ResolverStats};
pub use performance::{AgentRecord, PerformanceLedger, DEFAULT_SUCCESS_RATE};
pub use selector::{AwardResult, AwardSelector, ScoredBid, ScoringWeights, SelectorStats};
