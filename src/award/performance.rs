//! Per-agent completion ledger
//!
//! Fed by explicit completion reports. Read by performance-based tie breaking and by the
//! history-aware award variant.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::AgentId;

/// Success rate assumed for agents without history
pub const DEFAULT_SUCCESS_RATE: f64 = 0.5;

/// Completion history for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub completed: u64,
    pub failed: u64,
    /// Sum of reported completion times
    pub total_time: Duration,
}

impl AgentRecord {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            completed: 0,
            failed: 0,
            total_time: Duration::ZERO,
        }
    }

    pub fn total_tasks(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        match self.total_tasks() {
            0 => DEFAULT_SUCCESS_RATE,
            n => self.completed as f64 / n as f64,
        }
    }

    /// Mean time of successful completions
    pub fn average_completion_time(&self) -> Option<Duration> {
        match self.completed {
            0 => None,
            n => Some(self.total_time / n as u32),
        }
    }
}

#[derive(Debug, Default)]
pub struct PerformanceLedger {
    records: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(&self, agent_id: AgentId, success: bool, duration: Duration) {
        let mut records = self.records.write();
        let record = records
            .entry(agent_id)
            .or_insert_with(|| AgentRecord::new(agent_id));
        if success {
            record.completed += 1;
            record.total_time += duration;
        } else {
            record.failed += 1;
        }
    }

    pub fn get(&self, agent_id: AgentId) -> Option<AgentRecord> {
        self.records.read().get(&agent_id).cloned()
    }

    pub fn has_history(&self, agent_id: AgentId) -> bool {
        self.records
            .read()
            .get(&agent_id)
            .is_some_and(|r| r.total_tasks() > 0)
    }

    /// Success rate, or the default when the agent has no history
    pub fn success_rate(&self, agent_id: AgentId) -> f64 {
        self.records
            .read()
            .get(&agent_id)
            .map(AgentRecord::success_rate)
            .unwrap_or(DEFAULT_SUCCESS_RATE)
    }

    pub fn snapshot(&self) -> Vec<AgentRecord> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by_key(|r| r.agent_id);
        all
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unknown_agent_gets_default_rate() {
        let ledger = PerformanceLedger::new();
        let agent = Uuid::new_v4();
        assert_eq!(ledger.success_rate(agent), DEFAULT_SUCCESS_RATE);
        assert!(!ledger.has_history(agent));
    }

    #[test]
    fn tracks_rate_and_average_time() {
        let ledger = PerformanceLedger::new();
        let agent = Uuid::new_v4();
        ledger.record_completion(agent, true, Duration::from_secs(4));
        ledger.record_completion(agent, true, Duration::from_secs(2));
        ledger.record_completion(agent, false, Duration::from_secs(9));

        let record = ledger.get(agent).unwrap();
        assert_eq!(record.total_tasks(), 3);
        assert!((record.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.average_completion_time(), Some(Duration::from_secs(3)));
        assert!(ledger.has_history(agent));

        ledger.clear();
        assert!(ledger.is_empty());
    }
}
