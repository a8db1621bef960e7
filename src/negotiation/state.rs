//! Negotiation and collection state machines.
//!
//! Both enums own their transition table; every state change in the crate goes through
//! `transition`, which refuses anything the table does not list.

use serde::{Deserialize, Serialize};

use crate::error::{ContractNetError, Result};

/// State of a negotiation held by the `NegotiationManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    /// Open for bids
    Announced,
    /// A winner has been bound to the announcement
    Awarded,
    /// Awarded work finished successfully
    Completed,
    /// Awarded work failed, or the negotiation was cancelled
    Failed,
    /// Deadline passed, or no bids existed at selection time
    Expired,
}

impl ContractState {
    pub fn is_open(&self) -> bool {
        matches!(self, ContractState::Announced)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractState::Completed | ContractState::Failed | ContractState::Expired
        )
    }

    /// Open or awarded
    pub fn is_active(&self) -> bool {
        matches!(self, ContractState::Announced | ContractState::Awarded)
    }

    pub fn can_transition_to(&self, to: ContractState) -> bool {
        use ContractState::*;
        matches!(
            (self, to),
            (Announced, Awarded)
                | (Announced, Completed)
                | (Announced, Failed)
                | (Announced, Expired)
                | (Awarded, Completed)
                | (Awarded, Failed)
        )
    }

    pub fn transition(self, to: ContractState) -> Result<ContractState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(ContractNetError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ContractState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractState::Announced => write!(f, "announced"),
            ContractState::Awarded => write!(f, "awarded"),
            ContractState::Completed => write!(f, "completed"),
            ContractState::Failed => write!(f, "failed"),
            ContractState::Expired => write!(f, "expired"),
        }
    }
}

/// State of a timed bid collection held by the `BidCollector`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Open,
    /// Explicitly closed, awaiting a winner
    Closed,
    /// Winner recorded
    Completed,
    /// Timed out while open
    Expired,
    Cancelled,
}

impl CollectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, CollectionState::Open)
    }

    /// No further decision can be made
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            CollectionState::Completed | CollectionState::Expired | CollectionState::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: CollectionState) -> bool {
        use CollectionState::*;
        matches!(
            (self, to),
            (Open, Closed)
                | (Open, Completed)
                | (Open, Expired)
                | (Open, Cancelled)
                | (Closed, Completed)
                | (Closed, Cancelled)
        )
    }

    pub fn transition(self, to: CollectionState) -> Result<CollectionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(ContractNetError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionState::Open => write!(f, "open"),
            CollectionState::Closed => write!(f, "closed"),
            CollectionState::Completed => write!(f, "completed"),
            CollectionState::Expired => write!(f, "expired"),
            CollectionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_contract_states_are_final() {
        use ContractState::*;
        for terminal in [Completed, Failed, Expired] {
            assert!(terminal.is_terminal());
            for to in [Announced, Awarded, Completed, Failed, Expired] {
                assert!(terminal.transition(to).is_err());
            }
        }
    }

    #[test]
    fn awarded_only_finishes() {
        use ContractState::*;
        assert!(Awarded.can_transition_to(Completed));
        assert!(Awarded.can_transition_to(Failed));
        assert!(!Awarded.can_transition_to(Expired));
        assert!(!Awarded.can_transition_to(Announced));
        assert!(Awarded.is_active() && !Awarded.is_open());
    }

    #[test]
    fn closed_collection_can_still_complete() {
        use CollectionState::*;
        assert_eq!(Closed.transition(Completed).unwrap(), Completed);
        assert!(Closed.transition(Expired).is_err());
        assert!(Expired.transition(Closed).is_err());
        assert!(!Closed.is_complete());
        assert!(Cancelled.is_complete());
    }
}
