//! Announcement lifecycle and timed bid collection

pub mod collector;
pub mod manager;
pub mod record;
pub mod state;

pub use collector::{BidCollector, CollectionEvent, CollectorStats};
pub use manager::{ContractEvent, NegotiationManager};
pub use record::{BidCollection, Negotiation};
pub use state::{CollectionState, ContractState};
