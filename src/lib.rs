//! Contract net task allocation.
//!
//! Requesters announce tasks, workers bid, and the engine awards each task to the best bid:
//! - [`negotiation`] runs the per-announcement negotiations and timed bid collections
//! - [`award`] scores bids and breaks ties
//! - [`progress`] tracks awarded work to completion
//! - [`coordinator`] ties the pieces into one protocol and drives decomposed composite tasks

pub mod award;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod progress;

pub use award::{AwardSelector, ConflictResolver, PerformanceLedger, ResolutionStrategy, ScoringWeights};
pub use config::AppConfig;
pub use coordinator::{
    ContractNetProtocol, Coordinator, CoordinatorEvent, EventPublisher, ProtocolEvent,
    TaskDecomposer, WorkerDispatch,
};
pub use domain::{AgentId, Announcement, AnnouncementParams, Bid, BidParams, Requirements, Task};
pub use error::{ContractNetError, Result};
pub use events::{EventHub, Listener, ListenerId};
pub use negotiation::{
    BidCollector, CollectionEvent, CollectionState, ContractEvent, ContractState,
    NegotiationManager,
};
pub use progress::{Checkpoint, ProgressEvent, TaskProgress, TaskStatus};
