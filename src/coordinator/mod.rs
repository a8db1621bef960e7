//! Protocol facade and composite task coordination
//!
//! [`ContractNetProtocol`] wires the negotiation manager, bid collector, award selector and
//! progress trackers into one announce → bid → award → report cycle. [`Coordinator`] sits on
//! top and runs that cycle for every sub-task of a decomposed composite task.

pub mod collaborators;
pub mod coordinator;
pub mod protocol;
pub mod state;

pub use collaborators::{
    EventPublisher, IdentityDecomposer, LoggingDispatch, TaskDecomposer, WorkerDispatch,
};
pub use coordinator::{Coordinator, CoordinatorEvent, ReassignmentCandidate};
pub use protocol::{
    progress_task_id, ContractNetProtocol, MaintenanceReport, ProtocolEvent, ProtocolStats,
};
pub use state::{CoordinatedTask, CoordinationState, SubTaskAllocation};
