//! Execution tracking for awarded work

pub mod checkpoint;
pub mod tracker;

pub use checkpoint::Checkpoint;
pub use tracker::{ProgressEvent, ProgressSnapshot, TaskProgress, TaskStatus};
