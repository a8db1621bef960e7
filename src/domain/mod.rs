pub mod announcement;
pub mod bid;
pub mod task;

pub use announcement::*;
pub use bid::*;
pub use task::*;
