//! Background subagents: task records, the manager that runs them and the
//! messenger that carries adjustment requests back to the main loop.

mod manager;
mod messenger;
mod task;

pub use manager::{SpawnRequest, SubagentManager};
pub use messenger::SubagentMessenger;
pub use task::{SubagentStatus, SubagentTask, default_label};
