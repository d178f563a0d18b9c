pub mod scheduler;
pub mod state_store;
pub mod task_executor;

pub use scheduler::*;
pub use state_store::*;
pub use task_executor::*;
