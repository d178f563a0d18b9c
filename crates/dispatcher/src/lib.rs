//! 调度侧组件：任务租约管理、作业调度和租约超时监督

pub mod lease_manager;
pub mod scheduler;
pub mod supervisor;

pub use lease_manager::TaskLeaseManager;
pub use scheduler::Scheduler;
pub use supervisor::Supervisor;
