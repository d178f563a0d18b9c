//! 仿真Worker：从调度器领取任务，执行仿真批次或统计阶段并上报结果

pub mod executors;
pub mod heartbeat;
pub mod service;
pub mod system_stats;

pub use executors::{ExecutorRegistry, SimulationExecutor, StatisticsExecutor};
pub use heartbeat::{HeartbeatManager, SignatureSlot};
pub use service::{PollOutcome, WorkerService};
pub use system_stats::collect_worker_stats;
