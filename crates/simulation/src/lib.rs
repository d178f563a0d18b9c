//! 多车道交通微观仿真引擎
//!
//! 模型按固定步长推进，每一步先基于上一步状态为所有车辆做决策，再统一提交。
//! 批次运行器负责从快照恢复、运行若干步并产出新的快照。

pub mod batch;
pub mod elements;
pub mod model;
pub mod motion;
pub mod offline;
pub mod random;
pub mod snapshot;

pub use batch::{run_batch, BatchResult};
pub use model::Model;
pub use offline::{run_offline, CarSummary, OfflineSummary, OutputFormat};
pub use random::RandomSource;
pub use snapshot::ModelSnapshot;
