//! 任务执行器接口
//!
//! Worker按任务类型从注册表中查找执行器。仿真执行器运行一批仿真步并写入逐步记录，
//! 统计执行器读取记录并计算一个统计阶段。执行结果通过 taskFinished 交回调度器，
//! 由调度器在校验租约后提交进度。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Task, TaskOutcome, TaskType};
use crate::{SchedulerError, SchedulerResult};

/// 执行期间的租约状态
///
/// 心跳发现租约被回收后标记丢失，执行器在写入共享记录前检查，
/// 避免覆盖已接手该任务的Worker写入的记录。
#[derive(Debug, Clone)]
pub struct LeaseStatus {
    worker_id: String,
    lost: Arc<AtomicBool>,
}

impl LeaseStatus {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// 租约已丢失时返回 `StaleLease`
    pub fn check(&self) -> SchedulerResult<()> {
        if self.is_lost() {
            return Err(SchedulerError::stale_lease(&self.worker_id));
        }
        Ok(())
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn supports_task_type(&self, task_type: TaskType) -> bool;

    async fn execute(&self, task: &Task, lease: &LeaseStatus) -> SchedulerResult<TaskOutcome>;
}
