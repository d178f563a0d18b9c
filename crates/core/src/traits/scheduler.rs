use async_trait::async_trait;

use crate::models::{
    CurrentTaskInfo, JobDefinition, JobProgress, LeaseSignature, Task, TaskReport, TaskType,
};
use crate::SchedulerResult;

/// 调度服务接口
///
/// Worker和Supervisor只通过此接口与调度器交互。本地实现是调度器本身，
/// 远程实现是 JSON-RPC 客户端。所有租约操作都要求出示最近一次签发的签名。
#[async_trait]
pub trait SchedulerService: Send + Sync {
    /// 取出队列中第一个匹配类型的任务；队列为空时返回 `None`，不阻塞
    async fn get_task(
        &self,
        worker_id: &str,
        task_types: &[TaskType],
    ) -> SchedulerResult<Option<Task>>;

    async fn accept_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature>;

    async fn reject_task(&self, worker_id: &str, signature: &LeaseSignature)
        -> SchedulerResult<()>;

    /// 心跳：续约并返回新签名
    async fn task_in_progress(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature>;

    async fn task_finished(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
        report: TaskReport,
    ) -> SchedulerResult<()>;

    /// 将租约放回队列；签名不匹配时返回 `false`
    async fn restart_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<bool>;

    async fn restart_tasks(&self, leases: &[(String, LeaseSignature)]) -> SchedulerResult<usize>;

    async fn get_current_tasks(&self) -> SchedulerResult<Vec<CurrentTaskInfo>>;

    async fn run_job(&self, project: &str, job: &str) -> SchedulerResult<()>;

    /// 移除作业的等待任务和租约，返回移除数量
    async fn abort_job(&self, project: &str, job: &str) -> SchedulerResult<usize>;

    async fn create_project(&self, name: &str) -> SchedulerResult<()>;

    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<JobProgress>;

    async fn job_progress(&self, project: &str, job: &str) -> SchedulerResult<JobProgress>;
}
