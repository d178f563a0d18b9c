use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use traffic_core::models::{
    CurrentTaskInfo, JobDefinition, JobProgress, LeaseSignature, Task, TaskDescriptor,
    TaskOutcome, TaskReport, TaskType,
};
use traffic_core::traits::{SchedulerService, StateStore};
use traffic_core::{SchedulerError, SchedulerResult};

use crate::lease_manager::TaskLeaseManager;

/// 调度器
///
/// 决定作业下一步需要的任务（仿真批次或统计阶段）并入队。作业进度只在
/// 通过租约校验的 `task_finished` 中推进，下一批次也只在此时入队，
/// 因此同一作业的批次严格串行。
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    leases: TaskLeaseManager,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, notification_interval_ms: u64) -> Self {
        Self {
            store,
            leases: TaskLeaseManager::new(notification_interval_ms),
        }
    }

    pub fn leases(&self) -> &TaskLeaseManager {
        &self.leases
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn load_progress(&self, project: &str, job: &str) -> SchedulerResult<JobProgress> {
        self.store
            .get_job(project, job)
            .await?
            .map(|j| j.progress)
            .ok_or_else(|| SchedulerError::job_not_found(project, job))
    }

    /// 入队；任务已存在时视为已调度
    async fn enqueue_once(&self, descriptor: TaskDescriptor) -> SchedulerResult<bool> {
        match self.leases.enqueue(descriptor).await {
            Ok(()) => Ok(true),
            Err(SchedulerError::DuplicateTask(d)) => {
                debug!("任务已在队列或执行中: {}", d);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 作业在当前进度下需要的任务：仿真未完成时为下一批次，否则为缺少的统计阶段
    fn next_tasks(project: &str, job: &str, progress: &JobProgress) -> Vec<TaskDescriptor> {
        if !progress.is_simulated() {
            return vec![TaskDescriptor::new(project, job, TaskType::Simulation)];
        }
        progress
            .missing_statistics()
            .into_iter()
            .map(|phase| TaskDescriptor::new(project, job, phase))
            .collect()
    }

    /// 为尚未完成的统计阶段入队，返回新入队的数量
    pub async fn add_statistics_task(&self, project: &str, job: &str) -> SchedulerResult<usize> {
        let progress = self.load_progress(project, job).await?;
        let missing = progress.missing_statistics();
        if missing.is_empty() {
            info!("作业 {}/{} 的统计已全部完成", project, job);
            return Ok(0);
        }

        let mut added = 0;
        for phase in missing {
            info!("添加统计任务: {}/{} {}", project, job, phase);
            if self
                .enqueue_once(TaskDescriptor::new(project, job, phase))
                .await?
            {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn commit_outcome(
        store: &Arc<dyn StateStore>,
        descriptor: &TaskDescriptor,
        outcome: TaskOutcome,
    ) -> SchedulerResult<JobProgress> {
        if outcome.task_type() != descriptor.task_type {
            return Err(SchedulerError::InvalidParams(format!(
                "任务 {} 的结果类型为 {}",
                descriptor,
                outcome.task_type()
            )));
        }
        match outcome {
            TaskOutcome::Simulation {
                from_step,
                steps_done,
                full_state,
                ..
            } => {
                store
                    .commit_simulation_batch(
                        &descriptor.project,
                        &descriptor.job,
                        from_step,
                        steps_done,
                        full_state,
                    )
                    .await
            }
            TaskOutcome::Statistics { result } => {
                store
                    .save_statistics(&descriptor.project, &descriptor.job, result)
                    .await
            }
        }
    }
}

#[async_trait]
impl SchedulerService for Scheduler {
    async fn get_task(
        &self,
        worker_id: &str,
        task_types: &[TaskType],
    ) -> SchedulerResult<Option<Task>> {
        self.leases.get_task(worker_id, task_types).await
    }

    async fn accept_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        self.leases.accept_task(worker_id, signature).await
    }

    async fn reject_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<()> {
        self.leases.reject_task(worker_id, signature).await
    }

    async fn task_in_progress(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        self.leases.task_in_progress(worker_id, signature).await
    }

    #[instrument(skip(self, report), fields(kind = %report.outcome.task_type()))]
    async fn task_finished(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
        report: TaskReport,
    ) -> SchedulerResult<()> {
        let TaskReport { outcome, worker } = report;
        let store = &self.store;
        // 后续任务由提交返回的进度决定，与租约移除一起在锁内入队，不再回读存储
        let (descriptor, progress) = self
            .leases
            .finish_task(worker_id, signature, |descriptor| async move {
                let progress = Self::commit_outcome(store, &descriptor, outcome).await?;
                let next = Self::next_tasks(&descriptor.project, &descriptor.job, &progress);
                Ok((progress, next))
            })
            .await?;

        info!(
            "作业 {}/{} 进度 {}/{}（Worker {}@{}，RSS {:?} KiB）",
            descriptor.project,
            descriptor.job,
            progress.done,
            progress.total_steps,
            worker_id,
            worker.host_name,
            worker.vm_rss_kib
        );
        if progress.is_complete() {
            info!("作业 {}/{} 已全部完成", descriptor.project, descriptor.job);
        }
        Ok(())
    }

    async fn restart_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<bool> {
        Ok(self.leases.restart_task(worker_id, signature).await)
    }

    async fn restart_tasks(&self, leases: &[(String, LeaseSignature)]) -> SchedulerResult<usize> {
        Ok(self.leases.restart_tasks(leases).await)
    }

    async fn get_current_tasks(&self) -> SchedulerResult<Vec<CurrentTaskInfo>> {
        Ok(self.leases.current_tasks().await)
    }

    /// 仿真未完成时入队下一批次，否则转为统计阶段调度
    #[instrument(skip(self))]
    async fn run_job(&self, project: &str, job: &str) -> SchedulerResult<()> {
        let progress = self.load_progress(project, job).await?;
        if progress.is_simulated() {
            self.add_statistics_task(project, job).await?;
            return Ok(());
        }

        info!(
            "添加仿真批次: {}/{} 进度 {}/{}",
            project, job, progress.done, progress.total_steps
        );
        for descriptor in Self::next_tasks(project, job, &progress) {
            self.enqueue_once(descriptor).await?;
        }
        Ok(())
    }

    async fn abort_job(&self, project: &str, job: &str) -> SchedulerResult<usize> {
        let removed = self.leases.abort_job(project, job).await;
        if removed == 0 {
            warn!("作业 {}/{} 没有可中止的任务", project, job);
        }
        Ok(removed)
    }

    async fn create_project(&self, name: &str) -> SchedulerResult<()> {
        self.store.create_project(name).await
    }

    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<JobProgress> {
        let job = self.store.add_job(project, name, definition).await?;
        info!(
            "新建作业 {}/{}: {} 步，{} 批",
            project, name, job.progress.total_steps, job.progress.batches
        );
        Ok(job.progress)
    }

    async fn job_progress(&self, project: &str, job: &str) -> SchedulerResult<JobProgress> {
        self.load_progress(project, job).await
    }
}
