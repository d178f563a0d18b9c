use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use traffic_core::models::{Task, TaskOutcome, TaskType};
use traffic_core::traits::{LeaseStatus, StateStore, TaskExecutor};
use traffic_core::{SchedulerError, SchedulerResult, StateStorage};
use traffic_simulation::{run_batch, RandomSource};

/// 运行一批仿真步
///
/// 从存储读取作业定义、进度和当前快照，在阻塞线程池中推进模型，
/// 然后清理上一次尝试留下的记录并写入本批的逐步记录。
/// 快照与进度不在这里提交，它们随 taskFinished 交给调度器。
pub struct SimulationExecutor {
    store: Arc<dyn StateStore>,
    db_batch_length: usize,
}

impl SimulationExecutor {
    pub fn new(store: Arc<dyn StateStore>, db_batch_length: usize) -> Self {
        Self {
            store,
            db_batch_length,
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulationExecutor {
    fn name(&self) -> &str {
        "simulation"
    }

    fn supports_task_type(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Simulation
    }

    async fn execute(&self, task: &Task, lease: &LeaseStatus) -> SchedulerResult<TaskOutcome> {
        let (project, job_name) = (task.project(), task.job());
        let job = self
            .store
            .get_job(project, job_name)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(project, job_name))?;
        let progress = job.progress;
        let snapshot = if progress.done > 0 {
            self.store.get_full_state(project, job_name).await?
        } else {
            None
        };

        info!(
            "开始仿真任务 {}/{} [{}/{}]",
            project, job_name, progress.done, progress.total_steps
        );
        let definition = job.definition;
        let batch_length = definition.simulation_parameters.batch_length;
        let random = RandomSource::from_definition(&definition);
        let batch = tokio::task::spawn_blocking(move || {
            run_batch(
                &definition,
                snapshot.as_ref(),
                progress.done,
                progress.total_steps,
                batch_length,
                &random,
            )
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("仿真线程异常退出: {e}")))??;

        let (outcome, records) = batch.into_outcome()?;
        // 租约被回收后接手的Worker会重写同一时间段，之后不再写入
        lease.check()?;
        let mut storage =
            StateStorage::new(self.store.clone(), project, job_name, self.db_batch_length);
        if let Some(first) = records.first() {
            storage.repair(first.time).await?;
        }
        for record in records {
            lease.check()?;
            storage.add(record).await?;
        }
        lease.check()?;
        let written = storage.close().await?;
        debug!("作业 {}/{} 写入 {} 条逐步记录", project, job_name, written);

        Ok(outcome)
    }
}
