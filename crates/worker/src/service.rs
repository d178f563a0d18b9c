use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use traffic_core::config::WorkerConfig;
use traffic_core::models::{LeaseSignature, Task, TaskOutcome, TaskReport, TaskType};
use traffic_core::traits::{LeaseStatus, SchedulerService};
use traffic_core::{SchedulerError, SchedulerResult};

use crate::executors::ExecutorRegistry;
use crate::heartbeat::{HeartbeatManager, SignatureSlot};
use crate::system_stats::collect_worker_stats;

/// 一次轮询的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 队列中没有可执行的任务
    Idle,
    /// 任务已执行并成功上报
    Finished(TaskType),
    /// 拿到了任务但没有产生被接受的结果（拒绝、租约丢失、执行失败）
    Abandoned(TaskType),
}

/// Worker主循环
///
/// 轮询调度器取任务，确认后开启心跳并执行，最后在签名锁内上报结果。
/// 任何时候出现签名失效，都说明任务已经交给了别人，本地结果直接丢弃。
pub struct WorkerService {
    worker_id: String,
    scheduler: Arc<dyn SchedulerService>,
    registry: ExecutorRegistry,
    config: WorkerConfig,
    running: Arc<RwLock<bool>>,
}

impl WorkerService {
    pub fn new(
        scheduler: Arc<dyn SchedulerService>,
        registry: ExecutorRegistry,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            worker_id,
            scheduler,
            registry,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    fn check_interval(&self) -> Duration {
        Duration::from_millis(self.config.check_interval_ms)
    }

    /// 运行直到收到关闭信号；正在执行的任务会先完成并上报
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        *self.running.write().await = true;
        let types = self.registry.supported_types();
        info!("Worker {} 启动，支持的任务类型: {:?}", self.worker_id, types);

        loop {
            if !self.is_running().await {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(PollOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!("Worker {} 轮询失败: {}", self.worker_id, e);
                    true
                }
            };
            if !idle {
                continue;
            }

            debug!("Worker {} 暂无任务，等待 {:?}", self.worker_id, self.check_interval());
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval()) => {}
                _ = shutdown.recv() => {
                    info!("Worker {} 收到关闭信号", self.worker_id);
                    break;
                }
            }
        }

        *self.running.write().await = false;
        info!("Worker {} 已停止", self.worker_id);
    }

    /// 取一个任务并执行到底
    pub async fn poll_once(&self) -> SchedulerResult<PollOutcome> {
        let types = self.registry.supported_types();
        let Some(task) = self.scheduler.get_task(&self.worker_id, &types).await? else {
            return Ok(PollOutcome::Idle);
        };
        let task_type = task.task_type();

        let Some(executor) = self.registry.get(task_type) else {
            warn!("Worker {} 没有 {} 执行器，拒绝任务", self.worker_id, task_type);
            self.scheduler
                .reject_task(&self.worker_id, &task.signature)
                .await?;
            return Ok(PollOutcome::Abandoned(task_type));
        };

        let signature = match self
            .scheduler
            .accept_task(&self.worker_id, &task.signature)
            .await
        {
            Ok(signature) => signature,
            Err(e) if e.is_stale() => {
                warn!("Worker {} 确认任务失败，租约已失效: {}", self.worker_id, e);
                return Ok(PollOutcome::Abandoned(task_type));
            }
            Err(e) => return Err(e),
        };

        let slot: SignatureSlot = Arc::new(Mutex::new(Some(signature)));
        let lease = LeaseStatus::new(self.worker_id.clone());
        let heartbeat = HeartbeatManager::start(
            self.scheduler.clone(),
            self.worker_id.clone(),
            slot.clone(),
            lease.clone(),
            Duration::from_millis(task.notification_interval_ms.max(1)),
        );

        let result = executor.execute(&task, &lease).await;

        let mut current = slot.lock().await;
        heartbeat.stop();
        let Some(signature) = current.take() else {
            warn!(
                "Worker {} 在执行 {} 期间失去租约，丢弃结果",
                self.worker_id, task.descriptor
            );
            return Ok(PollOutcome::Abandoned(task_type));
        };

        match result {
            Ok(outcome) => {
                if self.report_finished(&task, &signature, outcome).await {
                    Ok(PollOutcome::Finished(task_type))
                } else {
                    Ok(PollOutcome::Abandoned(task_type))
                }
            }
            Err(e) => {
                self.handle_failure(&task, &signature, e).await;
                Ok(PollOutcome::Abandoned(task_type))
            }
        }
    }

    /// 上报结果，暂时性错误重试至 `finish_retry_limit` 次
    #[instrument(skip_all, fields(worker = %self.worker_id, task = %task.descriptor))]
    async fn report_finished(
        &self,
        task: &Task,
        signature: &LeaseSignature,
        outcome: TaskOutcome,
    ) -> bool {
        let report = TaskReport {
            outcome,
            worker: collect_worker_stats(),
        };
        let attempts = self.config.finish_retry_limit.max(1);

        for attempt in 1..=attempts {
            match self
                .scheduler
                .task_finished(&self.worker_id, signature, report.clone())
                .await
            {
                Ok(()) => {
                    info!("任务完成并已上报");
                    return true;
                }
                Err(e) if e.is_stale() => {
                    warn!("上报被拒绝，租约已转给其他Worker: {}", e);
                    return false;
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("上报失败（第 {}/{} 次），稍后重试: {}", attempt, attempts, e);
                    tokio::time::sleep(self.check_interval()).await;
                }
                Err(e) => {
                    error!("上报失败，放弃结果: {}", e);
                    return false;
                }
            }
        }
        false
    }

    /// 暂时性失败把任务放回队列，其余错误中止整个作业
    async fn handle_failure(&self, task: &Task, signature: &LeaseSignature, err: SchedulerError) {
        if err.is_retryable() {
            warn!("任务 {} 执行失败，放回队列: {}", task.descriptor, err);
            if let Err(e) = self.scheduler.restart_task(&self.worker_id, signature).await {
                warn!("放回任务 {} 失败: {}", task.descriptor, e);
            }
            return;
        }

        error!("任务 {} 执行失败，中止作业: {}", task.descriptor, err);
        if let Err(e) = self.scheduler.abort_job(task.project(), task.job()).await {
            warn!("中止作业 {}/{} 失败: {}", task.project(), task.job(), e);
        }
    }
}
