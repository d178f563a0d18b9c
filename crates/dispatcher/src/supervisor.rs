use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use traffic_core::config::SupervisorConfig;
use traffic_core::models::{CurrentTaskInfo, LeaseSignature};
use traffic_core::traits::SchedulerService;
use traffic_core::SchedulerResult;

/// 租约超时监督
///
/// 定期读取调度器的当前租约，把超过 `restart_task_timeout_seconds` 未更新的租约
/// 用观察到的签名强制放回队列。若Worker在此期间续约，签名不再匹配，回收被拒绝。
pub struct Supervisor {
    scheduler: Arc<dyn SchedulerService>,
    config: SupervisorConfig,
    running: Arc<RwLock<bool>>,
}

impl Supervisor {
    pub fn new(scheduler: Arc<dyn SchedulerService>, config: SupervisorConfig) -> Self {
        Self {
            scheduler,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.restart_task_timeout_seconds as i64)
    }

    /// 找出最后更新时间早于 `now - timeout` 的租约
    pub fn find_stale_tasks(
        &self,
        tasks: &[CurrentTaskInfo],
        now: DateTime<Utc>,
    ) -> Vec<CurrentTaskInfo> {
        let timeout = self.timeout();
        tasks
            .iter()
            .filter(|t| now - t.last_update > timeout)
            .cloned()
            .collect()
    }

    /// 执行一轮检查，返回成功回收的租约数量
    pub async fn check_tasks(&self) -> SchedulerResult<usize> {
        let tasks = self.scheduler.get_current_tasks().await?;
        let stale = self.find_stale_tasks(&tasks, Utc::now());
        if stale.is_empty() {
            debug!("当前 {} 个租约均未超时", tasks.len());
            return Ok(0);
        }

        for task in &stale {
            warn!(
                "任务 {}/{} ({}) 超时，Worker {} 最后更新于 {}",
                task.project, task.job, task.task_type, task.worker_id, task.last_update
            );
        }
        let leases: Vec<(String, LeaseSignature)> = stale
            .iter()
            .map(|t| (t.worker_id.clone(), t.signature.clone()))
            .collect();
        let restarted = self.scheduler.restart_tasks(&leases).await?;
        if restarted < leases.len() {
            info!(
                "{} 个超时租约中有 {} 个已被续约或完成，未回收",
                leases.len(),
                leases.len() - restarted
            );
        }
        Ok(restarted)
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// 监督循环，直到收到关闭信号或 [`Supervisor::stop`]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        *self.running.write().await = true;
        let interval = Duration::from_secs(self.config.check_interval_seconds);
        info!(
            "启动任务监督: 检查间隔 {}s，超时 {}s",
            self.config.check_interval_seconds, self.config.restart_task_timeout_seconds
        );

        loop {
            if !self.is_running().await {
                info!("收到停止信号，退出任务监督循环");
                break;
            }

            match self.check_tasks().await {
                Ok(0) => {}
                Ok(n) => info!("回收了 {} 个超时任务", n),
                Err(e) if e.is_retryable() => warn!("检查任务时出现暂时性错误: {}", e),
                Err(e) => error!("检查任务失败: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.recv() => {
                    info!("任务监督收到关闭信号");
                    break;
                }
            }
        }

        *self.running.write().await = false;
    }
}
