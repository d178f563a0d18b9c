use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use traffic_core::models::{
    CurrentTaskInfo, LeaseSignature, LeaseState, Task, TaskDescriptor, TaskType,
};
use traffic_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
struct Lease {
    descriptor: TaskDescriptor,
    signature: LeaseSignature,
    issued_at: DateTime<Utc>,
    state: LeaseState,
}

/// 等待队列与当前租约，由同一把锁保护
#[derive(Debug, Default)]
struct LeaseTable {
    waiting: VecDeque<TaskDescriptor>,
    leases: HashMap<String, Lease>,
}

impl LeaseTable {
    fn contains(&self, descriptor: &TaskDescriptor) -> bool {
        self.waiting.contains(descriptor) || self.leases.values().any(|l| &l.descriptor == descriptor)
    }

    /// 校验调用方出示的签名是否为该Worker最近一次签发的签名
    fn lease_mut(
        &mut self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<&mut Lease> {
        let lease = self
            .leases
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::unknown_worker(worker_id))?;
        if &lease.signature != signature {
            counter!("traffic_stale_lease_rejections_total").increment(1);
            return Err(SchedulerError::stale_lease(worker_id));
        }
        Ok(lease)
    }

    fn report_sizes(&self) {
        gauge!("traffic_waiting_tasks").set(self.waiting.len() as f64);
        gauge!("traffic_current_leases").set(self.leases.len() as f64);
    }
}

/// 任务租约管理器
///
/// 每个Worker同一时刻最多持有一个租约。租约只在调用方出示最近一次签发的签名时有效，
/// 签名在 accept 和每次心跳时轮换，因此被回收的租约不会被原Worker迟到的心跳复活。
pub struct TaskLeaseManager {
    table: Mutex<LeaseTable>,
    sequence: AtomicU64,
    notification_interval_ms: u64,
}

impl TaskLeaseManager {
    pub fn new(notification_interval_ms: u64) -> Self {
        Self {
            table: Mutex::new(LeaseTable::default()),
            sequence: AtomicU64::new(1),
            notification_interval_ms,
        }
    }

    fn issue_signature(&self) -> (LeaseSignature, DateTime<Utc>) {
        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        (LeaseSignature::issue(now, seq), now)
    }

    /// 任务入队；相同描述已在队列或执行中时返回 `DuplicateTask`
    pub async fn enqueue(&self, descriptor: TaskDescriptor) -> SchedulerResult<()> {
        let mut table = self.table.lock().await;
        if table.contains(&descriptor) {
            return Err(SchedulerError::DuplicateTask(descriptor.to_string()));
        }
        debug!("任务入队: {}", descriptor);
        counter!("traffic_tasks_enqueued_total", "type" => descriptor.task_type.as_str())
            .increment(1);
        table.waiting.push_back(descriptor);
        table.report_sizes();
        Ok(())
    }

    /// 取出队列中第一个匹配类型的任务并签发租约
    pub async fn get_task(
        &self,
        worker_id: &str,
        task_types: &[TaskType],
    ) -> SchedulerResult<Option<Task>> {
        let mut table = self.table.lock().await;
        if table.leases.contains_key(worker_id) {
            return Err(SchedulerError::WorkerHasTask {
                worker_id: worker_id.to_string(),
            });
        }
        let Some(index) = table
            .waiting
            .iter()
            .position(|d| task_types.contains(&d.task_type))
        else {
            return Ok(None);
        };
        let Some(descriptor) = table.waiting.remove(index) else {
            return Ok(None);
        };

        let (signature, issued_at) = self.issue_signature();
        info!("下发任务 {} 给Worker {}", descriptor, worker_id);
        counter!("traffic_tasks_leased_total", "type" => descriptor.task_type.as_str())
            .increment(1);
        table.leases.insert(
            worker_id.to_string(),
            Lease {
                descriptor: descriptor.clone(),
                signature: signature.clone(),
                issued_at,
                state: LeaseState::Offered,
            },
        );
        table.report_sizes();

        Ok(Some(Task {
            descriptor,
            signature,
            notification_interval_ms: self.notification_interval_ms,
        }))
    }

    pub async fn accept_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        let (next, now) = self.issue_signature();
        let mut table = self.table.lock().await;
        let lease = table.lease_mut(worker_id, signature)?;
        if lease.state != LeaseState::Offered {
            return Err(SchedulerError::stale_lease(worker_id));
        }
        lease.state = LeaseState::Running;
        lease.signature = next.clone();
        lease.issued_at = now;
        debug!("Worker {} 确认任务 {}", worker_id, lease.descriptor);
        Ok(next)
    }

    /// 放弃已下发但未确认的任务，任务回到队列
    pub async fn reject_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<()> {
        let mut table = self.table.lock().await;
        let lease = table.lease_mut(worker_id, signature)?;
        if lease.state != LeaseState::Offered {
            return Err(SchedulerError::stale_lease(worker_id));
        }
        if let Some(lease) = table.leases.remove(worker_id) {
            info!("Worker {} 拒绝任务 {}", worker_id, lease.descriptor);
            table.waiting.push_back(lease.descriptor);
        }
        table.report_sizes();
        Ok(())
    }

    /// 心跳续约，返回新签名
    pub async fn task_in_progress(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        let (next, now) = self.issue_signature();
        let mut table = self.table.lock().await;
        let lease = table.lease_mut(worker_id, signature)?;
        lease.signature = next.clone();
        lease.issued_at = now;
        lease.state = LeaseState::Running;
        debug!("Worker {} 续约任务 {}", worker_id, lease.descriptor);
        Ok(next)
    }

    /// 在持锁状态下校验租约并执行提交；提交成功后移除租约并入队后续任务
    ///
    /// `commit` 返回提交结果和作业接下来需要的任务。租约移除与后续任务入队在同一把锁内完成，
    /// 不会出现批次已提交而作业既无等待任务也无租约的中间状态。已在队列或执行中的后续任务跳过。
    /// 提交失败时租约保持不变，持有者可以用同一签名重试。
    ///
    /// 提交期间持有租约表的锁，其他Worker的心跳和取任务会等待这一次存储写入。
    /// 快照在Worker端已序列化为JSON值，锁内只剩一次事务提交。
    pub async fn finish_task<T, F, Fut>(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
        commit: F,
    ) -> SchedulerResult<(TaskDescriptor, T)>
    where
        F: FnOnce(TaskDescriptor) -> Fut,
        Fut: Future<Output = SchedulerResult<(T, Vec<TaskDescriptor>)>>,
    {
        let mut table = self.table.lock().await;
        let descriptor = table.lease_mut(worker_id, signature)?.descriptor.clone();
        let (value, follow_ups) = commit(descriptor.clone()).await?;
        table.leases.remove(worker_id);
        counter!("traffic_tasks_finished_total", "type" => descriptor.task_type.as_str())
            .increment(1);
        info!("Worker {} 完成任务 {}", worker_id, descriptor);

        for next in follow_ups {
            if table.contains(&next) {
                debug!("后续任务已在队列或执行中: {}", next);
                continue;
            }
            info!("入队后续任务: {}", next);
            counter!("traffic_tasks_enqueued_total", "type" => next.task_type.as_str())
                .increment(1);
            table.waiting.push_back(next);
        }
        table.report_sizes();
        Ok((descriptor, value))
    }

    /// 强制回收租约并将任务放回队列；Worker未知或签名不匹配时返回 `false`
    pub async fn restart_task(&self, worker_id: &str, signature: &LeaseSignature) -> bool {
        let mut table = self.table.lock().await;
        match table.lease_mut(worker_id, signature) {
            Ok(_) => {}
            Err(e) => {
                warn!("无法重启Worker {} 的任务: {}", worker_id, e);
                return false;
            }
        }
        let Some(lease) = table.leases.remove(worker_id) else {
            return false;
        };
        info!("重启任务 {}（原Worker {}）", lease.descriptor, worker_id);
        counter!("traffic_tasks_restarted_total", "type" => lease.descriptor.task_type.as_str())
            .increment(1);
        table.waiting.push_back(lease.descriptor);
        table.report_sizes();
        true
    }

    pub async fn restart_tasks(&self, leases: &[(String, LeaseSignature)]) -> usize {
        let mut restarted = 0;
        for (worker_id, signature) in leases {
            if self.restart_task(worker_id, signature).await {
                restarted += 1;
            }
        }
        restarted
    }

    /// 移除作业的全部等待任务和租约
    pub async fn abort_job(&self, project: &str, job: &str) -> usize {
        let mut table = self.table.lock().await;
        let waiting_before = table.waiting.len();
        table.waiting.retain(|d| !d.belongs_to(project, job));
        let leases_before = table.leases.len();
        table
            .leases
            .retain(|_, lease| !lease.descriptor.belongs_to(project, job));
        let removed = (waiting_before - table.waiting.len()) + (leases_before - table.leases.len());
        table.report_sizes();
        if removed > 0 {
            info!("中止作业 {}/{}，移除 {} 个任务", project, job, removed);
        }
        removed
    }

    pub async fn current_tasks(&self) -> Vec<CurrentTaskInfo> {
        let table = self.table.lock().await;
        let mut tasks: Vec<CurrentTaskInfo> = table
            .leases
            .iter()
            .map(|(worker_id, lease)| CurrentTaskInfo {
                worker_id: worker_id.clone(),
                signature: lease.signature.clone(),
                last_update: lease.issued_at,
                project: lease.descriptor.project.clone(),
                job: lease.descriptor.job.clone(),
                task_type: lease.descriptor.task_type,
                state: lease.state,
            })
            .collect();
        tasks.sort_by(|a, b| a.last_update.cmp(&b.last_update));
        tasks
    }

    pub async fn waiting_len(&self) -> usize {
        self.table.lock().await.waiting.len()
    }

    pub async fn task_exists(&self, descriptor: &TaskDescriptor) -> bool {
        self.table.lock().await.contains(descriptor)
    }
}
