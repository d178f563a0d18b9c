use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use traffic_core::models::LeaseSignature;
use traffic_core::traits::{LeaseStatus, SchedulerService};

/// 当前租约签名，心跳和结果上报共用
///
/// 持锁期间签名不会被另一方轮换；槽位为空表示租约已丢失。
pub type SignatureSlot = Arc<Mutex<Option<LeaseSignature>>>;

/// 任务执行期间定期续约的后台任务
pub struct HeartbeatManager {
    handle: JoinHandle<()>,
}

impl HeartbeatManager {
    pub fn start(
        scheduler: Arc<dyn SchedulerService>,
        worker_id: String,
        slot: SignatureSlot,
        lease: LeaseStatus,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut current = slot.lock().await;
                let Some(signature) = current.clone() else {
                    debug!("Worker {} 租约已丢失，停止心跳", worker_id);
                    break;
                };
                match scheduler.task_in_progress(&worker_id, &signature).await {
                    Ok(renewed) => {
                        debug!("Worker {} 续约成功", worker_id);
                        *current = Some(renewed);
                    }
                    Err(e) if e.is_stale() => {
                        warn!("Worker {} 的租约已被回收: {}", worker_id, e);
                        *current = None;
                        lease.mark_lost();
                        break;
                    }
                    // 连接失败时继续工作，等待下一次心跳
                    Err(e) => warn!("Worker {} 心跳失败: {}", worker_id, e),
                }
            }
        });
        Self { handle }
    }

    /// 停止心跳；调用方应持有签名锁，避免与进行中的续约交错
    pub fn stop(self) {
        self.handle.abort();
    }
}
