use std::sync::Arc;

use tracing::debug;

use crate::models::StepRecord;
use crate::time::SimTime;
use crate::traits::StateStore;
use crate::SchedulerResult;

/// 按作业缓冲写入逐步记录
///
/// 续跑前必须先调用 [`StateStorage::repair`]，清除上一次（可能已崩溃的）尝试
/// 在恢复点之后写下的记录，之后再追加新记录。
pub struct StateStorage {
    store: Arc<dyn StateStore>,
    project: String,
    job: String,
    buffer: Vec<StepRecord>,
    batch_size: usize,
    written: u64,
}

impl StateStorage {
    pub fn new(store: Arc<dyn StateStore>, project: &str, job: &str, batch_size: usize) -> Self {
        Self {
            store,
            project: project.to_string(),
            job: job.to_string(),
            buffer: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            written: 0,
        }
    }

    pub async fn repair(&mut self, from_time: SimTime) -> SchedulerResult<u64> {
        self.buffer.retain(|r| r.time < from_time);
        let removed = self
            .store
            .repair(&self.project, &self.job, from_time)
            .await?;
        if removed > 0 {
            debug!(
                "作业 {}/{} 清理了 {} 条不小于 {} 的残留记录",
                self.project, self.job, removed, from_time
            );
        }
        Ok(removed)
    }

    pub async fn add(&mut self, record: StepRecord) -> SchedulerResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> SchedulerResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store
            .add_states(&self.project, &self.job, &self.buffer)
            .await?;
        self.written += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// 写出剩余缓冲并返回本次写入的记录数
    pub async fn close(mut self) -> SchedulerResult<u64> {
        self.flush().await?;
        Ok(self.written)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
