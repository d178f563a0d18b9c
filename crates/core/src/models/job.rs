use serde::{Deserialize, Serialize};

use super::definition::JobDefinition;
use super::statistics::{
    BasicStatistics, IdleTimeStatistics, StatisticsResult, ThroughputStatistics,
};
use super::task::TaskType;
use crate::{SchedulerError, SchedulerResult};

/// 一次仿真运行
///
/// 完整快照（currentFullState）体积较大，不随作业一起加载，
/// 通过 `StateStore::get_full_state` 单独读取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub project: String,
    pub name: String,
    pub definition: JobDefinition,
    pub progress: JobProgress,
    #[serde(default)]
    pub statistics: JobStatistics,
}

/// 作业进度
///
/// `done` 单调不减且不超过 `total_steps`；只能通过 [`JobProgress::advance`] 推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub done: u64,
    pub total_steps: u64,
    pub batches: u64,
    pub basic_statistics: bool,
    pub idle_times: bool,
    pub throughput: bool,
    pub full_statistics: bool,
}

impl JobProgress {
    pub fn for_definition(definition: &JobDefinition) -> SchedulerResult<Self> {
        Ok(Self {
            done: 0,
            total_steps: definition.total_steps()?,
            batches: definition.batches()?,
            basic_statistics: false,
            idle_times: false,
            throughput: false,
            full_statistics: false,
        })
    }

    pub fn is_simulated(&self) -> bool {
        self.done >= self.total_steps
    }

    pub fn is_complete(&self) -> bool {
        self.is_simulated() && self.full_statistics
    }

    pub fn remaining_steps(&self) -> u64 {
        self.total_steps.saturating_sub(self.done)
    }

    pub fn phase_done(&self, task_type: TaskType) -> bool {
        match task_type {
            TaskType::Simulation => self.is_simulated(),
            TaskType::BasicStatistics => self.basic_statistics,
            TaskType::IdleTimes => self.idle_times,
            TaskType::Throughput => self.throughput,
        }
    }

    pub fn missing_statistics(&self) -> Vec<TaskType> {
        TaskType::STATISTICS
            .into_iter()
            .filter(|t| !self.phase_done(*t))
            .collect()
    }

    /// 提交一批仿真步
    ///
    /// 批次必须从当前 `done` 开始；过期或重复的提交返回 `ProgressConflict`，不修改进度。
    pub fn advance(&mut self, from_step: u64, steps: u64) -> SchedulerResult<()> {
        if from_step != self.done {
            return Err(SchedulerError::ProgressConflict(format!(
                "批次起点 {from_step} 与当前进度 {} 不一致",
                self.done
            )));
        }
        if steps == 0 || self.is_simulated() {
            return Err(SchedulerError::ProgressConflict(format!(
                "批次没有推进进度: done={}, total={}, steps={steps}",
                self.done, self.total_steps
            )));
        }
        self.done = (self.done + steps).min(self.total_steps);
        Ok(())
    }

    pub fn mark_phase(&mut self, phase: TaskType) -> SchedulerResult<()> {
        if !self.is_simulated() {
            return Err(SchedulerError::ProgressConflict(format!(
                "仿真尚未完成，不能提交统计阶段 {phase}"
            )));
        }
        match phase {
            TaskType::Simulation => {
                return Err(SchedulerError::ProgressConflict(
                    "仿真阶段不能标记为统计完成".to_string(),
                ))
            }
            TaskType::BasicStatistics => self.basic_statistics = true,
            TaskType::IdleTimes => self.idle_times = true,
            TaskType::Throughput => self.throughput = true,
        }
        self.full_statistics = self.basic_statistics && self.idle_times && self.throughput;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_times: Option<IdleTimeStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<ThroughputStatistics>,
}

impl JobStatistics {
    pub fn apply(&mut self, result: StatisticsResult) {
        match result {
            StatisticsResult::BasicStatistics(s) => self.basic = Some(s),
            StatisticsResult::IdleTimes(s) => self.idle_times = Some(s),
            StatisticsResult::Throughput(s) => self.throughput = Some(s),
        }
    }
}
