use serde::{Deserialize, Serialize};

use super::task::TaskType;

/// 基础统计：每辆车通过时间（del 时刻 − add 时刻）的均值与标准差
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStatistics {
    pub cars_count: u64,
    pub finished_cars: u64,
    pub average_transit_time: f64,
    pub transit_time_std_dev: f64,
    pub average_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleTimeStatistics {
    pub cars_count: u64,
    pub idle_cars: u64,
    pub average_idle_time: f64,
    pub max_idle_time: f64,
    pub total_idle_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionThroughput {
    pub road: String,
    pub position: f64,
    pub total: u64,
    /// 按仿真小时分桶的通过车辆数
    pub per_hour: Vec<u64>,
    pub rate_per_hour: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputStatistics {
    pub positions: Vec<PositionThroughput>,
}

/// 一个统计阶段的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "result", rename_all = "camelCase")]
pub enum StatisticsResult {
    BasicStatistics(BasicStatistics),
    IdleTimes(IdleTimeStatistics),
    Throughput(ThroughputStatistics),
}

impl StatisticsResult {
    pub fn task_type(&self) -> TaskType {
        match self {
            StatisticsResult::BasicStatistics(_) => TaskType::BasicStatistics,
            StatisticsResult::IdleTimes(_) => TaskType::IdleTimes,
            StatisticsResult::Throughput(_) => TaskType::Throughput,
        }
    }
}
