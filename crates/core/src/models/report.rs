use serde::{Deserialize, Serialize};

use super::statistics::StatisticsResult;
use super::task::TaskType;
use crate::time::SimTime;

/// Worker进程的资源信息，随 taskFinished 一同上报
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub host_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_peak_kib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_rss_kib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskOutcome {
    /// 一批仿真步完成，附带批末完整快照
    #[serde(rename_all = "camelCase")]
    Simulation {
        from_step: u64,
        steps_done: u64,
        final_time: SimTime,
        full_state: serde_json::Value,
    },
    Statistics { result: StatisticsResult },
}

impl TaskOutcome {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskOutcome::Simulation { .. } => TaskType::Simulation,
            TaskOutcome::Statistics { result } => result.task_type(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    #[serde(default)]
    pub worker: WorkerStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::statistics::IdleTimeStatistics;

    #[test]
    fn test_report_json_shape() {
        let report = TaskReport {
            outcome: TaskOutcome::Simulation {
                from_step: 50,
                steps_done: 50,
                final_time: SimTime::from_secs(20),
                full_state: serde_json::json!({"time": "0d20s0"}),
            },
            worker: WorkerStats {
                host_name: "node-1".into(),
                version: "1.0.0".into(),
                vm_peak_kib: Some(1024),
                vm_rss_kib: None,
            },
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"]["kind"], "simulation");
        assert_eq!(value["outcome"]["fromStep"], 50);
        assert_eq!(value["worker"]["hostName"], "node-1");
        let back: TaskReport = serde_json::from_value(value).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_statistics_outcome_type() {
        let outcome = TaskOutcome::Statistics {
            result: StatisticsResult::IdleTimes(IdleTimeStatistics {
                cars_count: 3,
                idle_cars: 1,
                average_idle_time: 2.0,
                max_idle_time: 6.0,
                total_idle_time: 6.0,
            }),
        };
        assert_eq!(outcome.task_type(), TaskType::IdleTimes);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "statistics");
        assert_eq!(value["result"]["phase"], "idleTimes");
    }
}
