use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// 任务类型：一批仿真步或一个统计阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    Simulation,
    BasicStatistics,
    IdleTimes,
    Throughput,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Simulation,
        TaskType::BasicStatistics,
        TaskType::IdleTimes,
        TaskType::Throughput,
    ];

    pub const STATISTICS: [TaskType; 3] = [
        TaskType::BasicStatistics,
        TaskType::IdleTimes,
        TaskType::Throughput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Simulation => "simulation",
            TaskType::BasicStatistics => "basicStatistics",
            TaskType::IdleTimes => "idleTimes",
            TaskType::Throughput => "throughput",
        }
    }

    pub fn is_statistics(&self) -> bool {
        !matches!(self, TaskType::Simulation)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SchedulerError::InvalidParams(format!("未知的任务类型: {s}")))
    }
}

/// 任务描述：(项目, 作业, 类型)，同一描述同一时刻最多只有一个在队列或执行中
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub project: String,
    pub job: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
}

impl TaskDescriptor {
    pub fn new<P: Into<String>, J: Into<String>>(project: P, job: J, task_type: TaskType) -> Self {
        Self {
            project: project.into(),
            job: job.into(),
            task_type,
        }
    }

    pub fn belongs_to(&self, project: &str, job: &str) -> bool {
        self.project == project && self.job == job
    }
}

impl fmt::Display for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.project, self.job, self.task_type)
    }
}

/// 租约签名
///
/// 不透明的轮换令牌。每次 accept/heartbeat 都会签发新签名，
/// 只有持有最近一次签名的调用方才能继续操作该租约。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseSignature(String);

impl LeaseSignature {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    /// 由签发时间和进程内序号生成签名
    pub fn issue(at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!("{}#{sequence}", at.to_rfc3339()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 下发给Worker的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub descriptor: TaskDescriptor,
    pub signature: LeaseSignature,
    /// Worker发送心跳的间隔（毫秒）
    pub notification_interval_ms: u64,
}

impl Task {
    pub fn project(&self) -> &str {
        &self.descriptor.project
    }

    pub fn job(&self) -> &str {
        &self.descriptor.job
    }

    pub fn task_type(&self) -> TaskType {
        self.descriptor.task_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaseState {
    /// 已下发，等待Worker确认
    Offered,
    /// Worker已确认并在执行
    Running,
}

/// `getCurrentTasks` 返回的租约快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTaskInfo {
    pub worker_id: String,
    pub signature: LeaseSignature,
    pub last_update: DateTime<Utc>,
    pub project: String,
    pub job: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub state: LeaseState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trip_names() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
            assert_eq!(
                serde_json::to_value(t).unwrap(),
                serde_json::Value::String(t.as_str().to_string())
            );
        }
        assert!("shell".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_task_serializes_flat() {
        let task = Task {
            descriptor: TaskDescriptor::new("p", "j", TaskType::IdleTimes),
            signature: LeaseSignature::new("s1"),
            notification_interval_ms: 5_000,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["project"], "p");
        assert_eq!(value["type"], "idleTimes");
        assert_eq!(value["signature"], "s1");
        assert_eq!(value["notificationIntervalMs"], 5_000);
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_signatures_differ_by_sequence() {
        let now = Utc::now();
        assert_ne!(LeaseSignature::issue(now, 1), LeaseSignature::issue(now, 2));
    }
}
