use thiserror::Error;


#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("租约签名已失效: worker {worker_id}")]
    StaleLease { worker_id: String },
    #[error("Worker没有当前租约: {worker_id}")]
    UnknownWorker { worker_id: String },
    #[error("Worker已持有任务: {worker_id}")]
    WorkerHasTask { worker_id: String },
    #[error("任务已在队列或执行中: {0}")]
    DuplicateTask(String),
    #[error("项目已存在: {name}")]
    ProjectAlreadyExists { name: String },
    #[error("作业已存在: {project}/{job}")]
    JobAlreadyExists { project: String, job: String },
    #[error("项目未找到: {name}")]
    ProjectNotFound { name: String },
    #[error("作业未找到: {project}/{job}")]
    JobNotFound { project: String, job: String },
    #[error("存储不可用: {0}")]
    StorageUnavailable(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("仿真不变量被破坏: {0}")]
    SimulationInvariant(String),
    #[error("无效的作业定义: {0}")]
    InvalidDefinition(String),
    #[error("进度冲突: {0}")]
    ProgressConflict(String),
    #[error("无效的请求参数: {0}")]
    InvalidParams(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn stale_lease<S: Into<String>>(worker_id: S) -> Self {
        Self::StaleLease {
            worker_id: worker_id.into(),
        }
    }
    pub fn unknown_worker<S: Into<String>>(worker_id: S) -> Self {
        Self::UnknownWorker {
            worker_id: worker_id.into(),
        }
    }
    pub fn job_not_found<P: Into<String>, J: Into<String>>(project: P, job: J) -> Self {
        Self::JobNotFound {
            project: project.into(),
            job: job.into(),
        }
    }
    pub fn project_not_found<S: Into<String>>(name: S) -> Self {
        Self::ProjectNotFound { name: name.into() }
    }
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::SimulationInvariant(msg.into())
    }
    pub fn invalid_definition<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDefinition(msg.into())
    }
    pub fn storage_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::StorageUnavailable(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 租约已不属于调用方：调用方应放弃当前操作
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            SchedulerError::StaleLease { .. } | SchedulerError::UnknownWorker { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::SimulationInvariant(_)
                | SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::StorageUnavailable(_) | SchedulerError::Network(_) => true,
            SchedulerError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// RPC错误负载中使用的稳定错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            SchedulerError::StaleLease { .. } => "STALE_LEASE",
            SchedulerError::UnknownWorker { .. } => "UNKNOWN_WORKER",
            SchedulerError::WorkerHasTask { .. } => "WORKER_HAS_TASK",
            SchedulerError::DuplicateTask(_) => "DUPLICATE_TASK",
            SchedulerError::ProjectAlreadyExists { .. } => "PROJECT_ALREADY_EXISTS",
            SchedulerError::JobAlreadyExists { .. } => "JOB_ALREADY_EXISTS",
            SchedulerError::ProjectNotFound { .. } => "PROJECT_NOT_FOUND",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::SimulationInvariant(_) => "SIMULATION_INVARIANT",
            SchedulerError::InvalidDefinition(_) => "INVALID_DEFINITION",
            SchedulerError::ProgressConflict(_) => "PROGRESS_CONFLICT",
            SchedulerError::InvalidParams(_) => "INVALID_PARAMS",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::Network(_) => "NETWORK_ERROR",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 错误所指向的主体（worker id、项目名或 `项目/作业`）
    pub fn subject(&self) -> Option<String> {
        match self {
            SchedulerError::StaleLease { worker_id }
            | SchedulerError::UnknownWorker { worker_id }
            | SchedulerError::WorkerHasTask { worker_id } => Some(worker_id.clone()),
            SchedulerError::ProjectAlreadyExists { name }
            | SchedulerError::ProjectNotFound { name } => Some(name.clone()),
            SchedulerError::JobAlreadyExists { project, job }
            | SchedulerError::JobNotFound { project, job } => Some(format!("{project}/{job}")),
            _ => None,
        }
    }

    /// 根据远端返回的错误码还原错误
    ///
    /// 用于RPC客户端，将 `{code, message}` 负载映射回本地错误类型，
    /// 使调用方可以继续使用 `is_stale`/`is_retryable` 判断。
    pub fn from_remote(code: &str, subject: Option<&str>, message: String) -> Self {
        let subject_or_message = || subject.map(str::to_string).unwrap_or_else(|| message.clone());
        let split_job = || {
            let s = subject_or_message();
            match s.split_once('/') {
                Some((p, j)) => (p.to_string(), j.to_string()),
                None => (s, String::new()),
            }
        };
        match code {
            "STALE_LEASE" => Self::StaleLease {
                worker_id: subject_or_message(),
            },
            "UNKNOWN_WORKER" => Self::UnknownWorker {
                worker_id: subject_or_message(),
            },
            "WORKER_HAS_TASK" => Self::WorkerHasTask {
                worker_id: subject_or_message(),
            },
            "DUPLICATE_TASK" => Self::DuplicateTask(message),
            "PROJECT_ALREADY_EXISTS" => Self::ProjectAlreadyExists {
                name: subject_or_message(),
            },
            "PROJECT_NOT_FOUND" => Self::ProjectNotFound {
                name: subject_or_message(),
            },
            "JOB_ALREADY_EXISTS" => {
                let (project, job) = split_job();
                Self::JobAlreadyExists { project, job }
            }
            "JOB_NOT_FOUND" => {
                let (project, job) = split_job();
                Self::JobNotFound { project, job }
            }
            // 远端数据库故障对调用方而言等同于存储暂不可用
            "STORAGE_UNAVAILABLE" | "DATABASE_ERROR" => Self::StorageUnavailable(message),
            "SIMULATION_INVARIANT" => Self::SimulationInvariant(message),
            "INVALID_DEFINITION" => Self::InvalidDefinition(message),
            "PROGRESS_CONFLICT" => Self::ProgressConflict(message),
            "INVALID_PARAMS" => Self::InvalidParams(message),
            "SERIALIZATION_ERROR" => Self::Serialization(message),
            "CONFIGURATION_ERROR" => Self::Configuration(message),
            "NETWORK_ERROR" => Self::Network(message),
            _ => Self::Internal(message),
        }
    }

    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::StaleLease { .. } => "租约已被重新分配，请放弃当前任务",
            SchedulerError::UnknownWorker { .. } => "Worker当前没有租约",
            SchedulerError::JobNotFound { .. } => "请求的作业不存在",
            SchedulerError::ProjectNotFound { .. } => "请求的项目不存在",
            SchedulerError::InvalidParams(_) => "请求参数有误",
            SchedulerError::StorageUnavailable(_) => "存储暂不可用，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
