use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use traffic_core::models::{
    CurrentTaskInfo, JobDefinition, JobProgress, LeaseSignature, Task, TaskReport, TaskType,
};
use traffic_core::traits::SchedulerService;
use traffic_core::{SchedulerError, SchedulerResult};

use crate::protocol::{
    AddJobParams, GetTaskParams, JobParams, LeaseParams, ProjectParams, RestartTasksParams,
    RpcRequest, RpcResponse, TaskFinishedParams,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 通过 JSON-RPC 访问远端调度器
///
/// 传输层失败（连接、超时、非 2xx 响应）映射为 `Network`，远端返回的错误对象
/// 按 `data.type` 还原为对应的 [`SchedulerError`] 变体。
pub struct RpcSchedulerClient {
    endpoint: String,
    http_client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcSchedulerClient {
    pub fn new(scheduler_url: &str) -> SchedulerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SchedulerError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            endpoint: format!("{}/rpc", scheduler_url.trim_end_matches('/')),
            http_client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<P, R>(&self, method: &str, params: P) -> SchedulerResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params)?;
        debug!("RPC调用 {} (id={})", method, id);

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Network(format!(
                "{method}: HTTP {status} - {body}"
            )));
        }

        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| SchedulerError::Network(format!("{method}: 无效的响应: {e}")))?;

        if let Some(error) = response.error {
            return Err(error.into_scheduler_error());
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    fn lease(worker_id: &str, signature: &LeaseSignature) -> LeaseParams {
        LeaseParams {
            worker_id: worker_id.to_string(),
            signature: signature.clone(),
        }
    }

    fn job(project: &str, job: &str) -> JobParams {
        JobParams {
            project: project.to_string(),
            job: job.to_string(),
        }
    }
}

#[async_trait]
impl SchedulerService for RpcSchedulerClient {
    async fn get_task(
        &self,
        worker_id: &str,
        task_types: &[TaskType],
    ) -> SchedulerResult<Option<Task>> {
        let params = GetTaskParams {
            worker_id: worker_id.to_string(),
            types: Some(task_types.to_vec()),
        };
        self.call("getTask", params).await
    }

    async fn accept_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        self.call("acceptTask", Self::lease(worker_id, signature))
            .await
    }

    async fn reject_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<()> {
        self.call("rejectTask", Self::lease(worker_id, signature))
            .await
    }

    async fn task_in_progress(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<LeaseSignature> {
        self.call("taskInProgress", Self::lease(worker_id, signature))
            .await
    }

    async fn task_finished(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
        report: TaskReport,
    ) -> SchedulerResult<()> {
        let params = TaskFinishedParams {
            worker_id: worker_id.to_string(),
            signature: signature.clone(),
            report,
        };
        self.call("taskFinished", params).await
    }

    async fn restart_task(
        &self,
        worker_id: &str,
        signature: &LeaseSignature,
    ) -> SchedulerResult<bool> {
        self.call("restartTask", Self::lease(worker_id, signature))
            .await
    }

    async fn restart_tasks(&self, leases: &[(String, LeaseSignature)]) -> SchedulerResult<usize> {
        let params = RestartTasksParams {
            tasks: leases
                .iter()
                .map(|(worker_id, signature)| Self::lease(worker_id, signature))
                .collect(),
        };
        self.call("restartTasks", params).await
    }

    async fn get_current_tasks(&self) -> SchedulerResult<Vec<CurrentTaskInfo>> {
        self.call("getCurrentTasks", json!({})).await
    }

    async fn run_job(&self, project: &str, job: &str) -> SchedulerResult<()> {
        self.call("runJob", Self::job(project, job)).await
    }

    async fn abort_job(&self, project: &str, job: &str) -> SchedulerResult<usize> {
        self.call("abortTask", Self::job(project, job)).await
    }

    async fn create_project(&self, name: &str) -> SchedulerResult<()> {
        let params = ProjectParams {
            project: name.to_string(),
        };
        self.call("createProject", params).await
    }

    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<JobProgress> {
        let params = AddJobParams {
            project: project.to_string(),
            job: name.to_string(),
            definition,
        };
        self.call("addJob", params).await
    }

    async fn job_progress(&self, project: &str, job: &str) -> SchedulerResult<JobProgress> {
        self.call("jobProgress", Self::job(project, job)).await
    }
}
