use std::sync::Arc;

use axum::{body::Bytes, extract::State, Json};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use traffic_core::models::TaskType;
use traffic_core::traits::SchedulerService;
use traffic_core::{SchedulerError, SchedulerResult};

use crate::protocol::{
    AddJobParams, GetTaskParams, JobParams, LeaseParams, ProjectParams, RestartTasksParams,
    RpcError, RpcRequest, RpcResponse, TaskFinishedParams, JSONRPC_VERSION,
};
use crate::routes::AppState;

/// `POST /rpc`
///
/// 协议错误和业务错误都以 HTTP 200 + JSON-RPC error 对象返回。
pub async fn rpc_endpoint(State(state): State<AppState>, body: Bytes) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("无法解析RPC请求: {}", e);
            return Json(RpcResponse::failure(
                Value::Null,
                RpcError::parse_error(e.to_string()),
            ));
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Json(RpcResponse::failure(
            request.id,
            RpcError::invalid_request(format!("不支持的协议版本: {}", request.jsonrpc)),
        ));
    }

    let RpcRequest {
        method, params, id, ..
    } = request;
    // 方法名只在被识别后才作为标签，未知方法统一归入 unknown
    let outcome = match dispatch(&state.scheduler, &method, params).await {
        Some(outcome) => {
            counter!("traffic_rpc_requests_total", "method" => method.clone()).increment(1);
            outcome
        }
        None => {
            counter!("traffic_rpc_requests_total", "method" => "unknown").increment(1);
            warn!("未知的RPC方法: {}", method);
            return Json(RpcResponse::failure(id, RpcError::method_not_found(&method)));
        }
    };

    match outcome {
        Ok(result) => Json(RpcResponse::success(id, result)),
        Err(e) => {
            counter!("traffic_rpc_errors_total", "type" => e.error_code()).increment(1);
            if e.is_stale() {
                debug!("{} 被拒绝: {}", method, e);
            } else {
                warn!("{} 失败: {}", method, e);
            }
            Json(RpcResponse::failure(id, RpcError::from(&e)))
        }
    }
}

fn params<P: DeserializeOwned>(value: Value) -> SchedulerResult<P> {
    serde_json::from_value(value).map_err(|e| SchedulerError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> SchedulerResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// 未知方法返回 `None`
async fn dispatch(
    scheduler: &Arc<dyn SchedulerService>,
    method: &str,
    raw: Value,
) -> Option<SchedulerResult<Value>> {
    let result = match method {
        "createProject" => call_create_project(scheduler, raw).await,
        "addJob" => call_add_job(scheduler, raw).await,
        "jobProgress" => call_job_progress(scheduler, raw).await,
        "runJob" => call_run_job(scheduler, raw).await,
        "getTask" | "getJob" => call_get_task(scheduler, raw).await,
        "acceptTask" => call_accept_task(scheduler, raw).await,
        "rejectTask" => call_reject_task(scheduler, raw).await,
        "taskInProgress" | "heartbeat" => call_task_in_progress(scheduler, raw).await,
        "taskFinished" => call_task_finished(scheduler, raw).await,
        "restartTask" => call_restart_task(scheduler, raw).await,
        "restartTasks" => call_restart_tasks(scheduler, raw).await,
        "getCurrentTasks" => scheduler
            .get_current_tasks()
            .await
            .and_then(to_value),
        "abortTask" => call_abort_task(scheduler, raw).await,
        _ => return None,
    };
    Some(result)
}

async fn call_create_project(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: ProjectParams = params(raw)?;
    s.create_project(&p.project).await?;
    Ok(Value::Null)
}

async fn call_add_job(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: AddJobParams = params(raw)?;
    to_value(s.add_job(&p.project, &p.job, p.definition).await?)
}

async fn call_job_progress(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: JobParams = params(raw)?;
    to_value(s.job_progress(&p.project, &p.job).await?)
}

async fn call_run_job(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: JobParams = params(raw)?;
    s.run_job(&p.project, &p.job).await?;
    Ok(Value::Null)
}

async fn call_get_task(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: GetTaskParams = params(raw)?;
    let types = p.types.unwrap_or_else(|| TaskType::ALL.to_vec());
    to_value(s.get_task(&p.worker_id, &types).await?)
}

async fn call_accept_task(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: LeaseParams = params(raw)?;
    to_value(s.accept_task(&p.worker_id, &p.signature).await?)
}

async fn call_reject_task(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: LeaseParams = params(raw)?;
    s.reject_task(&p.worker_id, &p.signature).await?;
    Ok(Value::Null)
}

async fn call_task_in_progress(
    s: &Arc<dyn SchedulerService>,
    raw: Value,
) -> SchedulerResult<Value> {
    let p: LeaseParams = params(raw)?;
    to_value(s.task_in_progress(&p.worker_id, &p.signature).await?)
}

async fn call_task_finished(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: TaskFinishedParams = params(raw)?;
    s.task_finished(&p.worker_id, &p.signature, p.report).await?;
    Ok(Value::Null)
}

async fn call_restart_task(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: LeaseParams = params(raw)?;
    to_value(s.restart_task(&p.worker_id, &p.signature).await?)
}

async fn call_restart_tasks(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: RestartTasksParams = params(raw)?;
    let leases: Vec<_> = p
        .tasks
        .into_iter()
        .map(|t| (t.worker_id, t.signature))
        .collect();
    to_value(s.restart_tasks(&leases).await?)
}

async fn call_abort_task(s: &Arc<dyn SchedulerService>, raw: Value) -> SchedulerResult<Value> {
    let p: JobParams = params(raw)?;
    to_value(s.abort_job(&p.project, &p.job).await?)
}
