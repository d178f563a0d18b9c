//! JSON-RPC 2.0 报文与各方法的参数结构

use serde::{Deserialize, Serialize};
use serde_json::Value;

use traffic_core::models::{JobDefinition, LeaseSignature, TaskReport, TaskType};
use traffic_core::SchedulerError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// 调度器业务错误，具体类型见 `data.type`
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new<P: Serialize>(id: u64, method: &str, params: P) -> serde_json::Result<Self> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            id: Value::from(id),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorData {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RpcErrorData>,
}

impl RpcError {
    pub fn new<S: Into<String>>(code: i64, error_type: &str, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(RpcErrorData {
                error_type: error_type.to_string(),
                subject: None,
            }),
        }
    }

    pub fn parse_error<S: Into<String>>(message: S) -> Self {
        Self::new(PARSE_ERROR, "PARSE_ERROR", message)
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::new(INVALID_REQUEST, "INVALID_REQUEST", message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "METHOD_NOT_FOUND", format!("未知方法: {method}"))
    }

    /// 还原为本地错误类型
    pub fn into_scheduler_error(self) -> SchedulerError {
        match self.data {
            Some(data) => {
                SchedulerError::from_remote(&data.error_type, data.subject.as_deref(), self.message)
            }
            None if self.code == INVALID_PARAMS => SchedulerError::InvalidParams(self.message),
            None => SchedulerError::Internal(self.message),
        }
    }
}

impl From<&SchedulerError> for RpcError {
    fn from(err: &SchedulerError) -> Self {
        let code = match err {
            SchedulerError::InvalidParams(_)
            | SchedulerError::InvalidDefinition(_)
            | SchedulerError::Serialization(_) => INVALID_PARAMS,
            SchedulerError::Internal(_) => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
            data: Some(RpcErrorData {
                error_type: err.error_code().to_string(),
                subject: err.subject(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectParams {
    pub project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub project: String,
    pub job: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobParams {
    pub project: String,
    pub job: String,
    pub definition: JobDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskParams {
    pub worker_id: String,
    /// 缺省时接受全部任务类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<TaskType>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseParams {
    pub worker_id: String,
    pub signature: LeaseSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishedParams {
    pub worker_id: String,
    pub signature: LeaseSignature,
    pub report: TaskReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartTasksParams {
    pub tasks: Vec<LeaseParams>,
}
