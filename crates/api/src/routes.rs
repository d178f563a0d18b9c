use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use traffic_core::traits::SchedulerService;

use crate::handlers::{health::health_check, metrics::render_metrics, rpc::rpc_endpoint};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<dyn SchedulerService>,
    pub metrics: Option<PrometheusHandle>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/rpc", post(rpc_endpoint))
        .with_state(state)
}
