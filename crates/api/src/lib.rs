//! 调度器的 JSON-RPC 接口
//!
//! 服务端把 `POST /rpc` 上的 JSON-RPC 2.0 调用转发给 [`SchedulerService`]，
//! 另外提供 `GET /health` 和 `GET /metrics`。[`RpcSchedulerClient`] 是同一接口的
//! 远程实现，Worker和Supervisor进程通过它访问调度器。

pub mod client;
pub mod handlers;
pub mod middleware;
pub mod protocol;
pub mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::info;

use traffic_core::traits::SchedulerService;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

pub use client::RpcSchedulerClient;

/// 创建完整的API应用
pub fn create_app(
    scheduler: Arc<dyn SchedulerService>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = AppState { scheduler, metrics };

    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}

/// 安装全局 Prometheus 记录器，每个进程只能调用一次
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("安装Prometheus指标记录器失败")
}

/// 在 `bind_address` 上提供服务，收到关闭信号后优雅退出
pub async fn serve(
    app: Router,
    bind_address: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("绑定地址失败: {bind_address}"))?;
    info!("RPC服务监听于 {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("RPC服务收到关闭信号");
        })
        .await
        .context("RPC服务异常退出")
}
