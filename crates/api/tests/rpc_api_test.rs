use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;

use traffic_api::{create_app, serve, RpcSchedulerClient};
use traffic_core::models::{JobDefinition, TaskOutcome, TaskReport, TaskType, WorkerStats};
use traffic_core::traits::{SchedulerService, StateStore};
use traffic_core::{SchedulerError, SimTime};
use traffic_dispatcher::Scheduler;
use traffic_infrastructure::InMemoryStateStore;

fn test_app() -> Router {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    create_app(Arc::new(Scheduler::new(store, 500)), None)
}

async fn rpc(app: &Router, method: &str, params: Value) -> Value {
    let body = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1});
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn definition() -> Value {
    serde_json::to_value(JobDefinition::single_road(200.0, 1, 600.0).with_timing(4.0, 0.5, 4))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = test_app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let response = test_app()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lease_cycle_over_rpc() {
    let app = test_app();
    assert!(rpc(&app, "createProject", json!({"project": "city"})).await["error"].is_null());
    let progress = rpc(
        &app,
        "addJob",
        json!({"project": "city", "job": "noon", "definition": definition()}),
    )
    .await;
    assert_eq!(progress["result"]["totalSteps"], 8);

    rpc(&app, "runJob", json!({"project": "city", "job": "noon"})).await;
    let task = rpc(&app, "getJob", json!({"workerId": "w1", "types": ["simulation"]})).await;
    assert_eq!(task["result"]["type"], "simulation");
    assert_eq!(task["result"]["notificationIntervalMs"], 500);
    let offered = task["result"]["signature"].clone();

    let accepted = rpc(
        &app,
        "acceptTask",
        json!({"workerId": "w1", "signature": offered}),
    )
    .await["result"]
        .clone();
    let renewed = rpc(
        &app,
        "heartbeat",
        json!({"workerId": "w1", "signature": accepted}),
    )
    .await["result"]
        .clone();
    assert_ne!(renewed, accepted);

    // 旧签名的心跳被拒绝，错误类型可区分
    let stale = rpc(
        &app,
        "taskInProgress",
        json!({"workerId": "w1", "signature": accepted}),
    )
    .await;
    assert_eq!(stale["error"]["code"], -32000);
    assert_eq!(stale["error"]["data"]["type"], "STALE_LEASE");
    assert_eq!(stale["error"]["data"]["subject"], "w1");

    let current = rpc(&app, "getCurrentTasks", Value::Null).await;
    assert_eq!(current["result"][0]["workerId"], "w1");
    assert_eq!(current["result"][0]["state"], "running");

    let report = TaskReport {
        outcome: TaskOutcome::Simulation {
            from_step: 0,
            steps_done: 4,
            final_time: SimTime::from_secs(2),
            full_state: json!({}),
        },
        worker: WorkerStats::default(),
    };
    let finished = rpc(
        &app,
        "taskFinished",
        json!({"workerId": "w1", "signature": renewed, "report": report}),
    )
    .await;
    assert!(finished["error"].is_null(), "{finished}");
    let progress = rpc(&app, "jobProgress", json!({"project": "city", "job": "noon"})).await;
    assert_eq!(progress["result"]["done"], 4);

    // 下一批次已入队，中止后队列清空
    let aborted = rpc(&app, "abortTask", json!({"project": "city", "job": "noon"})).await;
    assert_eq!(aborted["result"], 1);
}

#[tokio::test]
async fn test_protocol_errors() {
    let app = test_app();

    let unknown = rpc(&app, "frobnicate", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let bad_params = rpc(&app, "runJob", json!({"project": "city"})).await;
    assert_eq!(bad_params["error"]["code"], -32602);
    assert_eq!(bad_params["error"]["data"]["type"], "INVALID_PARAMS");

    let missing = rpc(&app, "runJob", json!({"project": "city", "job": "ghost"})).await;
    assert_eq!(missing["error"]["data"]["type"], "JOB_NOT_FOUND");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"]["code"], -32700);

    let wrong_version = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .body(Body::from(r#"{"jsonrpc":"1.0","method":"getCurrentTasks","id":9}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(wrong_version.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"]["code"], -32600);
    assert_eq!(json["id"], 9);
}

#[test]
fn test_unknown_methods_share_one_metric_series() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let app = test_app();
            for method in ["frobnicate", "x-0001", "x-0002"] {
                let response = rpc(&app, method, json!({})).await;
                assert_eq!(response["error"]["code"], -32601);
            }
            rpc(&app, "getCurrentTasks", json!({})).await;
        })
    });

    let rendered = handle.render();
    assert!(rendered.contains(r#"traffic_rpc_requests_total{method="unknown"} 3"#));
    assert!(rendered.contains(r#"traffic_rpc_requests_total{method="getCurrentTasks"} 1"#));
    assert!(!rendered.contains("frobnicate"));
    assert!(!rendered.contains("x-0001"));
}

#[tokio::test]
async fn test_client_against_running_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { serve(test_app(), &addr.to_string(), rx).await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let client = RpcSchedulerClient::new(&format!("http://{addr}/")).unwrap();
    client.create_project("city").await.unwrap();
    assert!(matches!(
        client.create_project("city").await,
        Err(SchedulerError::ProjectAlreadyExists { .. })
    ));
    let definition = JobDefinition::single_road(200.0, 1, 600.0).with_timing(4.0, 0.5, 4);
    let progress = client.add_job("city", "noon", definition).await.unwrap();
    assert_eq!(progress.total_steps, 8);

    assert!(client.get_task("w1", &TaskType::ALL).await.unwrap().is_none());
    client.run_job("city", "noon").await.unwrap();
    let task = client.get_task("w1", &TaskType::ALL).await.unwrap().unwrap();
    let signature = client.accept_task("w1", &task.signature).await.unwrap();
    let renewed = client.task_in_progress("w1", &signature).await.unwrap();

    let stale = client.task_in_progress("w1", &signature).await.unwrap_err();
    assert!(stale.is_stale());
    assert!(!client.restart_task("w1", &signature).await.unwrap());
    assert_eq!(
        client
            .restart_tasks(&[("w1".to_string(), renewed)])
            .await
            .unwrap(),
        1
    );
    assert!(client.get_current_tasks().await.unwrap().is_empty());

    tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    // 服务停止后调用返回可重试的网络错误
    let err = client.job_progress("city", "noon").await.unwrap_err();
    assert!(matches!(err, SchedulerError::Network(_)));
    assert!(err.is_retryable());
}
