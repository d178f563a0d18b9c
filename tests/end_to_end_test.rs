use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use traffic_api::{create_app, serve, RpcSchedulerClient};
use traffic_core::models::{JobDefinition, TaskType};
use traffic_core::traits::{SchedulerService, StateStore};
use traffic_core::AppConfig;
use traffic_dispatcher::Scheduler;
use traffic_infrastructure::InMemoryStateStore;
use traffic_scheduler::{run_simulation, AppMode, Application, ShutdownManager};
use traffic_worker::{ExecutorRegistry, WorkerService};

async fn free_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn short_job() -> JobDefinition {
    JobDefinition::single_road(250.0, 2, 900.0)
        .with_timing(15.0, 0.5, 10)
        .with_seed(11)
}

async fn wait_until_complete(client: &RpcSchedulerClient, project: &str, job: &str) -> bool {
    for _ in 0..300 {
        if let Ok(progress) = client.job_progress(project, job).await {
            if progress.is_complete() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_remote_worker_completes_job() {
    let address = free_address().await;
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let scheduler = Arc::new(Scheduler::new(store.clone(), 10_000));
    let (tx, rx) = broadcast::channel(4);

    let server = {
        let app = create_app(scheduler.clone(), None);
        let address = address.clone();
        tokio::spawn(async move { serve(app, &address, rx).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("http://{address}");
    let client = RpcSchedulerClient::new(&url).unwrap();
    client.create_project("city").await.unwrap();
    let progress = client.add_job("city", "evening", short_job()).await.unwrap();
    assert_eq!(progress.total_steps, 30);
    client.run_job("city", "evening").await.unwrap();

    let mut config = AppConfig::default().worker;
    config.worker_id = Some("remote-1".to_string());
    config.scheduler_url = url.clone();
    config.check_interval_ms = 10;
    let registry = ExecutorRegistry::with_defaults(store.clone(), 8, &TaskType::ALL);
    let worker = Arc::new(WorkerService::new(
        Arc::new(RpcSchedulerClient::new(&url).unwrap()),
        registry,
        config,
    ));
    let worker_handle = {
        let worker = worker.clone();
        let rx = tx.subscribe();
        tokio::spawn(async move { worker.run(rx).await })
    };

    assert!(wait_until_complete(&client, "city", "evening").await);
    let job = store.get_job("city", "evening").await.unwrap().unwrap();
    assert!(job.statistics.basic.is_some());
    assert!(job.statistics.idle_times.is_some());
    assert!(job.statistics.throughput.is_some());
    assert_eq!(store.count_states("city", "evening").await.unwrap(), 31);
    assert!(client.get_current_tasks().await.unwrap().is_empty());

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_all_mode_runs_in_one_process() {
    let address = free_address().await;
    let mut config = AppConfig::default();
    config.storage.backend = "memory".to_string();
    config.scheduler.bind_address = address.clone();
    config.worker.check_interval_ms = 10;
    config.supervisor.check_interval_seconds = 1;
    config.observability.metrics_enabled = false;

    let shutdown = ShutdownManager::new();
    let app = Arc::new(Application::new(config, AppMode::All));
    let handle = {
        let app = app.clone();
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { app.run(rx).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    let client = RpcSchedulerClient::new(&format!("http://{address}")).unwrap();
    client.create_project("town").await.unwrap();
    client.add_job("town", "noon", short_job()).await.unwrap();
    client.run_job("town", "noon").await.unwrap();
    assert!(wait_until_complete(&client, "town", "noon").await);

    shutdown.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[test]
fn test_simulate_mode_writes_output_files() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("road.json");
    std::fs::write(&model, serde_json::to_string(&short_job()).unwrap()).unwrap();
    let out = dir.path().join("out");

    let summary = run_simulation(&model, &out, "csv").unwrap();
    assert_eq!(summary.steps, 30);
    assert!(summary.states_path.exists());
    assert!(summary.cars_path.exists());

    let states = std::fs::read_to_string(&summary.states_path).unwrap();
    assert!(states.lines().count() > 1);

    assert!(run_simulation(&model, &out, "xml").is_err());
}

#[test]
fn test_sample_model_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models/single-light.json");
    let definition = traffic_scheduler::load_definition(&path).unwrap();
    definition.validate().unwrap();
    assert_eq!(definition.traffic_lights.len(), 1);
    assert_eq!(definition.throughput_positions().len(), 2);
}

#[test]
fn test_sample_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/traffic.toml");
    let config = AppConfig::load(path.to_str()).unwrap();
    assert_eq!(config.worker.task_types, TaskType::ALL.to_vec());
    assert_eq!(config.supervisor.restart_task_timeout_seconds, 120);
}
