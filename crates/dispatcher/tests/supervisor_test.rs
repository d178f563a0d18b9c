use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use traffic_core::config::SupervisorConfig;
use traffic_core::models::{JobDefinition, TaskType};
use traffic_core::traits::{SchedulerService, StateStore};
use traffic_dispatcher::{Scheduler, Supervisor};
use traffic_infrastructure::InMemoryStateStore;

async fn scheduler_with_lease() -> Arc<Scheduler> {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let scheduler = Arc::new(Scheduler::new(store, 1_000));
    scheduler.create_project("city").await.unwrap();
    scheduler
        .add_job("city", "morning", JobDefinition::single_road(300.0, 1, 600.0))
        .await
        .unwrap();
    scheduler.run_job("city", "morning").await.unwrap();
    let task = scheduler
        .get_task("w1", &TaskType::ALL)
        .await
        .unwrap()
        .unwrap();
    scheduler.accept_task("w1", &task.signature).await.unwrap();
    scheduler
}

fn config(timeout_seconds: u64) -> SupervisorConfig {
    SupervisorConfig {
        scheduler_url: "http://127.0.0.1:8046".to_string(),
        check_interval_seconds: 1,
        restart_task_timeout_seconds: timeout_seconds,
    }
}

#[tokio::test]
async fn test_find_stale_tasks_uses_timeout() {
    let scheduler = scheduler_with_lease().await;
    let supervisor = Supervisor::new(scheduler.clone(), config(120));
    let tasks = scheduler.get_current_tasks().await.unwrap();

    assert!(supervisor.find_stale_tasks(&tasks, Utc::now()).is_empty());
    let later = Utc::now() + chrono::Duration::seconds(121);
    let stale = supervisor.find_stale_tasks(&tasks, later);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].worker_id, "w1");
}

#[tokio::test]
async fn test_check_tasks_requeues_expired_lease() {
    let scheduler = scheduler_with_lease().await;
    let supervisor = Supervisor::new(scheduler.clone(), config(0));
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(supervisor.check_tasks().await.unwrap(), 1);
    assert!(scheduler.get_current_tasks().await.unwrap().is_empty());
    assert_eq!(scheduler.leases().waiting_len().await, 1);
    // 没有租约时什么都不做
    assert_eq!(supervisor.check_tasks().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fresh_lease_is_left_alone() {
    let scheduler = scheduler_with_lease().await;
    let supervisor = Supervisor::new(scheduler.clone(), config(120));
    assert_eq!(supervisor.check_tasks().await.unwrap(), 0);
    assert_eq!(scheduler.get_current_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let scheduler = scheduler_with_lease().await;
    let supervisor = Arc::new(Supervisor::new(scheduler.clone(), config(0)));
    let (tx, rx) = broadcast::channel(1);

    let handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(rx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(supervisor.is_running().await);
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(!supervisor.is_running().await);
    assert!(scheduler.get_current_tasks().await.unwrap().is_empty());
}
