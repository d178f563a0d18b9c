use std::sync::Arc;

use serde_json::json;

use traffic_core::models::{
    BasicStatistics, CarRecord, CarState, JobDefinition, StatisticsResult, StepRecord,
};
use traffic_core::traits::StateStore;
use traffic_core::{SchedulerError, SimTime, StateStorage};
use traffic_infrastructure::{InMemoryStateStore, SqliteStateStore};

async fn stores() -> Vec<(&'static str, Arc<dyn StateStore>)> {
    let sqlite = SqliteStateStore::connect("sqlite::memory:", 1).await.unwrap();
    vec![
        ("memory", Arc::new(InMemoryStateStore::new()) as Arc<dyn StateStore>),
        ("sqlite", Arc::new(sqlite) as Arc<dyn StateStore>),
    ]
}

fn definition() -> JobDefinition {
    // 10秒 / 0.5秒 = 20 步，每批 8 步
    JobDefinition::single_road(300.0, 2, 1200.0).with_timing(10.0, 0.5, 8)
}

fn car(id: u64, position: f64, state: CarState) -> CarRecord {
    CarRecord {
        id,
        road: "main".to_string(),
        lane: 0,
        position,
        speed: 5.0,
        desired_speed: 12.0,
        length: 4.5,
        width: 1.5,
        state,
        blinker: 0,
    }
}

fn record(millis: i64, cars: Vec<CarRecord>) -> StepRecord {
    StepRecord {
        time: SimTime::from_millis(millis),
        cars,
        lights: Vec::new(),
        queues: Vec::new(),
    }
}

async fn with_job(store: &Arc<dyn StateStore>) {
    store.create_project("city").await.unwrap();
    store.add_job("city", "morning", definition()).await.unwrap();
}

#[tokio::test]
async fn test_projects_and_jobs() {
    for (name, store) in stores().await {
        store.create_project("city").await.unwrap();
        assert!(
            matches!(
                store.create_project("city").await,
                Err(SchedulerError::ProjectAlreadyExists { .. })
            ),
            "{name}"
        );
        assert!(matches!(
            store.add_job("nowhere", "j", definition()).await,
            Err(SchedulerError::ProjectNotFound { .. })
        ));

        let job = store.add_job("city", "morning", definition()).await.unwrap();
        assert_eq!(job.progress.total_steps, 20);
        assert_eq!(job.progress.batches, 3);
        assert!(matches!(
            store.add_job("city", "morning", definition()).await,
            Err(SchedulerError::JobAlreadyExists { .. })
        ));

        let loaded = store.get_job("city", "morning").await.unwrap().unwrap();
        assert_eq!(loaded, job, "{name}");
        assert!(store.get_job("city", "evening").await.unwrap().is_none());
        assert_eq!(store.list_jobs("city").await.unwrap(), vec!["morning"]);

        store.delete_job("city", "morning").await.unwrap();
        assert!(store.get_job("city", "morning").await.unwrap().is_none());
        store.delete_project("city").await.unwrap();
        assert!(!store.project_exists("city").await.unwrap());
    }
}

#[tokio::test]
async fn test_commit_simulation_batch_advances_progress() {
    for (name, store) in stores().await {
        with_job(&store).await;

        let progress = store
            .commit_simulation_batch("city", "morning", 0, 8, json!({"time": "0d4s0"}))
            .await
            .unwrap();
        assert_eq!(progress.done, 8, "{name}");

        // 重复提交同一批次被拒绝，进度与快照保持不变
        let stale = store
            .commit_simulation_batch("city", "morning", 0, 8, json!({"time": "bogus"}))
            .await;
        assert!(matches!(stale, Err(SchedulerError::ProgressConflict(_))), "{name}");
        assert_eq!(
            store.get_full_state("city", "morning").await.unwrap(),
            Some(json!({"time": "0d4s0"}))
        );

        store
            .commit_simulation_batch("city", "morning", 8, 8, json!({"n": 2}))
            .await
            .unwrap();
        let last = store
            .commit_simulation_batch("city", "morning", 16, 8, json!({"n": 3}))
            .await
            .unwrap();
        assert_eq!(last.done, 20, "{name}");
        assert!(last.is_simulated());

        let job = store.get_job("city", "morning").await.unwrap().unwrap();
        assert_eq!(job.progress, last);
    }
}

#[tokio::test]
async fn test_statistics_phases() {
    for (name, store) in stores().await {
        with_job(&store).await;
        let basic = StatisticsResult::BasicStatistics(BasicStatistics {
            cars_count: 3,
            finished_cars: 2,
            average_transit_time: 30.0,
            transit_time_std_dev: 1.5,
            average_speed: 9.0,
        });

        assert!(matches!(
            store.save_statistics("city", "morning", basic.clone()).await,
            Err(SchedulerError::ProgressConflict(_))
        ));

        for (from, steps) in [(0, 8), (8, 8), (16, 4)] {
            store
                .commit_simulation_batch("city", "morning", from, steps, json!({}))
                .await
                .unwrap();
        }
        let progress = store
            .save_statistics("city", "morning", basic.clone())
            .await
            .unwrap();
        assert!(progress.basic_statistics, "{name}");
        assert!(!progress.full_statistics);

        let job = store.get_job("city", "morning").await.unwrap().unwrap();
        assert_eq!(job.statistics.basic, Some(match basic {
            StatisticsResult::BasicStatistics(b) => b,
            _ => unreachable!(),
        }));
    }
}

#[tokio::test]
async fn test_states_and_repair() {
    for (name, store) in stores().await {
        with_job(&store).await;
        let records = vec![
            record(0, vec![]),
            record(500, vec![car(0, 0.0, CarState::Add)]),
            record(1000, vec![car(0, 2.5, CarState::Active), car(1, 0.0, CarState::Add)]),
            record(1500, vec![car(0, 6.0, CarState::Del), car(1, 1.0, CarState::Active)]),
        ];
        store.add_states("city", "morning", &records).await.unwrap();
        assert_eq!(store.count_states("city", "morning").await.unwrap(), 4);
        assert_eq!(store.list_states("city", "morning").await.unwrap(), records, "{name}");

        assert_eq!(
            store
                .car_event_times("city", "morning", CarState::Add)
                .await
                .unwrap(),
            vec![(0, SimTime::from_millis(500)), (1, SimTime::from_millis(1000))]
        );
        assert_eq!(store.car_ids("city", "morning").await.unwrap(), vec![0, 1]);
        let track = store.car_track("city", "morning", 0).await.unwrap();
        assert_eq!(track.len(), 3);
        assert_eq!(track[2].state, CarState::Del);

        let removed = store
            .repair("city", "morning", SimTime::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(removed, 2, "{name}");
        // 幂等
        assert_eq!(
            store
                .repair("city", "morning", SimTime::from_millis(1000))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.list_states("city", "morning").await.unwrap(), records[..2]);
        assert_eq!(store.car_ids("city", "morning").await.unwrap(), vec![0]);
    }
}

#[tokio::test]
async fn test_unknown_job_errors() {
    for (name, store) in stores().await {
        store.create_project("city").await.unwrap();
        assert!(
            matches!(
                store.repair("city", "ghost", SimTime::ZERO).await,
                Err(SchedulerError::JobNotFound { .. })
            ),
            "{name}"
        );
        assert!(matches!(
            store.commit_simulation_batch("city", "ghost", 0, 1, json!({})).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}

#[tokio::test]
async fn test_state_storage_buffers_and_repairs() {
    for (name, store) in stores().await {
        with_job(&store).await;
        let mut storage = StateStorage::new(store.clone(), "city", "morning", 3);

        // 上一次尝试残留的记录
        store
            .add_states("city", "morning", &[record(0, vec![]), record(500, vec![]), record(1000, vec![])])
            .await
            .unwrap();
        assert_eq!(storage.repair(SimTime::from_millis(500)).await.unwrap(), 2);

        for millis in [500, 1000] {
            storage.add(record(millis, vec![])).await.unwrap();
        }
        assert_eq!(storage.pending(), 2);
        assert_eq!(store.count_states("city", "morning").await.unwrap(), 1, "{name}");

        storage.add(record(1500, vec![])).await.unwrap();
        assert_eq!(storage.pending(), 0);
        storage.add(record(2000, vec![])).await.unwrap();
        assert_eq!(storage.close().await.unwrap(), 4);
        assert_eq!(store.count_states("city", "morning").await.unwrap(), 5);
    }
}

#[tokio::test]
async fn test_sqlite_file_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.db").display());
    {
        let store = SqliteStateStore::connect(&url, 2).await.unwrap();
        store.create_project("city").await.unwrap();
        store.add_job("city", "morning", definition()).await.unwrap();
        store
            .commit_simulation_batch("city", "morning", 0, 8, json!({"k": 1}))
            .await
            .unwrap();
        store.close().await;
    }
    let store = SqliteStateStore::connect(&url, 2).await.unwrap();
    let job = store.get_job("city", "morning").await.unwrap().unwrap();
    assert_eq!(job.progress.done, 8);
    assert_eq!(
        store.get_full_state("city", "morning").await.unwrap(),
        Some(json!({"k": 1}))
    );
}
