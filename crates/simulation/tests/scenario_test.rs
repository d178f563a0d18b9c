use std::collections::HashMap;

use traffic_core::models::{CarState, JobDefinition, LightPhase, StepRecord};
use traffic_core::SimTime;
use traffic_simulation::{run_batch, Model, RandomSource};

/// 300米双车道，100米处信号灯（绿5秒/红5秒），入口每小时1200辆，仿真120秒
fn scenario() -> JobDefinition {
    let mut def = JobDefinition::single_road(300.0, 2, 1200.0)
        .with_timing(120.0, 0.2, 50)
        .with_seed(2024)
        .with_light("light-1", "main", 100.0, 5.0, 5.0, LightPhase::Green);
    def.model_parameters.safe_distance = 5.0;
    def
}

fn run_whole(def: &JobDefinition) -> Vec<StepRecord> {
    let total = def.total_steps().unwrap();
    let random = RandomSource::from_definition(def);
    let mut done = 0;
    let mut snapshot = None;
    let mut records = Vec::new();
    while done < total {
        let batch = run_batch(
            def,
            snapshot.as_ref(),
            done,
            total,
            def.simulation_parameters.batch_length,
            &random,
        )
        .unwrap();
        done += batch.steps_done;
        records.extend(batch.records);
        snapshot = Some(batch.snapshot.to_value().unwrap());
    }
    records
}

#[test]
fn test_scenario_generates_expected_cars() {
    let def = scenario();
    assert_eq!(def.total_steps().unwrap(), 600);

    let mut model = Model::new(&def, RandomSource::Seeded(2024).rng_for(SimTime::ZERO)).unwrap();
    for _ in 0..600 {
        model.step(def.step_duration().unwrap()).unwrap();
    }
    // t = 0, 3, 6, ..., 120
    assert_eq!(model.generated_cars(), 41);
    assert_eq!(model.time(), SimTime::from_secs(120));
}

#[test]
fn test_scenario_positions_never_decrease_and_never_overlap() {
    let def = scenario();
    let records = run_whole(&def);
    assert_eq!(records.len(), 601);

    let mut last_position: HashMap<u64, f64> = HashMap::new();
    for record in &records {
        for car in &record.cars {
            assert!(car.position >= 0.0, "car {} negative position", car.id);
            assert!(car.speed >= 0.0);
            if let Some(prev) = last_position.insert(car.id, car.position) {
                assert!(
                    car.position >= prev,
                    "car {} moved backward at {}: {} -> {}",
                    car.id,
                    record.time,
                    prev,
                    car.position
                );
            }
        }

        let mut by_lane: HashMap<(&str, u32), Vec<(f64, f64)>> = HashMap::new();
        for car in &record.cars {
            by_lane
                .entry((car.road.as_str(), car.lane))
                .or_default()
                .push((car.position, car.length));
        }
        for cars in by_lane.values_mut() {
            cars.sort_by(|a, b| b.0.total_cmp(&a.0));
            for pair in cars.windows(2) {
                let (leader, follower) = (pair[0], pair[1]);
                assert!(
                    follower.0 < leader.0 - leader.1,
                    "overlap at {}: leader {:?} follower {:?}",
                    record.time,
                    leader,
                    follower
                );
            }
        }
    }
}

#[test]
fn test_cars_stop_for_red_light() {
    let def = scenario();
    let records = run_whole(&def);
    for pair in records.windows(2) {
        let (prev, current) = (&pair[0], &pair[1]);
        let red = current.lights.iter().any(|l| l.phase == LightPhase::Red);
        if !red {
            continue;
        }
        // 红灯期间，灯前的车辆不会越过信号灯
        for car in &current.cars {
            let before = prev
                .cars
                .iter()
                .find(|c| c.id == car.id)
                .map(|c| c.position);
            if let Some(before) = before.filter(|p| *p < 99.9) {
                assert!(
                    car.position <= 100.0,
                    "car {} ran the red light at {}: {} -> {}",
                    car.id,
                    current.time,
                    before,
                    car.position
                );
            }
        }
    }
    let finished = records
        .iter()
        .flat_map(|r| r.cars.iter())
        .filter(|c| c.state == CarState::Del)
        .count();
    assert!(finished > 0);
}

#[test]
fn test_resumed_batches_replay_identically() {
    let def = scenario();
    let total = def.total_steps().unwrap();
    let random = RandomSource::from_definition(&def);

    let first = run_batch(&def, None, 0, total, 50, &random).unwrap();
    let value = first.snapshot.to_value().unwrap();

    let a = run_batch(&def, Some(&value), 50, total, 50, &random).unwrap();
    let b = run_batch(&def, Some(&value), 50, total, 50, &random).unwrap();
    assert_eq!(a.records, b.records);
    assert_eq!(a.snapshot, b.snapshot);
}

#[test]
fn test_seeded_runs_are_deterministic() {
    let def = scenario();
    assert_eq!(run_whole(&def), run_whole(&def));
}

#[test]
fn test_every_car_is_added_once_and_deleted_once() {
    let def = scenario();
    let records = run_whole(&def);
    let mut adds: HashMap<u64, usize> = HashMap::new();
    let mut dels: HashMap<u64, usize> = HashMap::new();
    for record in &records {
        for car in &record.cars {
            match car.state {
                CarState::Add => *adds.entry(car.id).or_default() += 1,
                CarState::Del => *dels.entry(car.id).or_default() += 1,
                CarState::Active => {}
            }
        }
    }
    assert!(adds.values().all(|n| *n == 1));
    assert!(dels.values().all(|n| *n == 1));
    assert!(dels.keys().all(|id| adds.contains_key(id)));
}
