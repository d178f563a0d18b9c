use serde_json::Value;
use tracing::{debug, info};

use traffic_core::models::{JobDefinition, StepRecord, TaskOutcome};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

use crate::model::Model;
use crate::random::RandomSource;
use crate::snapshot::ModelSnapshot;

/// 一个批次的运行结果
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub from_step: u64,
    pub steps_done: u64,
    pub final_time: SimTime,
    /// 本批次产生的逐步记录；从头开始时包含 t=0 的初始记录
    pub records: Vec<StepRecord>,
    pub snapshot: ModelSnapshot,
}

impl BatchResult {
    pub fn into_outcome(self) -> SchedulerResult<(TaskOutcome, Vec<StepRecord>)> {
        let full_state = self.snapshot.to_value()?;
        Ok((
            TaskOutcome::Simulation {
                from_step: self.from_step,
                steps_done: self.steps_done,
                final_time: self.final_time,
                full_state,
            },
            self.records,
        ))
    }
}

/// 从已完成的 `done` 步继续，最多运行 `batch_length` 步
///
/// `done == 0` 时忽略快照，从空模型开始；否则快照时间必须恰好等于
/// `done × stepDuration`，不一致说明快照与进度不匹配。
pub fn run_batch(
    definition: &JobDefinition,
    snapshot: Option<&Value>,
    done: u64,
    total: u64,
    batch_length: u64,
    random: &RandomSource,
) -> SchedulerResult<BatchResult> {
    if done >= total {
        return Err(SchedulerError::ProgressConflict(format!(
            "仿真已完成: {done}/{total}"
        )));
    }
    if batch_length == 0 {
        return Err(SchedulerError::invalid_definition("批次长度必须大于0"));
    }

    let dt = definition.step_duration()?;
    let start = dt.times(done);
    let rng = random.rng_for(start);
    let mut records = Vec::new();

    let mut model = if done == 0 {
        let model = Model::new(definition, rng)?;
        records.push(model.record());
        model
    } else {
        let value = snapshot.ok_or_else(|| {
            SchedulerError::ProgressConflict(format!("已完成 {done} 步但缺少模型快照"))
        })?;
        let snapshot = ModelSnapshot::from_value(value.clone())?;
        if snapshot.time != start {
            return Err(SchedulerError::ProgressConflict(format!(
                "快照时间 {} 与进度 {} 步（{}）不一致",
                snapshot.time, done, start
            )));
        }
        Model::from_snapshot(definition, &snapshot, rng)?
    };

    let steps = batch_length.min(total - done);
    debug!("运行批次: 步 {}..{} / {}", done, done + steps, total);
    for _ in 0..steps {
        records.push(model.step(dt)?);
    }

    info!(
        "批次完成: {} 步，仿真时间 {}，在途车辆 {}",
        steps,
        model.time(),
        model.cars().len()
    );

    Ok(BatchResult {
        from_step: done,
        steps_done: steps,
        final_time: model.time(),
        snapshot: model.snapshot(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> JobDefinition {
        JobDefinition::single_road(300.0, 2, 1200.0)
            .with_timing(10.0, 0.2, 20)
            .with_seed(5)
    }

    #[test]
    fn test_fresh_batch_includes_initial_record() {
        let def = definition();
        let result = run_batch(&def, None, 0, 50, 20, &RandomSource::Seeded(5)).unwrap();
        assert_eq!(result.steps_done, 20);
        assert_eq!(result.records.len(), 21);
        assert_eq!(result.records[0].time, SimTime::ZERO);
        assert_eq!(result.final_time, SimTime::from_secs(4));
    }

    #[test]
    fn test_last_batch_is_truncated() {
        let def = definition();
        let first = run_batch(&def, None, 0, 50, 40, &RandomSource::Seeded(5)).unwrap();
        let value = first.snapshot.to_value().unwrap();
        let second = run_batch(&def, Some(&value), 40, 50, 40, &RandomSource::Seeded(5)).unwrap();
        assert_eq!(second.steps_done, 10);
        assert_eq!(second.records.len(), 10);
        assert_eq!(second.final_time, SimTime::from_secs(10));
    }

    #[test]
    fn test_missing_snapshot_is_conflict() {
        let def = definition();
        assert!(matches!(
            run_batch(&def, None, 20, 50, 20, &RandomSource::Seeded(5)),
            Err(SchedulerError::ProgressConflict(_))
        ));
    }

    #[test]
    fn test_snapshot_time_mismatch_is_conflict() {
        let def = definition();
        let first = run_batch(&def, None, 0, 50, 20, &RandomSource::Seeded(5)).unwrap();
        let value = first.snapshot.to_value().unwrap();
        assert!(matches!(
            run_batch(&def, Some(&value), 40, 50, 20, &RandomSource::Seeded(5)),
            Err(SchedulerError::ProgressConflict(_))
        ));
    }

    #[test]
    fn test_completed_job_is_conflict() {
        let def = definition();
        assert!(matches!(
            run_batch(&def, None, 50, 50, 20, &RandomSource::Seeded(5)),
            Err(SchedulerError::ProgressConflict(_))
        ));
    }
}
