use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use traffic_core::models::{
    BasicStatistics, CarState, IdleTimeStatistics, JobDefinition, PositionThroughput,
    StatisticsResult, Task, TaskOutcome, TaskType, ThroughputStatistics, TrackPoint,
};
use traffic_core::traits::{LeaseStatus, StateStore, TaskExecutor};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// 基础统计：通过时间为车辆 del 记录时间减去 add 记录时间
///
/// 没有车辆驶出时平均通过时间为 -1。
pub fn basic_statistics(
    added: &[(u64, SimTime)],
    deleted: &[(u64, SimTime)],
    tracks: &HashMap<u64, Vec<TrackPoint>>,
) -> BasicStatistics {
    let deleted: HashMap<u64, SimTime> = deleted.iter().copied().collect();
    let transit: Vec<f64> = added
        .iter()
        .filter_map(|(id, add)| deleted.get(id).map(|del| (*del - *add).as_secs_f64()))
        .collect();

    let (average, std_dev) = if transit.is_empty() {
        (-1.0, 0.0)
    } else {
        let n = transit.len() as f64;
        let mean = transit.iter().sum::<f64>() / n;
        let variance = transit.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
        (mean, variance.sqrt())
    };

    let speeds: Vec<f64> = tracks
        .values()
        .flat_map(|track| track.iter().map(|p| p.speed))
        .collect();
    let average_speed = if speeds.is_empty() {
        0.0
    } else {
        speeds.iter().sum::<f64>() / speeds.len() as f64
    };

    BasicStatistics {
        cars_count: added.len() as u64,
        finished_cars: transit.len() as u64,
        average_transit_time: average,
        transit_time_std_dev: std_dev,
        average_speed,
    }
}

/// 等待时间：相邻两条记录之间，若后一条的速度低于阈值，则这段时间计为等待
pub fn idle_time_statistics(
    tracks: &HashMap<u64, Vec<TrackPoint>>,
    idle_speed_threshold: f64,
) -> IdleTimeStatistics {
    let idle: Vec<f64> = tracks
        .values()
        .map(|track| {
            track
                .windows(2)
                .filter(|w| w[1].speed < idle_speed_threshold)
                .map(|w| (w[1].time - w[0].time).as_secs_f64())
                .sum::<f64>()
        })
        .collect();

    let total: f64 = idle.iter().sum();
    IdleTimeStatistics {
        cars_count: idle.len() as u64,
        idle_cars: idle.iter().filter(|t| **t > 0.0).count() as u64,
        average_idle_time: if idle.is_empty() {
            0.0
        } else {
            total / idle.len() as f64
        },
        max_idle_time: idle.iter().copied().fold(0.0, f64::max),
        total_idle_time: total,
    }
}

/// 断面通行量
///
/// 车辆在某条道路上第一次出现位置不小于断面位置的记录即为通过时刻，
/// 按仿真小时分桶。
pub fn throughput_statistics(
    definition: &JobDefinition,
    tracks: &HashMap<u64, Vec<TrackPoint>>,
) -> ThroughputStatistics {
    let duration = definition.simulation_parameters.duration;
    let hours = (duration / SECONDS_PER_HOUR).ceil().max(1.0) as usize;

    let positions = definition
        .throughput_positions()
        .into_iter()
        .map(|at| {
            let mut per_hour = vec![0u64; hours];
            for track in tracks.values() {
                let crossing = track
                    .iter()
                    .find(|p| p.road == at.road && p.position >= at.position);
                if let Some(p) = crossing {
                    let hour = (p.time.as_secs_f64() / SECONDS_PER_HOUR) as usize;
                    per_hour[hour.min(hours - 1)] += 1;
                }
            }
            let total: u64 = per_hour.iter().sum();
            PositionThroughput {
                road: at.road,
                position: at.position,
                total,
                per_hour,
                rate_per_hour: if duration > 0.0 {
                    total as f64 * SECONDS_PER_HOUR / duration
                } else {
                    0.0
                },
            }
        })
        .collect();

    ThroughputStatistics { positions }
}

/// 统计阶段执行器，每个阶段注册一个实例
pub struct StatisticsExecutor {
    store: Arc<dyn StateStore>,
    phase: TaskType,
    name: String,
}

impl StatisticsExecutor {
    pub fn new(store: Arc<dyn StateStore>, phase: TaskType) -> SchedulerResult<Self> {
        if !phase.is_statistics() {
            return Err(SchedulerError::config_error(format!(
                "{phase} 不是统计阶段"
            )));
        }
        Ok(Self {
            store,
            phase,
            name: format!("statistics:{phase}"),
        })
    }

    /// 为全部统计阶段各创建一个执行器
    pub fn all(store: Arc<dyn StateStore>) -> Vec<Self> {
        TaskType::STATISTICS
            .into_iter()
            .map(|phase| Self {
                store: store.clone(),
                phase,
                name: format!("statistics:{phase}"),
            })
            .collect()
    }

    async fn load_tracks(
        &self,
        project: &str,
        job: &str,
    ) -> SchedulerResult<HashMap<u64, Vec<TrackPoint>>> {
        let mut tracks = HashMap::new();
        for car_id in self.store.car_ids(project, job).await? {
            let track = self.store.car_track(project, job, car_id).await?;
            tracks.insert(car_id, track);
        }
        Ok(tracks)
    }
}

#[async_trait]
impl TaskExecutor for StatisticsExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_task_type(&self, task_type: TaskType) -> bool {
        task_type == self.phase
    }

    async fn execute(&self, task: &Task, _lease: &LeaseStatus) -> SchedulerResult<TaskOutcome> {
        let (project, job_name) = (task.project(), task.job());
        let job = self
            .store
            .get_job(project, job_name)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(project, job_name))?;
        if !job.progress.is_simulated() {
            return Err(SchedulerError::ProgressConflict(format!(
                "作业 {project}/{job_name} 仿真未完成，无法计算 {}",
                self.phase
            )));
        }

        let tracks = self.load_tracks(project, job_name).await?;
        let result = match self.phase {
            TaskType::BasicStatistics => {
                let added = self
                    .store
                    .car_event_times(project, job_name, CarState::Add)
                    .await?;
                let deleted = self
                    .store
                    .car_event_times(project, job_name, CarState::Del)
                    .await?;
                let stats = basic_statistics(&added, &deleted, &tracks);
                info!(
                    "作业 {}/{} 平均通过时间 {:.2}s，标准差 {:.2}s（{}/{} 辆驶出）",
                    project,
                    job_name,
                    stats.average_transit_time,
                    stats.transit_time_std_dev,
                    stats.finished_cars,
                    stats.cars_count
                );
                StatisticsResult::BasicStatistics(stats)
            }
            TaskType::IdleTimes => {
                let threshold = job.definition.statistics_parameters.idle_speed_threshold;
                let stats = idle_time_statistics(&tracks, threshold);
                info!(
                    "作业 {}/{} 平均等待 {:.2}s，{} 辆车曾停车",
                    project, job_name, stats.average_idle_time, stats.idle_cars
                );
                StatisticsResult::IdleTimes(stats)
            }
            TaskType::Throughput => {
                StatisticsResult::Throughput(throughput_statistics(&job.definition, &tracks))
            }
            TaskType::Simulation => {
                return Err(SchedulerError::Internal(format!(
                    "{} 收到仿真任务",
                    self.name
                )))
            }
        };
        Ok(TaskOutcome::Statistics { result })
    }
}
