use async_trait::async_trait;

use crate::models::{
    CarState, Job, JobDefinition, JobProgress, StatisticsResult, StepRecord, TrackPoint,
};
use crate::time::SimTime;
use crate::SchedulerResult;

/// 状态存储契约
///
/// 保存项目、作业、进度、每个作业唯一的当前完整快照，
/// 以及按 (作业, 时间) 和 (作业, 车辆) 索引、只追加的逐步状态记录。
///
/// 连接类的暂时性故障应映射为 `StorageUnavailable`，由调用方决定是否重试。
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_project(&self, name: &str) -> SchedulerResult<()>;

    /// 删除项目及其全部作业和记录
    async fn delete_project(&self, name: &str) -> SchedulerResult<()>;

    async fn project_exists(&self, name: &str) -> SchedulerResult<bool>;

    async fn list_projects(&self) -> SchedulerResult<Vec<String>>;

    /// 名称在项目内已被占用时返回 `JobAlreadyExists`
    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<Job>;

    async fn get_job(&self, project: &str, job: &str) -> SchedulerResult<Option<Job>>;

    async fn list_jobs(&self, project: &str) -> SchedulerResult<Vec<String>>;

    async fn delete_job(&self, project: &str, job: &str) -> SchedulerResult<()>;

    async fn save_progress(
        &self,
        project: &str,
        job: &str,
        progress: &JobProgress,
    ) -> SchedulerResult<()>;

    async fn get_full_state(
        &self,
        project: &str,
        job: &str,
    ) -> SchedulerResult<Option<serde_json::Value>>;

    /// 覆盖（而非追加）作业的当前完整快照
    async fn set_full_state(
        &self,
        project: &str,
        job: &str,
        state: serde_json::Value,
    ) -> SchedulerResult<()>;

    /// 原子地写入批末快照并推进进度
    ///
    /// 进度规则见 [`JobProgress::advance`]：`from_step` 必须等于当前 `done`。
    async fn commit_simulation_batch(
        &self,
        project: &str,
        job: &str,
        from_step: u64,
        steps: u64,
        full_state: serde_json::Value,
    ) -> SchedulerResult<JobProgress>;

    /// 保存一个统计阶段的结果并标记该阶段完成
    async fn save_statistics(
        &self,
        project: &str,
        job: &str,
        result: StatisticsResult,
    ) -> SchedulerResult<JobProgress>;

    async fn add_states(
        &self,
        project: &str,
        job: &str,
        records: &[StepRecord],
    ) -> SchedulerResult<()>;

    /// 幂等地删除作业中 `time >= from_time` 的全部状态和车辆记录，返回删除的步数
    async fn repair(&self, project: &str, job: &str, from_time: SimTime) -> SchedulerResult<u64>;

    /// 按时间排序的逐步记录
    async fn list_states(&self, project: &str, job: &str) -> SchedulerResult<Vec<StepRecord>>;

    async fn count_states(&self, project: &str, job: &str) -> SchedulerResult<u64>;

    /// 指定状态（add/del）的车辆及其记录时间
    async fn car_event_times(
        &self,
        project: &str,
        job: &str,
        state: CarState,
    ) -> SchedulerResult<Vec<(u64, SimTime)>>;

    async fn car_ids(&self, project: &str, job: &str) -> SchedulerResult<Vec<u64>>;

    async fn car_track(
        &self,
        project: &str,
        job: &str,
        car_id: u64,
    ) -> SchedulerResult<Vec<TrackPoint>>;
}
