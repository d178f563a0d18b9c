use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use traffic_core::models::{
    CarState, Job, JobDefinition, JobProgress, JobStatistics, StatisticsResult, StepRecord,
    TrackPoint,
};
use traffic_core::traits::StateStore;
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

struct JobEntry {
    job: Job,
    full_state: Option<Value>,
    states: BTreeMap<SimTime, StepRecord>,
}

/// 内存状态存储
///
/// 适用于 `all` 模式的单进程部署和测试；进程退出后数据丢失。
#[derive(Default)]
pub struct InMemoryStateStore {
    projects: RwLock<HashMap<String, BTreeMap<String, JobEntry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn job_mut<'a>(
    projects: &'a mut HashMap<String, BTreeMap<String, JobEntry>>,
    project: &str,
    job: &str,
) -> SchedulerResult<&'a mut JobEntry> {
    projects
        .get_mut(project)
        .ok_or_else(|| SchedulerError::project_not_found(project))?
        .get_mut(job)
        .ok_or_else(|| SchedulerError::job_not_found(project, job))
}

fn job_ref<'a>(
    projects: &'a HashMap<String, BTreeMap<String, JobEntry>>,
    project: &str,
    job: &str,
) -> SchedulerResult<&'a JobEntry> {
    projects
        .get(project)
        .ok_or_else(|| SchedulerError::project_not_found(project))?
        .get(job)
        .ok_or_else(|| SchedulerError::job_not_found(project, job))
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_project(&self, name: &str) -> SchedulerResult<()> {
        let mut projects = self.projects.write().await;
        if projects.contains_key(name) {
            return Err(SchedulerError::ProjectAlreadyExists {
                name: name.to_string(),
            });
        }
        projects.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> SchedulerResult<()> {
        self.projects
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::project_not_found(name))
    }

    async fn project_exists(&self, name: &str) -> SchedulerResult<bool> {
        Ok(self.projects.read().await.contains_key(name))
    }

    async fn list_projects(&self) -> SchedulerResult<Vec<String>> {
        let mut names: Vec<String> = self.projects.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<Job> {
        definition.validate()?;
        let progress = JobProgress::for_definition(&definition)?;
        let mut projects = self.projects.write().await;
        let jobs = projects
            .get_mut(project)
            .ok_or_else(|| SchedulerError::project_not_found(project))?;
        if jobs.contains_key(name) {
            return Err(SchedulerError::JobAlreadyExists {
                project: project.to_string(),
                job: name.to_string(),
            });
        }
        let job = Job {
            project: project.to_string(),
            name: name.to_string(),
            definition,
            progress,
            statistics: JobStatistics::default(),
        };
        jobs.insert(
            name.to_string(),
            JobEntry {
                job: job.clone(),
                full_state: None,
                states: BTreeMap::new(),
            },
        );
        Ok(job)
    }

    async fn get_job(&self, project: &str, job: &str) -> SchedulerResult<Option<Job>> {
        let projects = self.projects.read().await;
        Ok(projects
            .get(project)
            .and_then(|jobs| jobs.get(job))
            .map(|entry| entry.job.clone()))
    }

    async fn list_jobs(&self, project: &str) -> SchedulerResult<Vec<String>> {
        let projects = self.projects.read().await;
        let jobs = projects
            .get(project)
            .ok_or_else(|| SchedulerError::project_not_found(project))?;
        Ok(jobs.keys().cloned().collect())
    }

    async fn delete_job(&self, project: &str, job: &str) -> SchedulerResult<()> {
        let mut projects = self.projects.write().await;
        projects
            .get_mut(project)
            .ok_or_else(|| SchedulerError::project_not_found(project))?
            .remove(job)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::job_not_found(project, job))
    }

    async fn save_progress(
        &self,
        project: &str,
        job: &str,
        progress: &JobProgress,
    ) -> SchedulerResult<()> {
        let mut projects = self.projects.write().await;
        job_mut(&mut projects, project, job)?.job.progress = *progress;
        Ok(())
    }

    async fn get_full_state(&self, project: &str, job: &str) -> SchedulerResult<Option<Value>> {
        let projects = self.projects.read().await;
        Ok(job_ref(&projects, project, job)?.full_state.clone())
    }

    async fn set_full_state(&self, project: &str, job: &str, state: Value) -> SchedulerResult<()> {
        let mut projects = self.projects.write().await;
        job_mut(&mut projects, project, job)?.full_state = Some(state);
        Ok(())
    }

    async fn commit_simulation_batch(
        &self,
        project: &str,
        job: &str,
        from_step: u64,
        steps: u64,
        full_state: Value,
    ) -> SchedulerResult<JobProgress> {
        let mut projects = self.projects.write().await;
        let entry = job_mut(&mut projects, project, job)?;
        let mut progress = entry.job.progress;
        progress.advance(from_step, steps)?;
        entry.job.progress = progress;
        entry.full_state = Some(full_state);
        Ok(progress)
    }

    async fn save_statistics(
        &self,
        project: &str,
        job: &str,
        result: StatisticsResult,
    ) -> SchedulerResult<JobProgress> {
        let mut projects = self.projects.write().await;
        let entry = job_mut(&mut projects, project, job)?;
        let mut progress = entry.job.progress;
        progress.mark_phase(result.task_type())?;
        entry.job.progress = progress;
        entry.job.statistics.apply(result);
        Ok(progress)
    }

    async fn add_states(
        &self,
        project: &str,
        job: &str,
        records: &[StepRecord],
    ) -> SchedulerResult<()> {
        let mut projects = self.projects.write().await;
        let entry = job_mut(&mut projects, project, job)?;
        for record in records {
            entry.states.insert(record.time, record.clone());
        }
        Ok(())
    }

    async fn repair(&self, project: &str, job: &str, from_time: SimTime) -> SchedulerResult<u64> {
        let mut projects = self.projects.write().await;
        let entry = job_mut(&mut projects, project, job)?;
        let removed = entry.states.split_off(&from_time).len() as u64;
        if removed > 0 {
            debug!("作业 {}/{} 删除 {} 条状态记录", project, job, removed);
        }
        Ok(removed)
    }

    async fn list_states(&self, project: &str, job: &str) -> SchedulerResult<Vec<StepRecord>> {
        let projects = self.projects.read().await;
        Ok(job_ref(&projects, project, job)?
            .states
            .values()
            .cloned()
            .collect())
    }

    async fn count_states(&self, project: &str, job: &str) -> SchedulerResult<u64> {
        let projects = self.projects.read().await;
        Ok(job_ref(&projects, project, job)?.states.len() as u64)
    }

    async fn car_event_times(
        &self,
        project: &str,
        job: &str,
        state: CarState,
    ) -> SchedulerResult<Vec<(u64, SimTime)>> {
        let projects = self.projects.read().await;
        let entry = job_ref(&projects, project, job)?;
        let mut events: Vec<(u64, SimTime)> = entry
            .states
            .values()
            .flat_map(|r| {
                r.cars
                    .iter()
                    .filter(|c| c.state == state)
                    .map(move |c| (c.id, r.time))
            })
            .collect();
        events.sort();
        Ok(events)
    }

    async fn car_ids(&self, project: &str, job: &str) -> SchedulerResult<Vec<u64>> {
        let projects = self.projects.read().await;
        let entry = job_ref(&projects, project, job)?;
        let ids: BTreeSet<u64> = entry
            .states
            .values()
            .flat_map(|r| r.cars.iter().map(|c| c.id))
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn car_track(
        &self,
        project: &str,
        job: &str,
        car_id: u64,
    ) -> SchedulerResult<Vec<TrackPoint>> {
        let projects = self.projects.read().await;
        let entry = job_ref(&projects, project, job)?;
        Ok(entry
            .states
            .values()
            .flat_map(|r| {
                r.cars
                    .iter()
                    .filter(|c| c.id == car_id)
                    .map(move |c| TrackPoint::from_record(r.time, c))
            })
            .collect())
    }
}
