//! 任务执行器与按任务类型查找执行器的注册表

pub mod simulation;
pub mod statistics;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use traffic_core::models::TaskType;
use traffic_core::traits::{StateStore, TaskExecutor};

pub use simulation::SimulationExecutor;
pub use statistics::StatisticsExecutor;

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仿真和全部统计阶段的执行器，只保留 `task_types` 中列出的类型
    pub fn with_defaults(
        store: Arc<dyn StateStore>,
        db_batch_length: usize,
        task_types: &[TaskType],
    ) -> Self {
        let mut registry = Self::new();
        if task_types.contains(&TaskType::Simulation) {
            registry.register(
                TaskType::Simulation,
                Arc::new(SimulationExecutor::new(store.clone(), db_batch_length)),
            );
        }
        for executor in StatisticsExecutor::all(store) {
            if let Some(phase) = TaskType::STATISTICS
                .into_iter()
                .find(|t| executor.supports_task_type(*t) && task_types.contains(t))
            {
                registry.register(phase, Arc::new(executor));
            }
        }
        registry
    }

    pub fn register(&mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) {
        info!("注册执行器 {} -> {}", task_type, executor.name());
        self.executors.insert(task_type, executor);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    /// 按固定顺序返回已注册的任务类型
    pub fn supported_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traffic_core::models::{Task, TaskOutcome};
    use traffic_core::traits::LeaseStatus;
    use traffic_core::SchedulerResult;

    struct NoopExecutor;

    #[async_trait::async_trait]
    impl TaskExecutor for NoopExecutor {
        fn name(&self) -> &str {
            "noop"
        }

        fn supports_task_type(&self, _task_type: TaskType) -> bool {
            true
        }

        async fn execute(
            &self,
            _task: &Task,
            _lease: &LeaseStatus,
        ) -> SchedulerResult<TaskOutcome> {
            Err(traffic_core::SchedulerError::Internal("noop".into()))
        }
    }

    #[test]
    fn test_supported_types_follow_registration() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.supported_types().is_empty());
        registry.register(TaskType::Throughput, Arc::new(NoopExecutor));
        registry.register(TaskType::Simulation, Arc::new(NoopExecutor));
        assert_eq!(
            registry.supported_types(),
            vec![TaskType::Simulation, TaskType::Throughput]
        );
        assert!(registry.get(TaskType::IdleTimes).is_none());
        assert_eq!(registry.get(TaskType::Simulation).unwrap().name(), "noop");
    }
}
