use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use traffic_api::{create_app, install_metrics_recorder, serve, RpcSchedulerClient};
use traffic_core::models::JobDefinition;
use traffic_core::traits::{SchedulerService, StateStore};
use traffic_core::AppConfig;
use traffic_dispatcher::{Scheduler, Supervisor};
use traffic_infrastructure::{create_state_store, StorageBackend};
use traffic_simulation::{run_offline, OfflineSummary, OutputFormat, RandomSource};
use traffic_worker::{ExecutorRegistry, WorkerService};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 调度器与RPC服务
    Scheduler,
    /// 通过RPC连接调度器的Worker
    Worker,
    /// 通过RPC连接调度器的租约监督者
    Supervisor,
    /// 单进程内运行全部组件
    All,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "worker" => Ok(AppMode::Worker),
            "supervisor" => Ok(AppMode::Supervisor),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::Scheduler => "scheduler",
            AppMode::Worker => "worker",
            AppMode::Supervisor => "supervisor",
            AppMode::All => "all",
        };
        f.write_str(name)
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        info!("初始化应用程序，模式: {}", mode);
        Self { config, mode }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {}", self.mode);

        match self.mode {
            AppMode::Scheduler => self.run_scheduler(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::Supervisor => self.run_supervisor(shutdown_rx).await,
            AppMode::All => self.run_all(shutdown_rx).await,
        }
    }

    async fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        create_state_store(&self.config.storage)
            .await
            .context("打开状态存储失败")
    }

    fn build_scheduler(&self, store: Arc<dyn StateStore>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            store,
            self.config.scheduler.notification_interval_ms,
        ))
    }

    fn build_worker(
        &self,
        scheduler: Arc<dyn SchedulerService>,
        store: Arc<dyn StateStore>,
    ) -> WorkerService {
        let worker_config = self.config.worker.clone();
        let registry = ExecutorRegistry::with_defaults(
            store,
            worker_config.db_batch_length,
            &worker_config.task_types,
        );
        WorkerService::new(scheduler, registry, worker_config)
    }

    fn metrics_handle(&self) -> Option<metrics_exporter_prometheus::PrometheusHandle> {
        if !self.config.observability.metrics_enabled {
            return None;
        }
        match install_metrics_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("指标导出不可用: {e:#}");
                None
            }
        }
    }

    /// 运行调度器模式
    async fn run_scheduler(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动调度器服务");
        let store = self.open_store().await?;
        let scheduler = self.build_scheduler(store);

        let app = create_app(scheduler, self.metrics_handle());
        serve(app, &self.config.scheduler.bind_address, shutdown_rx).await?;

        info!("调度器服务已停止");
        Ok(())
    }

    /// 运行Worker模式
    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Worker服务，调度器地址: {}", self.config.worker.scheduler_url);
        if StorageBackend::from_config(&self.config.storage)? == StorageBackend::Memory {
            warn!("独立Worker进程使用内存存储，仿真记录无法与调度器共享");
        }

        let store = self.open_store().await?;
        let client = RpcSchedulerClient::new(&self.config.worker.scheduler_url)?;
        let worker = self.build_worker(Arc::new(client), store);
        info!("Worker ID: {}", worker.worker_id());

        worker.run(shutdown_rx).await;
        Ok(())
    }

    /// 运行监督者模式
    async fn run_supervisor(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "启动租约监督者，调度器地址: {}",
            self.config.supervisor.scheduler_url
        );
        let client = RpcSchedulerClient::new(&self.config.supervisor.scheduler_url)?;
        let supervisor = Supervisor::new(Arc::new(client), self.config.supervisor.clone());

        supervisor.run(shutdown_rx).await;
        Ok(())
    }

    /// 单进程运行全部组件，Worker与监督者直接调用调度器
    async fn run_all(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动所有组件");
        let store = self.open_store().await?;
        let scheduler = self.build_scheduler(store.clone());
        let service: Arc<dyn SchedulerService> = scheduler.clone();

        let worker = Arc::new(self.build_worker(service.clone(), store));
        let supervisor = Arc::new(Supervisor::new(
            service.clone(),
            self.config.supervisor.clone(),
        ));

        let worker_handle: JoinHandle<()> = {
            let worker = Arc::clone(&worker);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        };

        let supervisor_handle: JoinHandle<()> = {
            let supervisor = Arc::clone(&supervisor);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { supervisor.run(shutdown_rx).await })
        };

        let app = create_app(service, self.metrics_handle());
        let served = serve(app, &self.config.scheduler.bind_address, shutdown_rx).await;
        if served.is_err() {
            worker.stop().await;
            supervisor.stop().await;
        }

        for (name, handle) in [("Worker", worker_handle), ("Supervisor", supervisor_handle)] {
            if let Err(e) = handle.await {
                error!("{} 任务异常退出: {}", name, e);
            }
        }

        served?;
        info!("所有组件已停止");
        Ok(())
    }
}

/// 按扩展名读取作业定义：`.toml` 按TOML解析，其余按JSON解析
pub fn load_definition(path: &Path) -> Result<JobDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取模型文件失败: {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    let definition = if is_toml {
        JobDefinition::from_toml_str(&text)
    } else {
        JobDefinition::from_json_str(&text)
    };
    definition.with_context(|| format!("解析模型文件失败: {}", path.display()))
}

/// 不经过调度器，在本地运行整个仿真并写出结果文件
pub fn run_simulation(model: &Path, out_dir: &Path, format: &str) -> Result<OfflineSummary> {
    let definition = load_definition(model)?;
    let format: OutputFormat = format.parse()?;
    let random = RandomSource::from_definition(&definition);

    info!(
        "离线仿真 {}，输出目录 {}",
        model.display(),
        out_dir.display()
    );
    let summary = run_offline(&definition, out_dir, format, &random)?;
    info!(
        "仿真完成: {} 步，结束时间 {}，共 {} 辆车，{} 辆驶出",
        summary.steps, summary.final_time, summary.cars_seen, summary.finished_cars
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        for mode in ["scheduler", "worker", "supervisor", "all"] {
            let parsed: AppMode = mode.parse().unwrap();
            assert_eq!(parsed.to_string(), mode);
        }
        assert!("dispatcher".parse::<AppMode>().is_err());
    }

    #[test]
    fn test_load_definition_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let definition = JobDefinition::single_road(150.0, 1, 300.0).with_seed(3);

        let json_path = dir.path().join("road.json");
        std::fs::write(&json_path, serde_json::to_string(&definition).unwrap()).unwrap();
        assert_eq!(load_definition(&json_path).unwrap().roads.len(), 1);

        let broken = dir.path().join("road.toml");
        std::fs::write(&broken, "{ not toml").unwrap();
        assert!(load_definition(&broken).is_err());
        assert!(load_definition(&dir.path().join("missing.json")).is_err());
    }
}
