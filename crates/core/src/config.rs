use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::models::TaskType;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory` 或 `sqlite`
    pub backend: String,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub bind_address: String,
    /// Worker心跳间隔（毫秒），随任务下发
    pub notification_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 为空时启动时生成随机ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub scheduler_url: String,
    pub task_types: Vec<TaskType>,
    /// 队列为空或出错时的轮询间隔（毫秒）
    pub check_interval_ms: u64,
    /// 逐步记录的写入批大小
    pub db_batch_length: usize,
    pub finish_retry_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub scheduler_url: String,
    pub check_interval_seconds: u64,
    pub restart_task_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `json` 或 `pretty`
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: "sqlite".to_string(),
                url: "sqlite://traffic.db?mode=rwc".to_string(),
                max_connections: 5,
            },
            scheduler: SchedulerConfig {
                bind_address: "127.0.0.1:8046".to_string(),
                notification_interval_ms: 10_000,
            },
            worker: WorkerConfig {
                worker_id: None,
                scheduler_url: "http://127.0.0.1:8046".to_string(),
                task_types: TaskType::ALL.to_vec(),
                check_interval_ms: 5_000,
                db_batch_length: 50,
                finish_retry_limit: 5,
            },
            supervisor: SupervisorConfig {
                scheduler_url: "http://127.0.0.1:8046".to_string(),
                check_interval_seconds: 30,
                restart_task_timeout_seconds: 120,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
                metrics_enabled: true,
            },
        }
    }
}

impl AppConfig {
    /// 加载配置：默认值 → TOML文件 → `TRAFFIC__` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TRAFFIC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.scheduler.validate()?;
        self.worker.validate()?;
        self.supervisor.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self.backend.as_str() {
            "memory" => {}
            "sqlite" => {
                if !self.url.starts_with("sqlite:") {
                    return Err(anyhow::anyhow!("SQLite存储URL必须以 sqlite: 开头"));
                }
            }
            other => return Err(anyhow::anyhow!("不支持的存储后端: {other}")),
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("调度器监听地址不能为空"));
        }
        if self.notification_interval_ms == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.worker_id {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("Worker ID不能为空字符串"));
            }
        }
        if !self.scheduler_url.starts_with("http://") && !self.scheduler_url.starts_with("https://")
        {
            return Err(anyhow::anyhow!(
                "调度器地址必须是HTTP URL: {}",
                self.scheduler_url
            ));
        }
        if self.task_types.is_empty() {
            return Err(anyhow::anyhow!("Worker至少需要支持一种任务类型"));
        }
        if self.check_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }
        if self.db_batch_length == 0 {
            return Err(anyhow::anyhow!("写入批大小必须大于0"));
        }
        Ok(())
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("检查间隔必须大于0"));
        }
        if self.restart_task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }
        Ok(())
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.task_types.len(), 4);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.scheduler.bind_address, config.scheduler.bind_address);
        assert_eq!(parsed.worker.task_types, config.worker.task_types);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[storage]
backend = "memory"
url = "memory://"
max_connections = 1

[supervisor]
scheduler_url = "http://10.0.0.1:8046"
check_interval_seconds = 5
restart_task_timeout_seconds = 60
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.supervisor.restart_task_timeout_seconds, 60);
        // 未出现在文件中的部分保持默认值
        assert_eq!(config.worker.db_batch_length, 50);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.storage.backend = "mongodb".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.task_types.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.observability.log_format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.supervisor.restart_task_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}
