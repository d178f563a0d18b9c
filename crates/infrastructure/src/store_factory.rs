use std::sync::Arc;

use tracing::info;

use traffic_core::config::StorageConfig;
use traffic_core::traits::StateStore;
use traffic_core::{SchedulerError, SchedulerResult};

use crate::database::SqliteStateStore;
use crate::memory_store::InMemoryStateStore;

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

impl StorageBackend {
    pub fn from_config(config: &StorageConfig) -> SchedulerResult<Self> {
        match config.backend.as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(SchedulerError::config_error(format!(
                "不支持的存储后端: {other}"
            ))),
        }
    }
}

/// 按配置创建状态存储
pub async fn create_state_store(config: &StorageConfig) -> SchedulerResult<Arc<dyn StateStore>> {
    match StorageBackend::from_config(config)? {
        StorageBackend::Memory => {
            info!("使用内存状态存储");
            Ok(Arc::new(InMemoryStateStore::new()))
        }
        StorageBackend::Sqlite => {
            info!("使用SQLite状态存储: {}", config.url);
            let store = SqliteStateStore::connect(&config.url, config.max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}
