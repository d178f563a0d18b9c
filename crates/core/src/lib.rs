pub mod config;
pub mod logging;
pub mod models;
pub mod storage;
pub mod time;
pub mod traits;

pub use config::AppConfig;
pub use logging::init_logging;
pub use storage::StateStorage;
pub use time::SimTime;
pub use traffic_errors::{SchedulerError, SchedulerResult};
