pub mod app;
pub mod shutdown;

pub use app::{load_definition, run_simulation, AppMode, Application};
pub use shutdown::ShutdownManager;
