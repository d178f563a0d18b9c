pub mod definition;
pub mod job;
pub mod record;
pub mod report;
pub mod statistics;
pub mod task;

pub use definition::*;
pub use job::*;
pub use record::*;
pub use report::*;
pub use statistics::*;
pub use task::*;
