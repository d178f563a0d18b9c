pub mod database;
pub mod memory_store;
pub mod store_factory;

pub use database::SqliteStateStore;
pub use memory_store::InMemoryStateStore;
pub use store_factory::{create_state_store, StorageBackend};
