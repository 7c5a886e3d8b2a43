//! Repository layer.

pub mod composite;
pub mod rate_limit;
pub mod task;

pub use composite::{CompositeRepository, SqlxCompositeRepository};
pub use rate_limit::SqliteRateLimitStore;
pub use task::{SqlxTaskRepository, TaskRepository};
