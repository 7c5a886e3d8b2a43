//! Caller-facing operations. Every new unit of work passes admission first.

pub mod composite;
pub mod task;

pub use composite::{CompositeService, NewRecord, RecordView, normalize_pages};
pub use task::{NewTask, TaskService};
