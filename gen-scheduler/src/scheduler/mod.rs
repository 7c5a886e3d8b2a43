//! Durable task scheduling.
//!
//! Each task kind has its own queue, worker pool and stale reaper. Claims are
//! atomic in the database, so any number of workers (in any number of
//! processes sharing the database) never execute the same attempt twice.

pub mod aggregate;
pub mod config;
pub mod image;
pub mod manager;
pub mod outcome;
pub mod page;
pub mod reaper;
pub mod store;
pub mod video;
pub mod worker_pool;

pub use aggregate::{aggregate_status, refresh_record_status};
pub use config::{QueueConfig, RetryLadder};
pub use image::ImageTaskHandler;
pub use manager::{Scheduler, SchedulerConfig, SchedulerDeps};
pub use outcome::{Outcome, sanitize_error};
pub use page::{DEFAULT_PAGE_PROMPT, PageTaskHandler, render_page_prompt};
pub use reaper::StaleTaskReaper;
pub use store::{ClaimedTask, GenerationStore, PageStore, TaskStore};
pub use video::VideoTaskHandler;
pub use worker_pool::{TaskHandler, WorkerPool, execute, run_once};
