//! gen-scheduler library crate.
//!
//! Durable scheduling of generative media tasks against a slow, rate-limited
//! provider: claim-based worker queues with retry and stale recovery, and
//! per-(user, model) admission control in front of them.

pub mod admission;
pub mod config;
pub mod database;
pub mod error;
pub mod generation;
pub mod logging;
pub mod panic_hook;
pub mod scheduler;
pub mod services;
pub mod storage;

pub use error::{Error, Result};
