//! Database models.

pub mod composite;
pub mod task;

pub use composite::{
    CompositeRecordDbModel, PageDraft, PageStatusCounts, PageTaskDbModel, PageType, RecordStatus,
};
pub use task::{GenerationTaskDbModel, TaskFilter, TaskKind, TaskParams, TaskStatus};

use serde::{Deserialize, Serialize};

/// Fencing token handed out by a claim.
///
/// Post-claim writes match on both the id and the attempt number observed at
/// claim time, so a worker whose claim was superseded (stale requeue followed by
/// a fresh claim) cannot overwrite the newer execution's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub attempts: i64,
}

impl Claim {
    pub fn new(id: impl Into<String>, attempts: i64) -> Self {
        Self {
            id: id.into(),
            attempts,
        }
    }
}
