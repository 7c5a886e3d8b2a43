//! Composite record status derived from its pages.

use tracing::debug;

use crate::Result;
use crate::database::models::{PageStatusCounts, RecordStatus};
use crate::database::repositories::CompositeRepository;

/// Record status for the given page counts.
pub fn aggregate_status(counts: &PageStatusCounts) -> RecordStatus {
    counts.record_status()
}

/// Recompute and store a record's status after a page reached a terminal state.
///
/// Counting and writing happen under one write lock, so the last refresh to
/// commit always reflects every page transition committed before it.
pub async fn refresh_record_status(
    repo: &dyn CompositeRepository,
    record_id: &str,
) -> Result<RecordStatus> {
    let (counts, status) = repo.recompute_record_status(record_id).await?;
    debug!(
        record_id,
        status = status.as_str(),
        total = counts.total,
        succeeded = counts.succeeded,
        failed = counts.failed,
        "Record status refreshed"
    );
    Ok(status)
}
