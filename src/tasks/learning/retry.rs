use anyhow::Result;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use crate::db::models::QueuedJob;
use crate::repositories::store::WorkerTx;

/// `base × 2^retry_count`, saturating instead of overflowing.
pub(crate) fn backoff_delay(base_seconds: u64, retry_count: i32) -> Duration {
    let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0);
    let factor = 2_u64.checked_pow(exponent).unwrap_or(u64::MAX);
    let seconds = base_seconds.saturating_mul(factor);
    Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
}

/// Whether a transient failure on this delivery may still be retried.
pub(crate) fn retries_remaining(retry_count: i32, max_retries: u32) -> bool {
    i64::from(retry_count) < i64::from(max_retries)
}

/// When a job retried `retry_count` times becomes visible again; pins to the
/// latest representable instant instead of wrapping back to `now`.
pub(crate) fn retry_visible_at(
    now: OffsetDateTime,
    base_seconds: u64,
    retry_count: i32,
) -> OffsetDateTime {
    now.checked_add(backoff_delay(base_seconds, retry_count))
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

/// Puts the job back in the queue behind its backoff window and returns when it becomes visible.
pub(crate) async fn schedule_retry(
    tx: &mut dyn WorkerTx,
    job: &QueuedJob,
    now: OffsetDateTime,
    base_seconds: u64,
) -> Result<OffsetDateTime> {
    let next_visible_at = retry_visible_at(now, base_seconds, job.retry_count);
    let next_retry = job.retry_count.saturating_add(1);
    tx.requeue_job(job.id, next_retry, next_visible_at).await?;
    Ok(next_visible_at)
}
