use chrono::{Months, NaiveDate};
use tracing::info;

use crate::context::Clock;
use crate::error::{AppError, Result};
use crate::store::{NewBatch, Session};

/// Length of a batch created on demand.
pub const DEFAULT_BATCH_MONTHS: u32 = 3;

/// The batch opened for `course_id` when it has no active one.
pub fn default_batch(course_id: i64, clock: &Clock) -> Result<NewBatch> {
    let start_date: NaiveDate = clock.today;
    let end_date = start_date
        .checked_add_months(Months::new(DEFAULT_BATCH_MONTHS))
        .ok_or_else(|| AppError::validation(format!("cannot schedule a batch from {start_date}")))?;
    Ok(NewBatch {
        course_id,
        batch_name: format!("Batch for Course {course_id} - {}", start_date.format("%Y-%m-%d")),
        start_date,
        end_date,
        created_at: clock.now,
    })
}

/// Returns the newest active batch of the course, creating one if none exists.
pub async fn resolve_batch(session: &mut dyn Session, course_id: i64, clock: &Clock) -> Result<i64> {
    if let Some(batch_id) = session.active_batch(course_id).await? {
        return Ok(batch_id);
    }
    let batch = default_batch(course_id, clock)?;
    let batch_id = session.insert_batch(&batch).await?;
    info!(course_id, batch_id, end_date = %batch.end_date, "created default batch");
    Ok(batch_id)
}
