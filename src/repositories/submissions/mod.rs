mod commands;
mod queries;
mod types;

pub(crate) use commands::{mark_completed, mark_failed, mark_retry};
pub(crate) use queries::find_by_id;
pub(crate) use types::CompletedUpdate;
