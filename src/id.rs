//! Task id generation.
//!
//! Ids are sortable chronologically and generated as
//! `<epoch_ms>-<jobKey>-<shardId>-<uuid>` with non-word characters in the
//! job key collapsed to `-`.

use crate::task::JobKey;

/// Generate a new task id for `job`/`shard_id` at `now_ms`.
///
/// `now_ms` and the random suffix are taken as parameters rather than read
/// from the clock/RNG directly, so id generation stays deterministic and
/// testable; callers in production pass the manager's clock and a fresh
/// `Uuid::new_v4()`.
pub fn new_task_id(now_ms: i64, job: &JobKey, shard_id: i32, unique: uuid::Uuid) -> String {
    let job_key = sanitize(&format!("{job}"));
    format!("{now_ms}-{job_key}-{shard_id}-{unique}")
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}
