//! The small configuration surface owned by the core itself.
//!
//! Process bootstrap, CLI argument parsing, and environment loading are out
//! of scope; this struct only names the tunables the core itself consults
//! and leaves wiring it up to the embedding application.

use crate::resources::ResourceBag;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables owned by the preemption engine and the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tasks in {ASSIGNED, STARTING, PREEMPTING, RESTARTING, KILLING} whose
    /// last transition event is older than this are considered lost.
    #[serde(with = "duration_secs")]
    pub missing_task_grace_period: Duration,

    /// Failure count above which a RUNNING -> FAILED transition is terminal
    /// rather than triggering a RESCHEDULE.
    pub max_task_failures: u32,

    /// Fixed per-task resource addend added to both the victim's freeable
    /// bag and the pending task's required bag during preemption.
    pub executor_overhead: ResourceBag,

    /// Reserved for future sharded update batching. Update registration
    /// is unbatched today; this field exists only so a caller that wants
    /// batching has somewhere to put the knob without a breaking config
    /// change.
    pub update_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            missing_task_grace_period: Duration::from_secs(15 * 60),
            max_task_failures: 10,
            executor_overhead: ResourceBag::from_pairs([
                (crate::resources::ResourceKind::Cpu, 0.25),
                (crate::resources::ResourceKind::RamMb, 128.0),
            ]),
            update_batch_size: 1,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
