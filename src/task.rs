//! Core data model: task configuration, scheduled task records, and the
//! schedule status enumeration.

use crate::resources::ResourceBag;
use serde::{Deserialize, Serialize};

/// Identifies a job uniquely within the cluster (`role/name`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

/// A reference to a scheduling tier, which determines preemptibility and
/// revocability. The tier catalogue itself is a plug-in contract; this is
/// only the reference a `TaskConfig` carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierName(pub String);

/// Boolean facets of a tier, as returned by the tier-manager contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub is_preemptible: bool,
    pub is_revocable: bool,
}

/// Immutable description of a workload unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub job: JobKey,
    pub shard_id: i32,
    pub resources: ResourceBag,
    pub priority: i32,
    pub tier: TierName,
    pub command: Option<String>,
}

impl TaskConfig {
    pub fn role(&self) -> &str {
        &self.job.role
    }
}

/// Expands `%task_id%`, `%host%`, and `%port:NAME%` placeholders in a
/// command template against a concrete assignment. Placeholders naming a
/// port not present in `assigned_ports` are left untouched.
pub fn expand_command_template(
    template: &str,
    task_id: &str,
    slave_host: &str,
    assigned_ports: &std::collections::BTreeMap<String, i32>,
) -> String {
    let mut expanded = template.replace("%task_id%", task_id).replace("%host%", slave_host);
    for (name, port) in assigned_ports {
        expanded = expanded.replace(&format!("%port:{name}%"), &port.to_string());
    }
    expanded
}

/// The finite set of schedule statuses. `Init` is the pre-persistence
/// state; `Unknown` marks non-existent ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Init,
    Pending,
    Assigned,
    Starting,
    Running,
    Failed,
    Finished,
    Preempting,
    Restarting,
    Killing,
    Killed,
    Lost,
    Unknown,
}

impl ScheduleStatus {
    /// Terminal statuses absorb further status callbacks idempotently.
    /// `Failed` is only terminal once the retry budget is
    /// exhausted; the state machine tracks that separately via the task's
    /// failure count, so this helper reports the status-only view.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Finished | ScheduleStatus::Killed | ScheduleStatus::Lost
        )
    }

    /// Statuses considered "live" for the `taskHosts` invariant: present
    /// from ASSIGNED through KILLING inclusive.
    pub fn is_assigned_live(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Assigned
                | ScheduleStatus::Starting
                | ScheduleStatus::Running
                | ScheduleStatus::Preempting
                | ScheduleStatus::Restarting
                | ScheduleStatus::Killing
        )
    }

    /// Non-terminal ("active") statuses, used by `activeQuery`.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, ScheduleStatus::Unknown)
    }

    /// Tasks in this set are subject to the missing-task timeout rule.
    pub fn is_timeout_eligible(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Assigned
                | ScheduleStatus::Starting
                | ScheduleStatus::Preempting
                | ScheduleStatus::Restarting
                | ScheduleStatus::Killing
        )
    }
}

/// One entry in a task's historical transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub timestamp_ms: i64,
    pub status: ScheduleStatus,
    pub audit_message: Option<String>,
}

/// A task's assignment to a specific host, once scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub slave_id: String,
    pub slave_host: String,
    pub assigned_ports: std::collections::BTreeMap<String, i32>,
}

/// A mutable record wrapping a `TaskConfig` with identity and runtime
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub config: TaskConfig,
    pub status: ScheduleStatus,
    events: Vec<TransitionEvent>,
    pub failure_count: u32,
    pub assignment: Option<Assignment>,
    pub ancestor_id: Option<String>,
}

impl ScheduledTask {
    pub fn new(task_id: String, config: TaskConfig) -> Self {
        Self {
            task_id,
            config,
            status: ScheduleStatus::Init,
            events: Vec::new(),
            failure_count: 0,
            assignment: None,
            ancestor_id: None,
        }
    }

    pub fn job(&self) -> &JobKey {
        &self.config.job
    }

    /// Read-only access to the ordered transition history.
    pub fn events(&self) -> &[TransitionEvent] {
        &self.events
    }

    pub fn push_event(&mut self, status: ScheduleStatus, timestamp_ms: i64, audit_message: Option<String>) {
        self.events.push(TransitionEvent {
            timestamp_ms,
            status,
            audit_message,
        });
    }

    pub fn last_event_timestamp_ms(&self) -> Option<i64> {
        self.events.last().map(|e| e.timestamp_ms)
    }

    /// Whether this task's status is terminal. A `Failed` task is
    /// only terminal once its failure count exceeds the configured retry
    /// limit; callers that need that distinction should compare
    /// `failure_count` against `SchedulerConfig::max_task_failures`
    /// themselves, since the limit is not known to `ScheduledTask`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Projection of a scheduled task sufficient for the preemption engine.
#[derive(Debug, Clone)]
pub struct PreemptionVictim {
    pub task_id: String,
    pub config: TaskConfig,
    pub resources: ResourceBag,
    pub slave_host: String,
}

/// An on-host resource envelope: resources already free before any
/// preemption.
#[derive(Debug, Clone)]
pub struct HostOffer {
    pub hostname: String,
    pub slave_id: String,
    pub offered_resources: ResourceBag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ScheduleStatus::Finished.is_terminal());
        assert!(ScheduleStatus::Killed.is_terminal());
        assert!(ScheduleStatus::Lost.is_terminal());
        assert!(!ScheduleStatus::Running.is_terminal());
        assert!(!ScheduleStatus::Failed.is_terminal());
    }

    #[test]
    fn assigned_live_set_matches_expected_range() {
        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Starting,
            ScheduleStatus::Running,
            ScheduleStatus::Preempting,
            ScheduleStatus::Restarting,
            ScheduleStatus::Killing,
        ] {
            assert!(status.is_assigned_live(), "{status:?} should be live");
        }
        for status in [
            ScheduleStatus::Init,
            ScheduleStatus::Pending,
            ScheduleStatus::Failed,
            ScheduleStatus::Finished,
            ScheduleStatus::Killed,
            ScheduleStatus::Lost,
            ScheduleStatus::Unknown,
        ] {
            assert!(!status.is_assigned_live(), "{status:?} should not be live");
        }
    }

    #[test]
    fn expand_command_template_substitutes_host_id_and_named_ports() {
        let ports = std::collections::BTreeMap::from([("http".to_string(), 31000), ("admin".to_string(), 31001)]);
        let expanded = expand_command_template(
            "serve --id=%task_id% --host=%host% --port=%port:http% --admin=%port:admin%",
            "t1",
            "host-1",
            &ports,
        );
        assert_eq!(expanded, "serve --id=t1 --host=host-1 --port=31000 --admin=31001");
    }

    #[test]
    fn expand_command_template_leaves_unknown_port_placeholder_untouched() {
        let expanded = expand_command_template("serve --port=%port:missing%", "t1", "host-1", &Default::default());
        assert_eq!(expanded, "serve --port=%port:missing%");
    }

    #[test]
    fn events_accumulate_in_order() {
        let config = TaskConfig {
            job: JobKey::new("www-data", "hello"),
            shard_id: 0,
            resources: ResourceBag::new(),
            priority: 0,
            tier: TierName("preferred".into()),
            command: None,
        };
        let mut task = ScheduledTask::new("t1".into(), config);
        task.push_event(ScheduleStatus::Init, 1, None);
        task.push_event(ScheduleStatus::Pending, 2, Some("queued".into()));
        assert_eq!(task.events().len(), 2);
        assert_eq!(task.last_event_timestamp_ms(), Some(2));
    }
}
