//! Per-task finite state machine: the set of legal schedule-status
//! transitions and the work commands each one emits as a side effect.
//!
//! The machine itself performs no I/O and holds no reference to a store; it
//! is driven by [`crate::manager::StateManager`], which owns the task row,
//! interprets emitted [`WorkCommand`]s against the backing store, and feeds
//! the resulting status back in on the next trigger.

use crate::task::{expand_command_template, Assignment, ScheduleStatus};
use std::collections::BTreeMap;

/// A mutation applied to the task row as part of persisting an
/// `UPDATE_STATE` work command (e.g. stamping an assignment). Represented
/// as a boxed closure rather than a trait-object hierarchy, per the design
/// note on closures-as-values.
pub type Mutator = Box<dyn FnOnce(&mut crate::task::ScheduledTask) + Send>;

/// A deferred action emitted by a state transition. The state machine never
/// executes these itself; it only enqueues them onto a [`WorkSink`].
pub enum WorkCommand {
    /// Persist `new_status` (and run `mutator` against the row, if any).
    UpdateState {
        new_status: ScheduleStatus,
        audit_message: Option<String>,
        mutator: Option<Mutator>,
    },
    /// Clone the task under a fresh id, strip its assignment, link it to
    /// its ancestor, and enter it at PENDING.
    Reschedule,
    /// Invoke the externally supplied kill callback for this task.
    Kill,
    /// Reschedule this task under the shard's new update config.
    Update,
    /// Reschedule this task under the shard's old (pre-update) config.
    Rollback,
    /// Remove the row and clear its `taskHosts` entry.
    Delete,
    /// Bump the task's failure counter.
    IncrementFailures,
}

impl std::fmt::Debug for WorkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkCommand::UpdateState { new_status, audit_message, .. } => f
                .debug_struct("UpdateState")
                .field("new_status", new_status)
                .field("audit_message", audit_message)
                .finish_non_exhaustive(),
            WorkCommand::Reschedule => write!(f, "Reschedule"),
            WorkCommand::Kill => write!(f, "Kill"),
            WorkCommand::Update => write!(f, "Update"),
            WorkCommand::Rollback => write!(f, "Rollback"),
            WorkCommand::Delete => write!(f, "Delete"),
            WorkCommand::IncrementFailures => write!(f, "IncrementFailures"),
        }
    }
}

impl WorkCommand {
    fn plain(new_status: ScheduleStatus) -> Self {
        WorkCommand::UpdateState {
            new_status,
            audit_message: None,
            mutator: None,
        }
    }
}

/// Destination for work commands emitted by a transition. Implemented for
/// `Vec<WorkCommand>` so callers can collect a transaction's worth of
/// commands without a trait object.
pub trait WorkSink {
    fn push(&mut self, command: WorkCommand);
}

impl WorkSink for Vec<WorkCommand> {
    fn push(&mut self, command: WorkCommand) {
        Vec::push(self, command);
    }
}

/// The event driving a transition attempt.
#[derive(Debug)]
pub enum Trigger {
    /// A freshly created row enters PENDING.
    Insert,
    /// The scheduler has placed the task on a host.
    AssignTask {
        slave_id: String,
        slave_host: String,
        assigned_ports: BTreeMap<String, i32>,
    },
    /// An executor or observer reported a new status.
    StatusCallback(ScheduleStatus),
    /// The preemption engine selected this task as a victim.
    Preempt,
    /// A rolling update or rollback is being applied to this task's shard.
    UpdateTick { rollback: bool },
    /// A user or an update requested this task be killed.
    Kill,
    /// The missing-task grace period elapsed with no status callback.
    Timeout,
    /// The task is being abandoned outright.
    Abandon,
}

/// Whether `status` absorbs further status callbacks without effect: the
/// status-only terminal set, plus FAILED once `failure_count` has exhausted
/// the configured retry budget.
pub fn is_effectively_terminal(status: ScheduleStatus, failure_count: u32, max_task_failures: u32) -> bool {
    status.is_terminal() || (status == ScheduleStatus::Failed && failure_count > max_task_failures)
}

/// Apply `trigger` to a task currently at `current_status`, pushing any
/// emitted work commands onto `work` and returning the resulting status.
/// Illegal transitions are logged and leave `current_status` unchanged; an
/// effectively-terminal task absorbs any further status callback as a
/// no-op.
#[tracing::instrument(skip(work), fields(%task_id))]
#[allow(clippy::too_many_arguments)]
pub fn apply_trigger(
    task_id: &str,
    current_status: ScheduleStatus,
    failure_count: u32,
    max_task_failures: u32,
    trigger: Trigger,
    work: &mut dyn WorkSink,
) -> ScheduleStatus {
    use ScheduleStatus::*;

    let illegal = |to: ScheduleStatus| -> ScheduleStatus {
        tracing::warn!(?current_status, ?to, "illegal schedule status transition");
        current_status
    };

    match trigger {
        Trigger::Insert => {
            if current_status != Init {
                return illegal(Pending);
            }
            work.push(WorkCommand::plain(Pending));
            Pending
        }

        Trigger::AssignTask {
            slave_id,
            slave_host,
            assigned_ports,
        } => {
            if current_status != Pending {
                return illegal(Assigned);
            }
            work.push(WorkCommand::UpdateState {
                new_status: Assigned,
                audit_message: None,
                mutator: Some(Box::new(move |task| {
                    if let Some(template) = task.config.command.clone() {
                        task.config.command = Some(expand_command_template(&template, &task.task_id, &slave_host, &assigned_ports));
                    }
                    task.assignment = Some(Assignment {
                        slave_id,
                        slave_host,
                        assigned_ports,
                    });
                })),
            });
            Assigned
        }

        Trigger::StatusCallback(new_status) => {
            if is_effectively_terminal(current_status, failure_count, max_task_failures) {
                return current_status;
            }
            match (current_status, new_status) {
                (Assigned, Starting) | (Starting, Running) | (Killing, Killed) => {
                    work.push(WorkCommand::plain(new_status));
                    new_status
                }
                (Running, Failed) => {
                    work.push(WorkCommand::IncrementFailures);
                    if failure_count + 1 <= max_task_failures {
                        work.push(WorkCommand::Reschedule);
                    }
                    work.push(WorkCommand::plain(Failed));
                    Failed
                }
                (Running, Finished) => {
                    work.push(WorkCommand::plain(Finished));
                    Finished
                }
                (Running, Lost) | (Assigned, Lost) => {
                    work.push(WorkCommand::Reschedule);
                    work.push(WorkCommand::plain(Lost));
                    Lost
                }
                _ => illegal(new_status),
            }
        }

        Trigger::Preempt => {
            if current_status != Running {
                return illegal(Preempting);
            }
            work.push(WorkCommand::plain(Preempting));
            Preempting
        }

        Trigger::UpdateTick { rollback } => {
            if current_status != Running {
                return illegal(Restarting);
            }
            work.push(if rollback { WorkCommand::Rollback } else { WorkCommand::Update });
            work.push(WorkCommand::plain(Restarting));
            Restarting
        }

        Trigger::Kill => {
            if current_status == Killing {
                return Killing;
            }
            if !current_status.is_assigned_live() {
                return illegal(Killing);
            }
            work.push(WorkCommand::Kill);
            work.push(WorkCommand::plain(Killing));
            Killing
        }

        Trigger::Timeout => {
            if !current_status.is_timeout_eligible() {
                return illegal(Lost);
            }
            work.push(WorkCommand::Reschedule);
            work.push(WorkCommand::plain(Lost));
            Lost
        }

        Trigger::Abandon => {
            work.push(WorkCommand::Delete);
            Unknown
        }
    }
}
