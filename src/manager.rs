//! The state manager: orchestrates task creation, assignment, rolling
//! updates, timeout scanning, and abandonment. Owns the only authority for
//! task-record mutation and composes the per-task state machine with the
//! transactional envelope.

use crate::config::SchedulerConfig;
use crate::envelope::{Envelope, SideEffect, TransactionScope};
use crate::error::{Result, StateManagerError};
use crate::id;
use crate::state_machine::{apply_trigger, Trigger, WorkCommand, WorkSink};
use crate::store::{
    Query, SchedulerStore, ShardUpdateConfiguration, StoreProvider, StoreTransaction, TaskStore,
    UpdateStore,
};
use crate::task::{JobKey, ScheduleStatus, ScheduledTask, TaskConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The manager's own lifecycle. Linear and non-repeating; every public
/// operation asserts the subset of states it is valid in. Violations are
/// programmer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initialized,
    Started,
    Stopped,
}

/// The outcome an applied update finished with, driving `finishUpdate`'s
/// shard-killing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Success,
    Failed,
}

/// Process-wide state mutated only by applying [`SideEffect`]s at commit
/// time: per-job-per-status population counters and the task id to host
/// map.
#[derive(Debug, Default, Clone)]
pub struct ProcessState {
    counters: BTreeMap<(JobKey, ScheduleStatus), usize>,
    task_hosts: BTreeMap<String, String>,
}

impl ProcessState {
    fn apply(&mut self, effects: &[SideEffect]) {
        for effect in effects {
            match effect {
                SideEffect::AdjustCount { job, from, to } => {
                    if let Some(from) = from {
                        if let Some(count) = self.counters.get_mut(&(job.clone(), *from)) {
                            *count = count.saturating_sub(1);
                        }
                    }
                    if let Some(to) = to {
                        *self.counters.entry((job.clone(), *to)).or_insert(0) += 1;
                    }
                }
                SideEffect::AddHost { task_id, host } => {
                    self.task_hosts.insert(task_id.clone(), host.clone());
                }
                SideEffect::RemoveHost { task_id } => {
                    self.task_hosts.remove(task_id);
                }
            }
        }
    }

    pub fn count(&self, job: &JobKey, status: ScheduleStatus) -> usize {
        self.counters.get(&(job.clone(), status)).copied().unwrap_or(0)
    }

    /// The inverse view of the task-to-host map: hostname to the set of
    /// task ids currently assigned there.
    pub fn host_assigned_tasks(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut result: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (task_id, host) in &self.task_hosts {
            result.entry(host.clone()).or_default().insert(task_id.clone());
        }
        result
    }
}

/// Single authority for task-record mutation. `P` is the pluggable backing
/// store; a reference in-memory implementation lives in [`crate::testing`].
pub struct StateManager<P: StoreProvider> {
    lifecycle: Lifecycle,
    envelope: Envelope<P>,
    config: SchedulerConfig,
    process_state: ProcessState,
    kill_task: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    clock: Box<dyn Fn() -> i64 + Send>,
}

/// Adapts a single task's slot in a [`TransactionScope`]'s work queue to
/// the [`WorkSink`] contract the state machine expects.
struct ScopedWork<'a> {
    commands: &'a mut Vec<WorkCommand>,
}

impl<'a> WorkSink for ScopedWork<'a> {
    fn push(&mut self, command: WorkCommand) {
        self.commands.push(command);
    }
}

fn drive(task_id: &str, status: ScheduleStatus, failure_count: u32, max_task_failures: u32, trigger: Trigger) -> (ScheduleStatus, Vec<WorkCommand>) {
    let mut commands = Vec::new();
    let mut sink = ScopedWork { commands: &mut commands };
    let new_status = apply_trigger(task_id, status, failure_count, max_task_failures, trigger, &mut sink);
    (new_status, commands)
}

impl<P: StoreProvider> StateManager<P> {
    pub fn new(provider: P, config: SchedulerConfig, clock: impl Fn() -> i64 + Send + 'static) -> Self {
        Self {
            lifecycle: Lifecycle::Created,
            envelope: Envelope::new(provider),
            config,
            process_state: ProcessState::default(),
            kill_task: None,
            clock: Box::new(clock),
        }
    }

    pub fn process_state(&self) -> &ProcessState {
        &self.process_state
    }

    fn assert_lifecycle(&self, allowed: &[Lifecycle]) {
        assert!(
            allowed.contains(&self.lifecycle),
            "illegal state manager call: lifecycle is {:?}, expected one of {:?}",
            self.lifecycle,
            allowed
        );
    }

    /// Idempotent; boots the backing store.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        self.envelope.provider_mut().prepare()
    }

    /// Loads persisted tasks, rebuilds process state from their statuses,
    /// and returns the persisted framework id, if any.
    #[tracing::instrument(skip(self))]
    pub fn initialize(&mut self) -> anyhow::Result<Option<String>> {
        self.assert_lifecycle(&[Lifecycle::Created]);
        let Self { envelope, process_state, .. } = self;

        let framework_id = envelope.run_in_transaction(
            |_scope, _task_id, _command| Ok(()),
            |_effects| {},
            |scope| {
                let tasks = scope.store.fetch_tasks(&Query::default())?;
                for task in &tasks {
                    *process_state.counters.entry((task.job().clone(), task.status)).or_insert(0) += 1;
                    if task.status.is_assigned_live() {
                        if let Some(assignment) = &task.assignment {
                            process_state
                                .task_hosts
                                .insert(task.task_id.clone(), assignment.slave_host.clone());
                        }
                    }
                }
                scope.store.fetch_framework_id()
            },
        )?;

        self.lifecycle = Lifecycle::Initialized;
        Ok(framework_id)
    }

    /// Registers the external kill callback and enables runtime operations.
    pub fn start(&mut self, kill_task: impl Fn(&str) + Send + Sync + 'static) {
        self.assert_lifecycle(&[Lifecycle::Initialized]);
        self.kill_task = Some(Arc::new(kill_task));
        self.lifecycle = Lifecycle::Started;
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        self.envelope.provider_mut().stop()?;
        self.lifecycle = Lifecycle::Stopped;
        Ok(())
    }

    /// Creates records in INIT, persists them, and drives each to PENDING.
    #[tracing::instrument(skip(self, configs))]
    pub fn insert_tasks(&mut self, configs: Vec<TaskConfig>) -> Result<Vec<String>> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let Self { envelope, process_state, .. } = self;

        let ids = envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, None),
            |effects| process_state.apply(effects),
            |scope| {
                let mut ids = Vec::with_capacity(configs.len());
                for config in configs {
                    let task_id = id::new_task_id(now_ms, &config.job, config.shard_id, uuid::Uuid::new_v4());
                    let task = ScheduledTask::new(task_id.clone(), config);
                    scope.store.save_tasks(vec![task])?;

                    let (_status, commands) = drive(&task_id, ScheduleStatus::Init, 0, max_task_failures, Trigger::Insert);
                    for command in commands {
                        scope.enqueue_work(task_id.clone(), command);
                    }
                    ids.push(task_id);
                }
                Ok(ids)
            },
        )?;

        Ok(ids)
    }

    /// Advances a PENDING task to ASSIGNED, stamping its host/id/ports.
    /// Returns the updated record, or `None` if the task does not exist or
    /// is not currently PENDING.
    #[tracing::instrument(skip(self, assigned_ports))]
    pub fn assign_task(
        &mut self,
        task_id: &str,
        slave_id: &str,
        slave_host: &str,
        assigned_ports: BTreeMap<String, i32>,
    ) -> Result<Option<ScheduledTask>> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let Self { envelope, process_state, .. } = self;
        let task_id = task_id.to_string();
        let slave_id = slave_id.to_string();
        let slave_host = slave_host.to_string();

        let result = envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, None),
            |effects| process_state.apply(effects),
            |scope| {
                let tasks = scope.store.fetch_tasks(&Query::by_id(task_id.clone()))?;
                let Some(task) = tasks.into_iter().next() else {
                    return Ok(None);
                };

                let (new_status, commands) = drive(
                    &task_id,
                    task.status,
                    task.failure_count,
                    max_task_failures,
                    Trigger::AssignTask {
                        slave_id: slave_id.clone(),
                        slave_host: slave_host.clone(),
                        assigned_ports: assigned_ports.clone(),
                    },
                );
                if new_status != ScheduleStatus::Assigned {
                    return Ok(None);
                }
                for command in commands {
                    scope.enqueue_work(task_id.clone(), command);
                }
                scope.enqueue_side_effect(SideEffect::AddHost {
                    task_id: task_id.clone(),
                    host: slave_host.clone(),
                });

                let tasks = scope.store.fetch_tasks(&Query::by_id(task_id))?;
                Ok(tasks.into_iter().next())
            },
        )?;

        Ok(result)
    }

    /// Transitions all tasks matching `query` to `new_status`, returning the
    /// count mutated. `KILLING` and `PREEMPTING` are driven through their
    /// dedicated triggers rather than a status callback, since both carry
    /// precondition checks (`KILLING` only from a live status, `PREEMPTING`
    /// only from `RUNNING`) that a bare callback doesn't encode; every other
    /// target goes through `Trigger::StatusCallback`.
    #[tracing::instrument(skip(self, query))]
    pub fn change_state(&mut self, query: &Query, new_status: ScheduleStatus, audit: Option<String>) -> Result<usize> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let Self { envelope, process_state, kill_task, .. } = self;
        let kill_task = kill_task.clone();
        let query = query.clone();
        let trigger_for = |new_status: ScheduleStatus| match new_status {
            ScheduleStatus::Killing => Trigger::Kill,
            ScheduleStatus::Preempting => Trigger::Preempt,
            other => Trigger::StatusCallback(other),
        };

        let count = envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, kill_task.as_ref()),
            |effects| process_state.apply(effects),
            |scope| {
                let ids = scope.store.fetch_task_ids(&query)?;
                let mut count = 0;
                for task_id in ids {
                    let tasks = scope.store.fetch_tasks(&Query::by_id(task_id.clone()))?;
                    let Some(task) = tasks.into_iter().next() else { continue };
                    if task.status == new_status {
                        continue;
                    }
                    let (_status, mut commands) = drive(
                        &task_id,
                        task.status,
                        task.failure_count,
                        max_task_failures,
                        trigger_for(new_status),
                    );
                    if commands.is_empty() {
                        continue;
                    }
                    if let Some(audit) = &audit {
                        if let Some(WorkCommand::UpdateState { audit_message, .. }) =
                            commands.iter_mut().find(|c| matches!(c, WorkCommand::UpdateState { .. }))
                        {
                            *audit_message = Some(audit.clone());
                        }
                    }
                    for command in commands {
                        scope.enqueue_work(task_id.clone(), command);
                    }
                    count += 1;
                }
                Ok(count)
            },
        )?;

        Ok(count)
    }

    /// Registers a rolling update for `job`'s shards. Fails if there are no
    /// active tasks for the job, or if an update is already registered.
    #[tracing::instrument(skip(self, new_configs))]
    pub fn register_update(&mut self, job: JobKey, new_configs: Vec<TaskConfig>) -> Result<String> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let Self { envelope, .. } = self;
        let job_for_err = job.clone();

        envelope
            .run_in_transaction(
                |_scope, _task_id, _command| Ok(()),
                |_effects| {},
                move |scope| {
                    let active = scope.store.fetch_task_ids(&Query::active(job.clone()))?;
                    if active.is_empty() {
                        return Ok(Err(StateManagerError::NoActiveTasks {
                            role: job.role.clone(),
                            job: job.name.clone(),
                        }));
                    }
                    if scope.store.fetch_update_token(&job)?.is_some() {
                        return Ok(Err(StateManagerError::UpdateAlreadyInProgress {
                            role: job.role.clone(),
                            job: job.name.clone(),
                        }));
                    }

                    let current = scope.store.fetch_tasks(&Query::active(job.clone()))?;
                    let mut shards: BTreeMap<i32, (Option<TaskConfig>, Option<TaskConfig>)> = BTreeMap::new();
                    for task in current {
                        let shard_id = task.config.shard_id;
                        shards.entry(shard_id).or_default().0 = Some(task.config);
                    }
                    for config in new_configs {
                        let shard_id = config.shard_id;
                        shards.entry(shard_id).or_default().1 = Some(config);
                    }

                    let token = uuid::Uuid::new_v4().to_string();
                    let configs = shards
                        .into_iter()
                        .map(|(shard_id, (old_config, new_config))| ShardUpdateConfiguration {
                            shard_id,
                            old_config,
                            new_config,
                        })
                        .collect();
                    scope.store.save_shard_update_configs(&job, &token, configs)?;
                    Ok(Ok(token))
                },
            )?
            .map_err(|err| {
                tracing::warn!(%job_for_err, "rejected registerUpdate");
                err
            })
    }

    /// Finishes the update registered for `job`, optionally checked against
    /// `token`. On success, kills shards whose new config is absent. Always
    /// clears the update rows.
    #[tracing::instrument(skip(self))]
    pub fn finish_update(&mut self, job: JobKey, token: Option<String>, result: UpdateResult) -> Result<()> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let Self { envelope, process_state, kill_task, .. } = self;
        let kill_task_for_drain = kill_task.clone();

        envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, kill_task_for_drain.as_ref()),
            |effects| process_state.apply(effects),
            move |scope| {
                let Some(current_token) = scope.store.fetch_update_token(&job)? else {
                    return Ok(Err(StateManagerError::UpdateNotFound {
                        role: job.role.clone(),
                        job: job.name.clone(),
                    }));
                };
                if let Some(token) = &token {
                    if *token != current_token {
                        return Ok(Err(StateManagerError::UpdateTokenMismatch {
                            role: job.role.clone(),
                            job: job.name.clone(),
                        }));
                    }
                }

                if result == UpdateResult::Success {
                    let configs = scope.store.fetch_shard_update_configs(&job, None)?;
                    for shard in configs.into_iter().filter(|s| s.new_config.is_none()) {
                        let tasks = scope
                            .store
                            .fetch_tasks(&Query::by_job_shard(job.clone(), shard.shard_id))?;
                        for task in tasks.into_iter().filter(|t| t.status.is_assigned_live()) {
                            let (_status, commands) = drive(
                                &task.task_id,
                                task.status,
                                task.failure_count,
                                max_task_failures,
                                Trigger::Kill,
                            );
                            for command in commands {
                                scope.enqueue_work(task.task_id.clone(), command);
                            }
                        }
                    }
                }

                scope.store.remove_shard_update_configs(&job)?;
                Ok(Ok(()))
            },
        )?
    }

    /// Returns the `newConfig` for the requested shards of `job`'s
    /// currently registered update, if any.
    pub fn fetch_updated_task_configs(&mut self, job: &JobKey, shards: Option<&[i32]>) -> anyhow::Result<Vec<TaskConfig>> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let job = job.clone();
        let shards = shards.map(|s| s.to_vec());
        self.envelope.run_in_transaction(
            |_scope, _task_id, _command| Ok(()),
            |_effects| {},
            move |scope| {
                let configs = scope.store.fetch_shard_update_configs(&job, shards.as_deref())?;
                Ok(configs.into_iter().filter_map(|c| c.new_config).collect())
            },
        )
    }

    /// Transitions each id to UNKNOWN, drains the resulting DELETE work,
    /// then the rows are gone. Deletion happens as part of the same
    /// transaction as the status transition, so the DELETE work commands
    /// always observe the row before it disappears.
    #[tracing::instrument(skip(self, ids))]
    pub fn abandon_tasks(&mut self, ids: &[String]) -> anyhow::Result<()> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let Self { envelope, process_state, .. } = self;
        let ids = ids.to_vec();

        envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, None),
            |effects| process_state.apply(effects),
            move |scope| {
                for task_id in ids {
                    let tasks = scope.store.fetch_tasks(&Query::by_id(task_id.clone()))?;
                    let Some(task) = tasks.into_iter().next() else { continue };
                    let (_status, commands) =
                        drive(&task_id, task.status, task.failure_count, max_task_failures, Trigger::Abandon);
                    for command in commands {
                        scope.enqueue_work(task_id.clone(), command);
                    }
                }
                Ok(())
            },
        )
    }

    /// Drives each of `victims` (as selected by the preemption engine) from
    /// RUNNING into PREEMPTING, recording `audit` against each row. Victims
    /// not currently RUNNING are left untouched; the count reflects only
    /// the rows actually transitioned.
    #[tracing::instrument(skip(self, victims))]
    pub fn preempt_tasks(&mut self, victims: &[crate::task::PreemptionVictim], audit: Option<String>) -> Result<usize> {
        let ids: BTreeSet<String> = victims.iter().map(|v| v.task_id.clone()).collect();
        self.change_state(&Query::by_ids(ids), ScheduleStatus::Preempting, audit)
    }

    /// Applies the missing-task timeout rule, invoking the kill callback
    /// for each offending task.
    #[tracing::instrument(skip(self))]
    pub fn scan_outstanding_tasks(&mut self) -> anyhow::Result<()> {
        self.assert_lifecycle(&[Lifecycle::Started]);
        let now_ms = (self.clock)();
        let max_task_failures = self.config.max_task_failures;
        let grace_period_ms = self.config.missing_task_grace_period.as_millis() as i64;
        let Self { envelope, process_state, kill_task, .. } = self;
        let kill_task_for_drain = kill_task.clone();

        envelope.run_in_transaction(
            move |scope, task_id, command| apply_work_command(scope, task_id, command, now_ms, kill_task_for_drain.as_ref()),
            |effects| process_state.apply(effects),
            move |scope| {
                let tasks = scope.store.fetch_tasks(&Query::default())?;
                for task in tasks {
                    if !task.status.is_timeout_eligible() {
                        continue;
                    }
                    let Some(last_event) = task.last_event_timestamp_ms() else { continue };
                    if now_ms - last_event < grace_period_ms {
                        continue;
                    }
                    let (_status, commands) =
                        drive(&task.task_id, task.status, task.failure_count, max_task_failures, Trigger::Timeout);
                    for command in commands {
                        scope.enqueue_work(task.task_id.clone(), command);
                    }
                }
                Ok(())
            },
        )
    }

    /// The inverse view of `taskHosts`: hostname to the set of task ids
    /// currently assigned there.
    pub fn get_host_assigned_tasks(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.process_state.host_assigned_tasks()
    }
}

/// Interprets a single drained work command against the transaction's
/// store, enqueueing whatever side effects it implies.
fn apply_work_command<T: StoreTransaction>(
    scope: &mut TransactionScope<T>,
    task_id: &str,
    command: WorkCommand,
    now_ms: i64,
    kill_task: Option<&Arc<dyn Fn(&str) + Send + Sync>>,
) -> anyhow::Result<()> {
    match command {
        WorkCommand::UpdateState { new_status, audit_message, mutator } => {
            let tasks = scope.store.fetch_tasks(&Query::by_id(task_id))?;
            let Some(mut task) = tasks.into_iter().next() else {
                return Ok(());
            };
            let from = task.status;
            let job = task.job().clone();
            task.status = new_status;
            task.push_event(new_status, now_ms, audit_message);
            if let Some(mutator) = mutator {
                mutator(&mut task);
            }
            scope.store.save_tasks(vec![task])?;
            scope.enqueue_side_effect(SideEffect::AdjustCount {
                job,
                from: Some(from),
                to: Some(new_status),
            });
            if from.is_assigned_live() && !new_status.is_assigned_live() {
                scope.enqueue_side_effect(SideEffect::RemoveHost { task_id: task_id.to_string() });
            }
            Ok(())
        }
        WorkCommand::Reschedule => {
            let tasks = scope.store.fetch_tasks(&Query::by_id(task_id))?;
            let Some(task) = tasks.into_iter().next() else {
                return Ok(());
            };
            reschedule(scope, &task, task.config.clone(), now_ms)
        }
        WorkCommand::Update => {
            let tasks = scope.store.fetch_tasks(&Query::by_id(task_id))?;
            let Some(task) = tasks.into_iter().next() else {
                return Ok(());
            };
            let shard = scope.store.fetch_shard_update_config(task.job(), task.config.shard_id)?;
            match shard.and_then(|s| s.new_config) {
                Some(new_config) => reschedule(scope, &task, new_config, now_ms),
                None => Ok(()),
            }
        }
        WorkCommand::Rollback => {
            let tasks = scope.store.fetch_tasks(&Query::by_id(task_id))?;
            let Some(task) = tasks.into_iter().next() else {
                return Ok(());
            };
            let shard = scope.store.fetch_shard_update_config(task.job(), task.config.shard_id)?;
            match shard.and_then(|s| s.old_config) {
                Some(old_config) => reschedule(scope, &task, old_config, now_ms),
                None => Ok(()),
            }
        }
        WorkCommand::Kill => {
            if let Some(kill_task) = kill_task {
                kill_task(task_id);
            }
            Ok(())
        }
        WorkCommand::Delete => {
            let ids: BTreeSet<String> = std::iter::once(task_id.to_string()).collect();
            scope.store.remove_tasks(&ids)?;
            scope.enqueue_side_effect(SideEffect::RemoveHost { task_id: task_id.to_string() });
            Ok(())
        }
        WorkCommand::IncrementFailures => {
            scope.store.mutate_tasks(&Query::by_id(task_id), &mut |task| task.failure_count += 1)?;
            Ok(())
        }
    }
}

fn reschedule<T: StoreTransaction>(
    scope: &mut TransactionScope<T>,
    ancestor: &ScheduledTask,
    config: TaskConfig,
    now_ms: i64,
) -> anyhow::Result<()> {
    let new_id = id::new_task_id(now_ms, &config.job, config.shard_id, uuid::Uuid::new_v4());
    let job = config.job.clone();
    let mut rescheduled = ScheduledTask::new(new_id, config);
    rescheduled.status = ScheduleStatus::Pending;
    rescheduled.push_event(ScheduleStatus::Init, now_ms, None);
    rescheduled.push_event(ScheduleStatus::Pending, now_ms, Some("rescheduled".to_string()));
    rescheduled.ancestor_id = Some(ancestor.task_id.clone());
    scope.store.save_tasks(vec![rescheduled])?;
    scope.enqueue_side_effect(SideEffect::AdjustCount {
        job,
        from: None,
        to: Some(ScheduleStatus::Pending),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceBag;
    use crate::task::TierName;
    use crate::testing::InMemoryStore;

    fn config(job: &JobKey, shard_id: i32) -> TaskConfig {
        TaskConfig {
            job: job.clone(),
            shard_id,
            resources: ResourceBag::new(),
            priority: 0,
            tier: TierName("preferred".into()),
            command: None,
        }
    }

    fn started_manager() -> StateManager<InMemoryStore> {
        let mut manager = StateManager::new(InMemoryStore::new(), SchedulerConfig::default(), || 1_000);
        manager.prepare().unwrap();
        manager.initialize().unwrap();
        manager.start(|_task_id| {});
        manager
    }

    #[test]
    fn insert_tasks_creates_pending_rows() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let ids = manager.insert_tasks(vec![config(&job, 0)]).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.process_state().count(&job, ScheduleStatus::Pending), 1);
    }

    #[test]
    fn assign_task_moves_to_assigned_and_updates_host_map() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let ids = manager.insert_tasks(vec![config(&job, 0)]).unwrap();
        let task_id = ids[0].clone();

        let assigned = manager
            .assign_task(&task_id, "slave-1", "host-1", BTreeMap::new())
            .unwrap()
            .expect("task should be assigned");
        assert_eq!(assigned.status, ScheduleStatus::Assigned);

        let hosts = manager.get_host_assigned_tasks();
        assert!(hosts.get("host-1").unwrap().contains(&task_id));
    }

    #[test]
    fn assign_task_on_unknown_id_returns_none() {
        let mut manager = started_manager();
        let result = manager.assign_task("missing", "s", "h", BTreeMap::new()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn register_update_fails_without_active_tasks() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let err = manager.register_update(job.clone(), vec![config(&job, 0)]).unwrap_err();
        assert!(matches!(err, StateManagerError::NoActiveTasks { .. }));
    }

    #[test]
    fn register_update_twice_fails_with_already_in_progress() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        manager.insert_tasks(vec![config(&job, 0)]).unwrap();

        manager.register_update(job.clone(), vec![config(&job, 0)]).unwrap();
        let err = manager.register_update(job.clone(), vec![config(&job, 0)]).unwrap_err();
        assert!(matches!(err, StateManagerError::UpdateAlreadyInProgress { .. }));
    }

    #[test]
    fn finish_update_without_registration_fails() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let err = manager.finish_update(job, None, UpdateResult::Success).unwrap_err();
        assert!(matches!(err, StateManagerError::UpdateNotFound { .. }));
    }

    #[test]
    fn abandon_tasks_removes_rows_and_decrements_counters() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let ids = manager.insert_tasks(vec![config(&job, 0)]).unwrap();

        manager.abandon_tasks(&ids).unwrap();
        assert_eq!(manager.process_state().count(&job, ScheduleStatus::Pending), 0);
    }

    #[test]
    fn change_state_is_idempotent_for_current_status() {
        let mut manager = started_manager();
        let job = JobKey::new("www-data", "hello");
        let ids = manager.insert_tasks(vec![config(&job, 0)]).unwrap();
        let count = manager
            .change_state(&Query::by_id(ids[0].clone()), ScheduleStatus::Pending, None)
            .unwrap();
        assert_eq!(count, 0);
    }
}
