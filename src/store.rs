//! Store contracts consumed by the state manager.
//!
//! The concrete storage backend (log-based, in-memory, or otherwise) is
//! explicitly out of scope and is modelled here only as the traits the
//! core consumes. A reference in-memory implementation lives in
//! [`crate::testing`].

use crate::resources::ResourceBag;
use crate::task::{JobKey, ScheduleStatus, ScheduledTask, TaskConfig, Tier};
use std::collections::{BTreeMap, BTreeSet};

/// An immutable filter over tasks.
#[derive(Debug, Clone, Default)]
pub struct Query {
    task_ids: Option<BTreeSet<String>>,
    statuses: Option<BTreeSet<ScheduleStatus>>,
    job: Option<JobKey>,
    shard_id: Option<i32>,
    active_only: bool,
}

impl Query {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::by_ids([id.into()])
    }

    pub fn by_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            task_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_status(status: ScheduleStatus) -> Self {
        Self::by_statuses([status])
    }

    pub fn by_statuses(statuses: impl IntoIterator<Item = ScheduleStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_job_shard(job: JobKey, shard_id: i32) -> Self {
        Self {
            job: Some(job),
            shard_id: Some(shard_id),
            ..Self::default()
        }
    }

    pub fn by_job(job: JobKey) -> Self {
        Self {
            job: Some(job),
            ..Self::default()
        }
    }

    /// Rows in non-terminal statuses for `job`.
    pub fn active(job: JobKey) -> Self {
        Self {
            job: Some(job),
            active_only: true,
            ..Self::default()
        }
    }

    pub fn and_status(mut self, status: ScheduleStatus) -> Self {
        self.statuses.get_or_insert_with(BTreeSet::new).insert(status);
        self
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        if let Some(ids) = &self.task_ids {
            if !ids.contains(&task.task_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(job) = &self.job {
            if task.job() != job {
                return false;
            }
        }
        if let Some(shard_id) = self.shard_id {
            if task.config.shard_id != shard_id {
                return false;
            }
        }
        if self.active_only && !task.status.is_active() {
            return false;
        }
        true
    }
}

/// Sub-store for task records.
pub trait TaskStore {
    fn fetch_tasks(&self, query: &Query) -> anyhow::Result<Vec<ScheduledTask>>;
    fn fetch_task_ids(&self, query: &Query) -> anyhow::Result<BTreeSet<String>>;
    fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) -> anyhow::Result<()>;

    /// Apply `mutator` to every task matching `query`, returning the count
    /// mutated.
    fn mutate_tasks(
        &mut self,
        query: &Query,
        mutator: &mut dyn FnMut(&mut ScheduledTask),
    ) -> anyhow::Result<usize>;

    fn remove_tasks(&mut self, ids: &BTreeSet<String>) -> anyhow::Result<()>;
}

/// Sub-store for the single persisted framework id.
pub trait SchedulerStore {
    fn fetch_framework_id(&self) -> anyhow::Result<Option<String>>;
    fn save_framework_id(&mut self, id: &str) -> anyhow::Result<()>;
}

/// One shard's (old, new) configuration pair under an in-progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardUpdateConfiguration {
    pub shard_id: i32,
    pub old_config: Option<TaskConfig>,
    pub new_config: Option<TaskConfig>,
}

/// Sub-store for in-progress rolling updates.
pub trait UpdateStore {
    fn fetch_shard_update_config(
        &self,
        job: &JobKey,
        shard_id: i32,
    ) -> anyhow::Result<Option<ShardUpdateConfiguration>>;

    fn fetch_shard_update_configs(
        &self,
        job: &JobKey,
        shards: Option<&[i32]>,
    ) -> anyhow::Result<Vec<ShardUpdateConfiguration>>;

    fn save_shard_update_configs(
        &mut self,
        job: &JobKey,
        token: &str,
        configs: Vec<ShardUpdateConfiguration>,
    ) -> anyhow::Result<()>;

    fn remove_shard_update_configs(&mut self, job: &JobKey) -> anyhow::Result<()>;

    /// The token currently guarding `job`'s update, if any.
    fn fetch_update_token(&self, job: &JobKey) -> anyhow::Result<Option<String>>;
}

/// Attribute tags on a host (e.g. rack, zone), keyed by attribute name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostAttributes {
    pub host: String,
    pub values: BTreeMap<String, BTreeSet<String>>,
}

/// Sub-store for host attributes.
pub trait AttributeStore {
    fn get_host_attributes(&self, host: &str) -> anyhow::Result<Option<HostAttributes>>;
}

/// A combined transactional handle exposing all four sub-stores. Blanket
/// implemented for anything that implements all four traits, since
/// `StoreProvider` hands these sub-stores to callers together within
/// `do_in_transaction`.
pub trait StoreTransaction: TaskStore + SchedulerStore + UpdateStore + AttributeStore {}

impl<T> StoreTransaction for T where T: TaskStore + SchedulerStore + UpdateStore + AttributeStore {}

/// The pluggable backing store. Implementations own whatever I/O
/// is necessary; the core never performs I/O beyond these calls.
pub trait StoreProvider {
    type Transaction: StoreTransaction;

    /// Idempotent. Boots the backing store.
    fn prepare(&mut self) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;

    /// Run `work` against a transactional handle. Re-entrant calls made
    /// from within `work` must be collapsed into the same transaction;
    /// this provider-level method is only ever invoked by the envelope's
    /// outermost call.
    fn do_in_transaction<R>(
        &mut self,
        work: impl FnOnce(&mut Self::Transaction) -> anyhow::Result<R>,
    ) -> anyhow::Result<R>;
}

/// The pending job's placement state, passed to the scheduling filter
/// alongside a resource request. The tier catalogue and constraint
/// engine that would populate a richer aggregate are plug-in contracts;
/// this carries only what the preemption engine itself threads through.
#[derive(Debug, Clone, Default)]
pub struct AttributeAggregate {
    pub job: Option<JobKey>,
    pub active_hosts: BTreeSet<String>,
}

/// A resource envelope that is not in use: what a host offers, or what
/// preemption has freed so far, alongside that host's attributes.
#[derive(Debug, Clone)]
pub struct UnusedResource {
    pub bag: ResourceBag,
    pub attributes: HostAttributes,
}

/// A pending task's resource demand.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub config: TaskConfig,
    pub required: ResourceBag,
    pub aggregate: AttributeAggregate,
}

/// A reason the scheduling filter considers a placement unplaceable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Veto(pub String);

/// The scheduling feasibility filter contract. An empty veto set means
/// admissible.
pub trait SchedulingFilter {
    fn filter(&self, unused: &UnusedResource, request: &ResourceRequest) -> BTreeSet<Veto>;
}

/// The tier catalogue contract.
pub trait TierManager {
    fn get_tier(&self, config: &TaskConfig) -> Tier;
}
