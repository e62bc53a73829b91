//! In-memory reference implementation of the store contracts, used by this
//! crate's own tests and exported behind `feature = "testing"` so
//! downstream integration tests can exercise the state manager without a
//! real backing store.

use crate::store::{
    AttributeStore, HostAttributes, Query, SchedulerStore, ShardUpdateConfiguration, StoreProvider,
    TaskStore, UpdateStore,
};
use crate::task::{JobKey, ScheduledTask};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, ScheduledTask>,
    framework_id: Option<String>,
    updates: HashMap<JobKey, (String, Vec<ShardUpdateConfiguration>)>,
    host_attributes: HashMap<String, HostAttributes>,
}

/// A `Mutex`-guarded in-memory store. Cloning shares the same underlying
/// state, so a test can keep a handle alongside the [`crate::manager::StateManager`]
/// it is wired into.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a host's attributes ahead of a test run.
    pub fn set_host_attributes(&self, attributes: HostAttributes) {
        self.inner
            .lock()
            .unwrap()
            .host_attributes
            .insert(attributes.host.clone(), attributes);
    }
}

/// The transactional handle this store hands to `do_in_transaction`. Since
/// the backing state is a single `Mutex`-guarded structure rather than a
/// real connection, every "transaction" simply holds a lock for its
/// duration; there is no partial visibility to model.
pub struct InMemoryTransaction {
    inner: Arc<Mutex<Inner>>,
}

impl TaskStore for InMemoryTransaction {
    fn fetch_tasks(&self, query: &Query) -> anyhow::Result<Vec<ScheduledTask>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.values().filter(|task| query.matches(task)).cloned().collect())
    }

    fn fetch_task_ids(&self, query: &Query) -> anyhow::Result<BTreeSet<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .map(|task| task.task_id.clone())
            .collect())
    }

    fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for task in tasks {
            inner.tasks.insert(task.task_id.clone(), task);
        }
        Ok(())
    }

    fn mutate_tasks(
        &mut self,
        query: &Query,
        mutator: &mut dyn FnMut(&mut ScheduledTask),
    ) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for task in inner.tasks.values_mut() {
            if query.matches(task) {
                mutator(task);
                count += 1;
            }
        }
        Ok(count)
    }

    fn remove_tasks(&mut self, ids: &BTreeSet<String>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            inner.tasks.remove(id);
        }
        Ok(())
    }
}

impl SchedulerStore for InMemoryTransaction {
    fn fetch_framework_id(&self) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().unwrap().framework_id.clone())
    }

    fn save_framework_id(&mut self, id: &str) -> anyhow::Result<()> {
        self.inner.lock().unwrap().framework_id = Some(id.to_string());
        Ok(())
    }
}

impl UpdateStore for InMemoryTransaction {
    fn fetch_shard_update_config(
        &self,
        job: &JobKey,
        shard_id: i32,
    ) -> anyhow::Result<Option<ShardUpdateConfiguration>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .updates
            .get(job)
            .and_then(|(_, configs)| configs.iter().find(|c| c.shard_id == shard_id).cloned()))
    }

    fn fetch_shard_update_configs(
        &self,
        job: &JobKey,
        shards: Option<&[i32]>,
    ) -> anyhow::Result<Vec<ShardUpdateConfiguration>> {
        let inner = self.inner.lock().unwrap();
        let Some((_, configs)) = inner.updates.get(job) else {
            return Ok(Vec::new());
        };
        Ok(match shards {
            Some(shards) => configs.iter().filter(|c| shards.contains(&c.shard_id)).cloned().collect(),
            None => configs.clone(),
        })
    }

    fn save_shard_update_configs(
        &mut self,
        job: &JobKey,
        token: &str,
        configs: Vec<ShardUpdateConfiguration>,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .updates
            .insert(job.clone(), (token.to_string(), configs));
        Ok(())
    }

    fn remove_shard_update_configs(&mut self, job: &JobKey) -> anyhow::Result<()> {
        self.inner.lock().unwrap().updates.remove(job);
        Ok(())
    }

    fn fetch_update_token(&self, job: &JobKey) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().unwrap().updates.get(job).map(|(token, _)| token.clone()))
    }
}

impl AttributeStore for InMemoryTransaction {
    fn get_host_attributes(&self, host: &str) -> anyhow::Result<Option<HostAttributes>> {
        Ok(self.inner.lock().unwrap().host_attributes.get(host).cloned())
    }
}

impl StoreProvider for InMemoryStore {
    type Transaction = InMemoryTransaction;

    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn do_in_transaction<R>(
        &mut self,
        work: impl FnOnce(&mut Self::Transaction) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut txn = InMemoryTransaction {
            inner: self.inner.clone(),
        };
        work(&mut txn)
    }
}

/// A [`HostAttributes`] builder for tests that don't care about specific
/// attribute values, only that the host is known.
pub fn bare_host_attributes(host: impl Into<String>) -> HostAttributes {
    HostAttributes {
        host: host.into(),
        values: BTreeMap::new(),
    }
}
