use aurelia_scheduler_core::config::SchedulerConfig;
use aurelia_scheduler_core::manager::{StateManager, UpdateResult};
use aurelia_scheduler_core::resources::ResourceBag;
use aurelia_scheduler_core::store::Query;
use aurelia_scheduler_core::task::{JobKey, ScheduleStatus, TaskConfig, TierName};
use aurelia_scheduler_core::testing::InMemoryStore;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn task_config(job: &JobKey, shard_id: i32) -> TaskConfig {
    TaskConfig {
        job: job.clone(),
        shard_id,
        resources: ResourceBag::new(),
        priority: 0,
        tier: TierName("preferred".into()),
        command: None,
    }
}

fn running_manager() -> StateManager<InMemoryStore> {
    let mut manager = StateManager::new(InMemoryStore::new(), SchedulerConfig::default(), || 1_000);
    manager.prepare().unwrap();
    manager.initialize().unwrap();
    manager.start(|_task_id| {});
    manager
}

#[test]
fn insert_then_fetch_round_trips_the_config() {
    use aurelia_scheduler_core::store::{StoreProvider, TaskStore};

    let mut store = InMemoryStore::new();
    let mut manager = StateManager::new(store.clone(), SchedulerConfig::default(), || 1_000);
    manager.prepare().unwrap();
    manager.initialize().unwrap();
    manager.start(|_| {});

    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();

    let fetched = store
        .do_in_transaction(|txn| txn.fetch_tasks(&Query::by_id(ids[0].clone())))
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].config, task_config(&job, 0));
    assert_eq!(fetched[0].status, ScheduleStatus::Pending);
}

#[test]
fn change_state_to_current_status_is_idempotent() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();

    let count = manager
        .change_state(&Query::by_id(ids[0].clone()), ScheduleStatus::Pending, None)
        .unwrap();
    assert_eq!(count, 0);
}

// S4: duplicate registerUpdate calls raise "already in progress".
#[test]
fn duplicate_register_update_is_rejected() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();

    let token = manager.register_update(job.clone(), vec![task_config(&job, 0)]).unwrap();
    assert!(!token.is_empty());

    let err = manager
        .register_update(job.clone(), vec![task_config(&job, 0)])
        .unwrap_err();
    assert!(matches!(
        err,
        aurelia_scheduler_core::StateManagerError::UpdateAlreadyInProgress { .. }
    ));
}

// S5: finishUpdate(SUCCESS) kills shards whose new config is absent.
#[test]
fn finish_update_success_kills_shards_dropped_from_the_job() {
    let job = JobKey::new("www-data", "hello");
    let killed = Arc::new(Mutex::new(Vec::new()));

    let store = InMemoryStore::new();
    let mut manager = StateManager::new(store, SchedulerConfig::default(), || 1_000);
    manager.prepare().unwrap();
    manager.initialize().unwrap();
    let killed_for_callback = killed.clone();
    manager.start(move |task_id| killed_for_callback.lock().unwrap().push(task_id.to_string()));

    let ids = manager
        .insert_tasks(vec![task_config(&job, 0), task_config(&job, 1), task_config(&job, 2)])
        .unwrap();
    for id in &ids {
        manager.assign_task(id, "slave-1", "host-1", BTreeMap::new()).unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();
    }

    // Shard 2 is dropped entirely: the update's newConfigs omit it.
    let token = manager
        .register_update(job.clone(), vec![task_config(&job, 0), task_config(&job, 1)])
        .unwrap();

    manager.finish_update(job.clone(), Some(token), UpdateResult::Success).unwrap();

    assert_eq!(killed.lock().unwrap().len(), 1);
    assert_eq!(killed.lock().unwrap()[0], ids[2]);

    let again = manager.finish_update(job, None, UpdateResult::Success).unwrap_err();
    assert!(matches!(
        again,
        aurelia_scheduler_core::StateManagerError::UpdateNotFound { .. }
    ));
}

// Any live task can be killed through the generic transition entry point.
#[test]
fn change_state_to_killing_drives_the_kill_callback() {
    let killed = Arc::new(Mutex::new(Vec::new()));
    let killed_for_callback = killed.clone();

    let mut manager = StateManager::new(InMemoryStore::new(), SchedulerConfig::default(), || 1_000);
    manager.prepare().unwrap();
    manager.initialize().unwrap();
    manager.start(move |task_id| killed_for_callback.lock().unwrap().push(task_id.to_string()));

    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();
    let id = ids[0].clone();
    manager.assign_task(&id, "slave-1", "host-1", BTreeMap::new()).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();

    let count = manager
        .change_state(&Query::by_id(id.clone()), ScheduleStatus::Killing, Some("requested by owner".into()))
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(killed.lock().unwrap().as_slice(), [id]);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Killing), 1);
}

// The preemption engine's selected victims are actually driven into
// PREEMPTING through the state manager, not left disconnected.
#[test]
fn preempt_tasks_moves_selected_victims_to_preempting() {
    use aurelia_scheduler_core::task::PreemptionVictim;

    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0), task_config(&job, 1)]).unwrap();
    for id in &ids {
        manager.assign_task(id, "slave-1", "host-1", BTreeMap::new()).unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();
    }

    let victims = vec![PreemptionVictim {
        task_id: ids[0].clone(),
        config: task_config(&job, 0),
        resources: ResourceBag::new(),
        slave_host: "host-1".into(),
    }];

    let count = manager.preempt_tasks(&victims, Some("preempted for higher-priority task".into())).unwrap();

    assert_eq!(count, 1);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Preempting), 1);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Running), 1);
}

// S6: abandoning a set of running tasks clears their rows, host map, and
// per-job counters, each exactly once.
#[test]
fn abandon_tasks_clears_rows_hosts_and_counters_exactly_once() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0), task_config(&job, 1)]).unwrap();

    for (i, id) in ids.iter().enumerate() {
        manager
            .assign_task(id, "slave-1", &format!("host-{i}"), BTreeMap::new())
            .unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
        manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();
    }
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Running), 2);

    manager.abandon_tasks(&ids).unwrap();

    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Running), 0);
    let hosts = manager.get_host_assigned_tasks();
    assert!(hosts.values().all(|tasks| ids.iter().all(|id| !tasks.contains(id))));
}

// Invariant 2: taskHosts membership tracks assigned-live status exactly.
#[test]
fn task_hosts_tracks_assigned_live_membership() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();
    let id = ids[0].clone();

    assert!(manager.get_host_assigned_tasks().values().all(|s| !s.contains(&id)));

    manager.assign_task(&id, "slave-1", "host-1", BTreeMap::new()).unwrap();
    assert!(manager.get_host_assigned_tasks().get("host-1").unwrap().contains(&id));

    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Finished, None).unwrap();

    assert!(manager.get_host_assigned_tasks().values().all(|s| !s.contains(&id)));
}

// Timeout rule: a task stuck past the missing-task grace period is
// rescheduled to a fresh row and its old row marked LOST.
#[tokio::test]
async fn scan_outstanding_tasks_reschedules_assigned_tasks_past_the_grace_period() {
    let config = SchedulerConfig::default();
    let grace_period_ms = config.missing_task_grace_period.as_millis() as i64;
    let clock = Arc::new(Mutex::new(1_000i64));
    let clock_for_manager = clock.clone();

    let mut manager = StateManager::new(InMemoryStore::new(), config, move || *clock_for_manager.lock().unwrap());
    manager.prepare().unwrap();
    manager.initialize().unwrap();
    manager.start(|_task_id| {});

    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();
    manager.assign_task(&ids[0], "slave-1", "host-1", BTreeMap::new()).unwrap();

    manager.scan_outstanding_tasks().unwrap();
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Assigned), 1);

    *clock.lock().unwrap() += grace_period_ms + 1;
    manager.scan_outstanding_tasks().unwrap();

    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Assigned), 0);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Lost), 1);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Pending), 1);
}

#[test]
fn fetch_updated_task_configs_returns_only_the_requested_shards_new_configs() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    manager
        .insert_tasks(vec![task_config(&job, 0), task_config(&job, 1)])
        .unwrap();

    let mut updated_shard_0 = task_config(&job, 0);
    updated_shard_0.priority = 5;
    manager
        .register_update(job.clone(), vec![updated_shard_0.clone(), task_config(&job, 1)])
        .unwrap();

    let configs = manager.fetch_updated_task_configs(&job, Some(&[0])).unwrap();
    assert_eq!(configs, vec![updated_shard_0]);

    let all_configs = manager.fetch_updated_task_configs(&job, None).unwrap();
    assert_eq!(all_configs.len(), 2);
}

// Invariant: a failure under the retry budget reschedules to a fresh row.
#[test]
fn failed_task_under_retry_budget_reschedules_to_a_new_row() {
    let mut manager = running_manager();
    let job = JobKey::new("www-data", "hello");
    let ids = manager.insert_tasks(vec![task_config(&job, 0)]).unwrap();
    let id = ids[0].clone();

    manager.assign_task(&id, "slave-1", "host-1", BTreeMap::new()).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Starting, None).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Running, None).unwrap();
    manager.change_state(&Query::by_id(id.clone()), ScheduleStatus::Failed, None).unwrap();

    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Pending), 1);
    assert_eq!(manager.process_state().count(&job, ScheduleStatus::Failed), 1);
}
