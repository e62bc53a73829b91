//! The transactional envelope: wraps a [`StoreProvider`] so mutation,
//! work-command draining, and process-wide side-effect application all
//! happen atomically per logical operation, with nested calls collapsing
//! into the enclosing transaction.

use crate::state_machine::WorkCommand;
use crate::store::{StoreProvider, StoreTransaction};

/// An in-memory side effect deferred until the enclosing transaction
/// commits. Applied to process-wide state (per-job counters, the
/// `taskHosts` map) by [`crate::manager::ProcessState`].
#[derive(Debug, Clone)]
pub enum SideEffect {
    AdjustCount {
        job: crate::task::JobKey,
        from: Option<crate::task::ScheduleStatus>,
        to: Option<crate::task::ScheduleStatus>,
    },
    AddHost {
        task_id: String,
        host: String,
    },
    RemoveHost {
        task_id: String,
    },
}

/// Accumulates work commands and side effects for the lifetime of a single
/// transaction. Handed to operation bodies running inside
/// [`Envelope::run_in_transaction`].
pub struct TransactionScope<'a, T: StoreTransaction> {
    pub store: &'a mut T,
    work: Vec<(String, WorkCommand)>,
    side_effects: Vec<SideEffect>,
}

impl<'a, T: StoreTransaction> TransactionScope<'a, T> {
    fn new(store: &'a mut T) -> Self {
        Self {
            store,
            work: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    /// Enqueue a work command to be drained before commit, tagged with the
    /// task id it applies to.
    pub fn enqueue_work(&mut self, task_id: impl Into<String>, command: WorkCommand) {
        self.work.push((task_id.into(), command));
    }

    pub fn enqueue_side_effect(&mut self, effect: SideEffect) {
        self.side_effects.push(effect);
    }

    fn take_work(&mut self) -> Vec<(String, WorkCommand)> {
        std::mem::take(&mut self.work)
    }

    fn take_side_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.side_effects)
    }
}

/// Wraps a [`StoreProvider`] and drains its work queue before commit.
///
/// Nested transactions collapse by construction rather than by a runtime
/// check: `&mut Envelope` cannot be reached again while a transaction body
/// holds it, so operations that compose (e.g. `abandonTasks` driving
/// several per-task transitions) thread the existing `&mut
/// TransactionScope` through directly instead of opening a second
/// transaction.
pub struct Envelope<P: StoreProvider> {
    provider: P,
}

impl<P: StoreProvider> Envelope<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Run `body` inside a transaction, then drain its work queue and apply
    /// its side effects, all before commit.
    ///
    /// `drain` is invoked once per enqueued work command, in enqueue order,
    /// before commit; it is expected to interpret the command against the
    /// scope's store. `apply_side_effects` receives the full side-effect
    /// list after a successful drain, also before commit.
    pub fn run_in_transaction<R>(
        &mut self,
        drain: impl Fn(&mut TransactionScope<P::Transaction>, &str, WorkCommand) -> anyhow::Result<()>,
        apply_side_effects: impl FnOnce(&[SideEffect]),
        body: impl FnOnce(&mut TransactionScope<P::Transaction>) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        self.provider.do_in_transaction(|store| {
            let mut scope = TransactionScope::new(store);
            let outcome = body(&mut scope);
            let outcome = match outcome {
                Ok(value) => {
                    let work = scope.take_work();
                    let mut drain_err = None;
                    for (task_id, command) in work {
                        if let Err(err) = drain(&mut scope, &task_id, command) {
                            drain_err = Some(err);
                            break;
                        }
                    }
                    match drain_err {
                        Some(err) => Err(err),
                        None => Ok(value),
                    }
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => {
                    let effects = scope.take_side_effects();
                    apply_side_effects(&effects);
                    Ok(value)
                }
                Err(err) => {
                    // On abnormal exit the scope (and with it, any
                    // un-drained work/side effects) is simply dropped; the
                    // store's own transaction is aborted by the provider.
                    Err(err)
                }
            }
        })
    }
}
