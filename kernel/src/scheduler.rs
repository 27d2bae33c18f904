//! Parallel scheduler: fan a task out to isolated workers and reduce their
//! outcomes to one winner.
//!
//! Each worker runs on its own OS thread against its own snapshot and reports
//! exactly one outcome over a channel. The scheduler waits for every slot
//! (or the deadline plus a grace period), fills missing slots itself, sweeps
//! every snapshot lease and only then applies the tie-break.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::core::critique::CritiquePolicy;
use crate::core::outcome::{OutcomeStatus, TaskOutcome, TaskResult};
use crate::core::plan::Plan;
use crate::core::tiebreak::select_winner;
use crate::io::config::KernelConfig;
use crate::io::sandbox::StepExecutor;
use crate::io::snapshot::{SnapshotLease, SnapshotProvider};
use crate::worker::{WorkerContext, run_worker};

/// A repair task: the repository to fix plus read-only context from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub repo: PathBuf,
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_budget: Duration,
    pub step_timeout: Duration,
    pub join_grace: Duration,
    pub policy: CritiquePolicy,
    /// Directory receiving `worker-{n}.audit.jsonl`; in-memory logs when `None`.
    pub audit_dir: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            worker_budget: cfg.worker_budget(),
            step_timeout: cfg.step_timeout(),
            join_grace: cfg.join_grace(),
            policy: cfg.critique_policy(),
            audit_dir: None,
        }
    }
}

pub struct Scheduler<E> {
    executor: Arc<E>,
    snapshots: Arc<dyn SnapshotProvider>,
    config: SchedulerConfig,
}

/// Book-keeping for one launched worker.
struct Slot {
    lease: Option<SnapshotLease>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    outcome: Option<TaskOutcome>,
}

impl<E: StepExecutor + 'static> Scheduler<E> {
    pub fn new(
        executor: Arc<E>,
        snapshots: Arc<dyn SnapshotProvider>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            snapshots,
            config,
        }
    }

    /// Run the first `min(worker_count, plan_variants.len())` variants, one per
    /// worker, and select the winner.
    #[instrument(skip_all, fields(task_id = %task.id, variants = plan_variants.len(), worker_count))]
    pub fn run(
        &self,
        task: &Task,
        plan_variants: &[Arc<Plan>],
        worker_count: usize,
    ) -> Result<TaskResult> {
        let workers = worker_count.min(plan_variants.len());
        if workers == 0 {
            bail!("task {} has no plan variants to run", task.id);
        }
        debug!(workers, context_keys = task.context.len(), "starting workers");

        // Snapshots are acquired here, one after another, before any worker
        // starts. The deadline clock starts once they are all in place.
        let leases: Vec<_> = plan_variants
            .iter()
            .take(workers)
            .enumerate()
            .map(|(index, plan)| {
                let worker_id = index + 1;
                let lease =
                    SnapshotLease::acquire(self.snapshots.clone(), &task.id, worker_id, &task.repo);
                (worker_id, plan.clone(), lease)
            })
            .collect();

        let deadline = Instant::now() + self.config.worker_budget;
        let (tx, rx) = mpsc::channel::<(usize, TaskOutcome)>();
        let mut slots: BTreeMap<usize, Slot> = BTreeMap::new();

        for (worker_id, plan, lease) in leases {
            let cancel = Arc::new(AtomicBool::new(false));
            let mut slot = Slot {
                lease: None,
                cancel: cancel.clone(),
                handle: None,
                outcome: None,
            };
            match lease {
                Ok(lease) => {
                    let ctx = WorkerContext {
                        worker_id,
                        plan,
                        root: lease.root().to_path_buf(),
                        policy: self.config.policy,
                        step_timeout: self.config.step_timeout,
                        deadline,
                        cancel,
                        audit_path: self
                            .config
                            .audit_dir
                            .as_ref()
                            .map(|dir| dir.join(format!("worker-{worker_id}.audit.jsonl"))),
                    };
                    match self.spawn_worker(ctx, lease.clone(), tx.clone()) {
                        Ok(handle) => slot.handle = Some(handle),
                        Err(err) => {
                            error!(worker_id, err = %format!("{err:#}"), "failed to start worker");
                            slot.outcome = Some(TaskOutcome::failed(
                                worker_id,
                                OutcomeStatus::Error,
                                format!("failed to start worker: {err:#}"),
                            ));
                        }
                    }
                    slot.lease = Some(lease);
                }
                Err(err) => {
                    error!(worker_id, err = %format!("{err:#}"), "snapshot unavailable");
                    slot.outcome = Some(TaskOutcome::failed(
                        worker_id,
                        OutcomeStatus::Error,
                        format!("snapshot unavailable: {err:#}"),
                    ));
                }
            }
            slots.insert(worker_id, slot);
        }
        drop(tx);

        let disconnected = self.collect(&rx, &mut slots, deadline);
        self.finish_slots(&mut slots, disconnected);

        let outcomes: Vec<TaskOutcome> = slots
            .into_values()
            .map(|slot| {
                slot.outcome
                    .ok_or_else(|| anyhow!("worker slot left empty"))
            })
            .collect::<Result<_>>()?;
        let winner = select_winner(&outcomes)
            .cloned()
            .ok_or_else(|| anyhow!("no outcomes to select from"))?;
        info!(
            winner = winner.worker_id,
            status = %winner.status,
            "task finished"
        );
        Ok(TaskResult {
            task_id: task.id.clone(),
            winner,
            outcomes,
        })
    }

    fn spawn_worker(
        &self,
        ctx: WorkerContext,
        lease: SnapshotLease,
        tx: mpsc::Sender<(usize, TaskOutcome)>,
    ) -> Result<JoinHandle<()>> {
        let executor = self.executor.clone();
        let worker_id = ctx.worker_id;
        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| run_worker(executor.as_ref(), &ctx)));
                if let Err(err) = lease.release() {
                    warn!(worker_id, err = %format!("{err:#}"), "snapshot release failed");
                }
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        error!(worker_id, "worker panicked");
                        TaskOutcome::failed(
                            worker_id,
                            OutcomeStatus::Error,
                            format!("worker panicked: {}", panic_message(panic.as_ref())),
                        )
                    }
                };
                // The scheduler may have stopped listening after the deadline.
                let _ = tx.send((worker_id, outcome));
            })?;
        Ok(handle)
    }

    /// Receive outcomes until every slot is filled, the deadline plus grace
    /// passes, or every sender is gone. Returns true when senders disconnected.
    fn collect(
        &self,
        rx: &mpsc::Receiver<(usize, TaskOutcome)>,
        slots: &mut BTreeMap<usize, Slot>,
        deadline: Instant,
    ) -> bool {
        let give_up = deadline + self.config.join_grace;
        while slots.values().any(|slot| slot.outcome.is_none()) {
            let wait = give_up.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok((worker_id, outcome)) => match slots.get_mut(&worker_id) {
                    Some(slot) if slot.outcome.is_none() => slot.outcome = Some(outcome),
                    _ => warn!(worker_id, "ignoring unexpected worker report"),
                },
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
        false
    }

    /// Fill empty slots, cancel stragglers, reap finished threads and sweep leases.
    fn finish_slots(&self, slots: &mut BTreeMap<usize, Slot>, disconnected: bool) {
        for (worker_id, slot) in slots.iter_mut() {
            if slot.outcome.is_none() {
                slot.cancel.store(true, Ordering::SeqCst);
                slot.outcome = Some(if disconnected {
                    warn!(worker_id, "worker exited without reporting");
                    TaskOutcome::failed(
                        *worker_id,
                        OutcomeStatus::Error,
                        "worker exited without reporting",
                    )
                } else {
                    warn!(worker_id, "worker missed its deadline");
                    TaskOutcome::failed(
                        *worker_id,
                        OutcomeStatus::Timeout,
                        "worker did not report before its deadline",
                    )
                });
                // A hung thread is left detached; it only ever sees its cancel flag.
                slot.handle = None;
            } else if let Some(handle) = slot.handle.take()
                && handle.join().is_err()
            {
                warn!(worker_id, "worker thread ended abnormally after reporting");
            }

            if let Some(lease) = &slot.lease {
                match lease.release() {
                    Ok(true) => debug!(worker_id, "snapshot force-released"),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(worker_id, err = %format!("{err:#}"), "snapshot sweep failed");
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
