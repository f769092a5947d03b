//! Bounded partition scheduler.
//!
//! `max_workers` named OS threads pull partitions from a shared queue and
//! report back over a channel. The coordinating thread owns every piece of
//! bookkeeping (deadlines, results, peak concurrency); workers share nothing
//! but the queue, a stop flag, and one cancel token per running partition.
//!
//! Failure policy: after the first failed partition no new partition starts.
//! Partitions already running are not interrupted; they finish or hit their
//! wall-clock deadline. A partition past its deadline is recorded as timed
//! out and its cancel token is raised. Work observes the token between remote
//! calls, rolls back, and reports; the coordinator waits up to
//! `drain_timeout` for that before leaving the thread detached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::constants::scheduler::WORKER_THREAD_PREFIX;
use crate::errors::MaterializeError;
use crate::partition::PartitionKey;
use crate::transport::fs::{remove_empty_dir_best_effort, remove_file_best_effort};
use crate::worker::PartitionResult;

/// Scheduler limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Partitions run concurrently.
    pub max_workers: usize,
    /// Wall-clock budget per partition, measured from its start.
    pub partition_timeout: Duration,
    /// Extra runs for a partition whose discovery probe failed.
    pub partition_retries: u32,
    /// How long to wait for timed-out partitions to stop once cancelled.
    pub drain_timeout: Duration,
}

/// Raised by the coordinator when a partition passes its deadline.
///
/// Work checks it between remote calls; a call already in progress is never
/// interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    budget: Duration,
}

impl CancelToken {
    /// Token for a partition with wall-clock budget `budget`.
    pub fn new(budget: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            budget,
        }
    }

    /// Signal every holder of this token to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once `cancel` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `PartitionTimeout` for `partition` once cancelled, otherwise `Ok`.
    pub fn check(&self, partition: PartitionKey) -> Result<(), MaterializeError> {
        if self.is_cancelled() {
            return Err(MaterializeError::PartitionTimeout {
                partition,
                timeout_secs: self.budget.as_secs(),
            });
        }
        Ok(())
    }
}

/// What happened to every partition of one scheduled run.
#[derive(Debug)]
pub struct ScheduleReport {
    /// Per-partition results in completion order.
    pub results: Vec<PartitionResult>,
    /// Partitions never started because an earlier partition failed.
    pub skipped: Vec<PartitionKey>,
    /// Most partitions observed running at once.
    pub peak_in_flight: usize,
}

impl ScheduleReport {
    /// Partitions that failed, in completion order.
    pub fn failed_partitions(&self) -> Vec<PartitionKey> {
        self.results
            .iter()
            .filter(|result| !result.is_success())
            .map(|result| result.partition)
            .collect()
    }

    /// Partitions abandoned past their deadline.
    pub fn timed_out_partitions(&self) -> Vec<PartitionKey> {
        self.results
            .iter()
            .filter(|result| {
                matches!(result.error, Some(MaterializeError::PartitionTimeout { .. }))
            })
            .map(|result| result.partition)
            .collect()
    }

    /// `Ok(self)` when every partition succeeded, otherwise a `RunFailed`
    /// naming the first failure.
    pub fn into_result(self, dataset: &str) -> Result<Self, MaterializeError> {
        let failed_partitions = self.failed_partitions();
        let Some(&partition) = failed_partitions.first() else {
            return Ok(self);
        };
        let source = self
            .results
            .into_iter()
            .find_map(|result| result.error)
            .unwrap_or(MaterializeError::WorkerPanicked { partition });
        Err(MaterializeError::RunFailed {
            dataset: dataset.to_string(),
            partition,
            kind: source.kind(),
            failed_partitions,
            source: Box::new(source),
        })
    }
}

enum Message {
    Started {
        partition: PartitionKey,
        at: Instant,
        cancel: CancelToken,
    },
    Finished(PartitionResult),
    Exited,
}

struct InFlight {
    // `None` when the budget does not fit in an `Instant`.
    deadline: Option<Instant>,
    cancel: CancelToken,
}

/// Runs one unit of work per partition under a bounded worker pool.
pub struct ConcurrencyScheduler {
    config: SchedulerConfig,
}

impl ConcurrencyScheduler {
    /// Create a scheduler; `max_workers` below one is treated as one.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: SchedulerConfig {
                max_workers: config.max_workers.max(1),
                ..config
            },
        }
    }

    /// Run `work` for every partition and collect the results.
    ///
    /// `work` receives the partition's cancel token and should return early
    /// (after cleaning up) once it is raised.
    ///
    /// Returns `Err` only when no worker thread could be spawned; partition
    /// failures are reported inside the `ScheduleReport`.
    pub fn run<F>(
        &self,
        partitions: Vec<PartitionKey>,
        work: F,
    ) -> Result<ScheduleReport, MaterializeError>
    where
        F: Fn(PartitionKey, &CancelToken) -> PartitionResult + Send + Sync + 'static,
    {
        if partitions.is_empty() {
            return Ok(ScheduleReport {
                results: Vec::new(),
                skipped: Vec::new(),
                peak_in_flight: 0,
            });
        }

        let worker_count = self.config.max_workers.min(partitions.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(partitions)));
        let stop = Arc::new(AtomicBool::new(false));
        let work = Arc::new(work);
        let (sender, receiver) = mpsc::channel();

        let mut running = 0usize;
        for slot in 0..worker_count {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let work = Arc::clone(&work);
            let sender = sender.clone();
            let config = self.config;
            let spawned = thread::Builder::new()
                .name(format!("{WORKER_THREAD_PREFIX}-{slot}"))
                .spawn(move || worker_loop(&queue, &stop, work.as_ref(), config, &sender));
            match spawned {
                Ok(_) => running += 1,
                Err(err) if running > 0 => {
                    warn!("[lakefetch] running with {running} worker(s); spawn failed: {err}");
                    break;
                }
                Err(err) => return Err(MaterializeError::Io(err)),
            }
        }
        drop(sender);
        debug!(workers = running, "partition workers started");

        let mut in_flight: HashMap<PartitionKey, InFlight> = HashMap::new();
        let mut abandoned: HashSet<PartitionKey> = HashSet::new();
        let mut drain_started: Option<Instant> = None;
        let mut results = Vec::new();
        let mut peak_in_flight = 0usize;

        while running > 0 {
            // Every live thread is working on an abandoned partition.
            let draining = running <= abandoned.len();
            let wake_at = if draining {
                drain_started
                    .get_or_insert_with(Instant::now)
                    .checked_add(self.config.drain_timeout)
            } else {
                in_flight.values().filter_map(|flight| flight.deadline).min()
            };
            let message = match wake_at {
                Some(wake_at) => {
                    match receiver.recv_timeout(wake_at.saturating_duration_since(Instant::now())) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };

            match message {
                Some(Message::Started {
                    partition,
                    at,
                    cancel,
                }) => {
                    let deadline = at.checked_add(self.config.partition_timeout);
                    in_flight.insert(partition, InFlight { deadline, cancel });
                    peak_in_flight = peak_in_flight.max(in_flight.len() + abandoned.len());
                    debug!(partition = %partition, "partition started");
                }
                Some(Message::Finished(result)) => {
                    if abandoned.remove(&result.partition) {
                        discard_late_result(&result);
                        continue;
                    }
                    in_flight.remove(&result.partition);
                    if !result.is_success() {
                        stop.store(true, Ordering::SeqCst);
                    }
                    results.push(result);
                }
                Some(Message::Exited) => running -= 1,
                None if draining => {
                    warn!(
                        "[lakefetch] {} cancelled partition(s) still running after {:?}; leaving them detached",
                        abandoned.len(),
                        self.config.drain_timeout
                    );
                    break;
                }
                None => {
                    let now = Instant::now();
                    let expired: Vec<PartitionKey> = in_flight
                        .iter()
                        .filter(|(_, flight)| {
                            flight.deadline.is_some_and(|deadline| deadline <= now)
                        })
                        .map(|(partition, _)| *partition)
                        .collect();
                    for partition in expired {
                        if let Some(flight) = in_flight.remove(&partition) {
                            flight.cancel.cancel();
                        }
                        abandoned.insert(partition);
                        stop.store(true, Ordering::SeqCst);
                        warn!(
                            "[lakefetch] partition {partition} exceeded {:?}; cancelling it",
                            self.config.partition_timeout
                        );
                        results.push(PartitionResult::failed(
                            partition,
                            MaterializeError::PartitionTimeout {
                                partition,
                                timeout_secs: self.config.partition_timeout.as_secs(),
                            },
                            self.config.partition_timeout,
                        ));
                    }
                }
            }
        }

        let skipped: Vec<PartitionKey> = queue
            .lock()
            .expect("partition queue poisoned")
            .drain(..)
            .collect();
        if !skipped.is_empty() {
            info!(
                "[lakefetch] {} partition(s) not started after an earlier failure",
                skipped.len()
            );
        }

        Ok(ScheduleReport {
            results,
            skipped,
            peak_in_flight,
        })
    }
}

/// A timed-out partition reported back; its outcome no longer counts.
fn discard_late_result(result: &PartitionResult) {
    if result.artifacts.is_empty() {
        debug!(partition = %result.partition, "cancelled partition stopped");
        return;
    }
    warn!(
        "[lakefetch] partition {} finished after its deadline; discarding {} artifact(s)",
        result.partition,
        result.artifacts.len()
    );
    for artifact in &result.artifacts {
        remove_file_best_effort(&artifact.path);
    }
    if let Some(dir) = result.artifacts.first().and_then(|artifact| artifact.path.parent()) {
        remove_empty_dir_best_effort(dir);
    }
}

fn worker_loop<F>(
    queue: &Mutex<VecDeque<PartitionKey>>,
    stop: &AtomicBool,
    work: &F,
    config: SchedulerConfig,
    sender: &mpsc::Sender<Message>,
) where
    F: Fn(PartitionKey, &CancelToken) -> PartitionResult,
{
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(partition) = queue.lock().expect("partition queue poisoned").pop_front() else {
            break;
        };
        let cancel = CancelToken::new(config.partition_timeout);
        let started = Message::Started {
            partition,
            at: Instant::now(),
            cancel: cancel.clone(),
        };
        if sender.send(started).is_err() {
            return;
        }
        let result = run_with_retries(work, partition, &cancel, config.partition_retries);
        if sender.send(Message::Finished(result)).is_err() {
            return;
        }
    }
    let _ = sender.send(Message::Exited);
}

fn run_with_retries<F>(
    work: &F,
    partition: PartitionKey,
    cancel: &CancelToken,
    retries: u32,
) -> PartitionResult
where
    F: Fn(PartitionKey, &CancelToken) -> PartitionResult,
{
    let mut attempt = 0u32;
    loop {
        let result = run_guarded(work, partition, cancel);
        let Some(err @ MaterializeError::Probe { .. }) = &result.error else {
            return result;
        };
        if attempt >= retries || cancel.is_cancelled() {
            return result;
        }
        attempt += 1;
        warn!(
            "[lakefetch] partition {partition} discovery failed ({err}); retrying partition ({attempt}/{retries})"
        );
    }
}

fn run_guarded<F>(work: &F, partition: PartitionKey, cancel: &CancelToken) -> PartitionResult
where
    F: Fn(PartitionKey, &CancelToken) -> PartitionResult,
{
    let started = Instant::now();
    match panic::catch_unwind(AssertUnwindSafe(|| work(partition, cancel))) {
        Ok(result) => result,
        Err(_) => {
            warn!("[lakefetch] worker for partition {partition} panicked");
            PartitionResult::failed(
                partition,
                MaterializeError::WorkerPanicked { partition },
                started.elapsed(),
            )
        }
    }
}
