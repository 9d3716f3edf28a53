//! Cluster configuration, task descriptors and dispatch to remote workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use ht_types::{config_error, HtResult, MetricsReport, RunnerError, SubstrateError};

use crate::pool::Completion;
use crate::runner::{run_guarded, DatasetHandles, TrialRunner};

/// Configuration for reaching a worker cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace for this optimization run.
    pub namespace: String,

    /// Resource requirements per worker.
    pub worker_resources: WorkerResources,

    /// Maximum number of workers used at once.
    pub max_concurrent_tasks: usize,

    /// Health-check deadline per worker.
    pub ping_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "hypertune".to_string(),
            worker_resources: WorkerResources::default(),
            max_concurrent_tasks: 4,
            ping_timeout_ms: 5_000,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> HtResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(config_error!("cluster max_concurrent_tasks must be at least 1"));
        }
        if self.ping_timeout_ms == 0 {
            return Err(config_error!("cluster ping_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Resource requirements for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs per worker (fractional ok).
    pub num_cpus: f64,
    /// Number of GPUs per worker (0 = no GPU).
    pub num_gpus: f64,
    /// Memory in bytes (0 = no limit).
    pub memory_bytes: u64,
    /// Custom resource requirements.
    pub custom: HashMap<String, f64>,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            num_gpus: 0.0,
            memory_bytes: 0,
            custom: HashMap::new(),
        }
    }
}

/// One trial as shipped to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialTask {
    /// Unique task id (matches the trial record id).
    pub task_id: Uuid,

    /// Optimization run this task belongs to.
    pub run_id: Uuid,

    /// Trial sequence number (0-indexed).
    pub trial_number: usize,

    /// Fully merged configuration for this trial.
    pub config: Value,

    pub datasets: DatasetHandles,

    /// Resource requirements for this specific task.
    pub resources: WorkerResources,
}

/// A task bound to the worker that will run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker: String,
    pub task: TrialTask,
}

/// Allocation plan for one batch of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAllocation {
    /// Number of workers the batch is spread over.
    pub num_workers: usize,

    /// Resources requested for every worker.
    pub resources: WorkerResources,

    /// Tasks in dispatch order, assigned round-robin.
    pub assignments: Vec<Assignment>,
}

impl WorkerAllocation {
    /// Spread `tasks` round-robin over at most `max_concurrent_tasks` of the
    /// given workers.
    pub fn plan(cluster: &ClusterConfig, workers: &[String], tasks: Vec<TrialTask>) -> Self {
        let num_workers = cluster
            .max_concurrent_tasks
            .min(workers.len())
            .min(tasks.len());
        let assignments = if num_workers == 0 {
            Vec::new()
        } else {
            tasks
                .into_iter()
                .enumerate()
                .map(|(i, task)| Assignment {
                    worker: workers[i % num_workers].clone(),
                    task,
                })
                .collect()
        };
        Self {
            num_workers,
            resources: cluster.worker_resources.clone(),
            assignments,
        }
    }
}

/// Errors surfaced by worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {worker} unreachable: {message}")]
    Unreachable { worker: String, message: String },
    #[error("worker {worker} did not answer within {timeout_ms} ms")]
    Timeout { worker: String, timeout_ms: u64 },
    #[error(transparent)]
    Trial(#[from] RunnerError),
}

/// A process that can run trials, local or remote.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Stable worker identifier.
    fn id(&self) -> &str;

    /// Liveness check.
    async fn ping(&self) -> Result<(), WorkerError>;

    /// Run one trial to completion.
    ///
    /// `WorkerError::Trial` means the workload failed; any other variant
    /// means the worker itself could not be used.
    async fn run_task(&self, task: TrialTask) -> Result<MetricsReport, WorkerError>;
}

/// In-process worker that runs the trial runner on tokio's blocking pool.
pub struct LocalWorker {
    id: String,
    runner: Arc<dyn TrialRunner>,
}

impl LocalWorker {
    pub fn new(id: impl Into<String>, runner: Arc<dyn TrialRunner>) -> Self {
        Self {
            id: id.into(),
            runner,
        }
    }
}

#[async_trait]
impl WorkerClient for LocalWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn run_task(&self, task: TrialTask) -> Result<MetricsReport, WorkerError> {
        let runner = self.runner.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_guarded(runner.as_ref(), &task.config, &task.datasets)
        })
        .await
        .map_err(|e| WorkerError::Unreachable {
            worker: self.id.clone(),
            message: e.to_string(),
        })?;
        Ok(outcome?)
    }
}

struct WorkerSlot {
    client: Arc<dyn WorkerClient>,
    healthy: bool,
}

/// Drives a fleet of workers from the synchronous control thread.
///
/// Owns a tokio runtime; calls block on it and must not be made from inside
/// another runtime.
pub struct ClusterDispatcher {
    cluster: ClusterConfig,
    runtime: tokio::runtime::Runtime,
    workers: Vec<WorkerSlot>,
}

impl std::fmt::Debug for ClusterDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDispatcher")
            .field("namespace", &self.cluster.namespace)
            .field("workers", &self.workers.len())
            .field("healthy", &self.healthy_workers().len())
            .finish()
    }
}

impl ClusterDispatcher {
    pub fn new(
        cluster: ClusterConfig,
        clients: Vec<Arc<dyn WorkerClient>>,
    ) -> Result<Self, SubstrateError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(cluster.max_concurrent_tasks.max(1))
            .thread_name("ht-dispatch")
            .enable_all()
            .build()
            .map_err(|e| SubstrateError::PoolStartup {
                message: e.to_string(),
            })?;
        let workers = clients
            .into_iter()
            .map(|client| WorkerSlot {
                client,
                healthy: true,
            })
            .collect();
        Ok(Self {
            cluster,
            runtime,
            workers,
        })
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Start `count` in-process workers around `runner`.
    pub fn attach_local(&mut self, runner: Arc<dyn TrialRunner>, count: usize) {
        for i in 0..count {
            let worker = LocalWorker::new(format!("local-{i}"), runner.clone());
            self.workers.push(WorkerSlot {
                client: Arc::new(worker),
                healthy: true,
            });
        }
    }

    pub fn healthy_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.healthy)
            .map(|w| w.client.id().to_string())
            .collect()
    }

    fn unreachable(&self) -> SubstrateError {
        SubstrateError::ClusterUnreachable {
            namespace: self.cluster.namespace.clone(),
        }
    }

    /// Ping every healthy worker; ones that fail are dropped from rotation.
    /// Returns the number still healthy.
    pub fn health_check(&mut self) -> Result<usize, SubstrateError> {
        let timeout = Duration::from_millis(self.cluster.ping_timeout_ms);
        let Self {
            runtime, workers, ..
        } = self;

        let pings: Vec<(usize, Result<(), String>)> = runtime.block_on(async {
            let handles: Vec<_> = workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.healthy)
                .map(|(i, w)| {
                    let client = w.client.clone();
                    let ping = tokio::spawn(async move {
                        match tokio::time::timeout(timeout, client.ping()).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(WorkerError::Timeout {
                                worker: client.id().to_string(),
                                timeout_ms: timeout.as_millis() as u64,
                            }
                            .to_string()),
                        }
                    });
                    (i, ping)
                })
                .collect();

            let mut pings = Vec::with_capacity(handles.len());
            for (i, handle) in handles {
                let result = handle.await.unwrap_or_else(|e| Err(e.to_string()));
                pings.push((i, result));
            }
            pings
        });

        for (i, result) in pings {
            if let Err(message) = result {
                let slot = &mut workers[i];
                slot.healthy = false;
                warn!(worker = slot.client.id(), %message, "worker failed health check");
            }
        }

        let healthy = self.healthy_workers().len();
        if healthy == 0 {
            return Err(self.unreachable());
        }
        Ok(healthy)
    }

    /// Run a batch across healthy workers, handing each completion to
    /// `on_complete` on the calling thread.
    ///
    /// Each worker runs one task at a time, starting with its planned share.
    /// A worker that cannot be used (or panics) fails the trial it was running
    /// with `RunnerError::WorkerLost` and leaves the rotation; its unstarted
    /// tasks go to whichever healthy worker frees up first. If no healthy
    /// worker remains, those tasks fail as lost too.
    pub fn run_batch<F>(&mut self, tasks: Vec<TrialTask>, mut on_complete: F) -> Result<(), SubstrateError>
    where
        F: FnMut(Completion),
    {
        let healthy = self.healthy_workers();
        if healthy.is_empty() {
            return Err(self.unreachable());
        }
        let allocation = WorkerAllocation::plan(&self.cluster, &healthy, tasks);
        let expected = allocation.assignments.len();
        debug!(
            tasks = expected,
            workers = allocation.num_workers,
            "dispatching batch"
        );

        let mut queues: HashMap<String, VecDeque<TrialTask>> = HashMap::new();
        for assignment in allocation.assignments {
            queues
                .entry(assignment.worker)
                .or_default()
                .push_back(assignment.task);
        }

        let Self {
            runtime, workers, ..
        } = self;

        // Planned workers, in rotation order.
        let roster: Vec<Arc<dyn WorkerClient>> = healthy
            .iter()
            .filter(|id| queues.contains_key(*id))
            .filter_map(|id| workers.iter().find(|w| w.client.id() == id))
            .map(|w| w.client.clone())
            .collect();

        let received = runtime.block_on(async {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Completion, bool)>();
            let mut idle: VecDeque<Arc<dyn WorkerClient>> = roster.iter().cloned().collect();
            // Healthy workers with nothing to do until a queue is handed back.
            let mut waiting: Vec<Arc<dyn WorkerClient>> = Vec::new();
            let mut orphans: VecDeque<(String, TrialTask)> = VecDeque::new();
            let mut in_flight = 0;
            let mut received = 0;

            loop {
                while let Some(client) = idle.pop_front() {
                    let own = queues
                        .get_mut(client.id())
                        .and_then(VecDeque::pop_front);
                    match own.or_else(|| orphans.pop_front().map(|(_, t)| t)) {
                        Some(task) => {
                            spawn_trial(client, task, tx.clone());
                            in_flight += 1;
                        }
                        None => waiting.push(client),
                    }
                }
                if in_flight == 0 {
                    break;
                }
                let Some((completion, lost)) = rx.recv().await else {
                    break;
                };
                in_flight -= 1;
                received += 1;

                let worker_id = completion.worker.clone();
                if lost {
                    if let Some(slot) = workers
                        .iter_mut()
                        .find(|w| w.healthy && w.client.id() == worker_id)
                    {
                        slot.healthy = false;
                        warn!(worker = %worker_id, "worker lost, removed from rotation");
                    }
                    if let Some(queue) = queues.remove(&worker_id) {
                        if !queue.is_empty() {
                            orphans.extend(queue.into_iter().map(|t| (worker_id.clone(), t)));
                            idle.extend(waiting.drain(..));
                        }
                    }
                } else if let Some(client) = roster.iter().find(|c| c.id() == worker_id) {
                    idle.push_back(client.clone());
                }
                on_complete(completion);
            }

            for (worker, task) in orphans {
                received += 1;
                on_complete(Completion {
                    slot: task.trial_number,
                    worker: worker.clone(),
                    outcome: Err(RunnerError::WorkerLost {
                        worker,
                        message: "no healthy worker left to take the trial".to_string(),
                    }),
                });
            }
            received
        });

        if received < expected {
            return Err(SubstrateError::Disconnected {
                outstanding: expected - received,
            });
        }
        Ok(())
    }
}

/// Run one task on `client` and report it, flagging whether the worker is lost.
/// The call runs in its own task so a panicking client only loses that worker.
fn spawn_trial(
    client: Arc<dyn WorkerClient>,
    task: TrialTask,
    tx: mpsc::UnboundedSender<(Completion, bool)>,
) {
    let worker = client.id().to_string();
    let slot = task.trial_number;
    tokio::spawn(async move {
        let call = tokio::spawn(async move { client.run_task(task).await });
        let (outcome, lost) = match call.await {
            Ok(Ok(report)) => (Ok(report), false),
            Ok(Err(WorkerError::Trial(e))) => (Err(e), false),
            Ok(Err(e)) => (
                Err(RunnerError::WorkerLost {
                    worker: worker.clone(),
                    message: e.to_string(),
                }),
                true,
            ),
            Err(e) => (
                Err(RunnerError::WorkerLost {
                    worker: worker.clone(),
                    message: e.to_string(),
                }),
                true,
            ),
        };
        // Receiver only disappears if the control thread is gone.
        let _ = tx.send((
            Completion {
                slot,
                worker,
                outcome,
            },
            lost,
        ));
    });
}
