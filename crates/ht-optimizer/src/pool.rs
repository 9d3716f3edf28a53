//! Local worker pool for running trials on threads.

use crossbeam_channel::unbounded;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use ht_types::{MetricsReport, RunnerError, SubstrateError};

use crate::runner::{run_guarded, DatasetHandles, TrialRunner};

/// Outcome of one dispatched trial, sent back to the control thread.
#[derive(Debug)]
pub struct Completion {
    /// Position of the trial in the run's record list.
    pub slot: usize,
    pub worker: String,
    pub outcome: Result<MetricsReport, RunnerError>,
}

/// A trial ready to run: record slot plus resolved configuration.
#[derive(Debug, Clone)]
pub struct Job {
    pub slot: usize,
    /// Id of the trial record.
    pub id: Uuid,
    pub config: Value,
}

/// Fixed-size rayon pool that runs only the trial workload.
pub struct LocalPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl std::fmt::Debug for LocalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPool").field("size", &self.size).finish()
    }
}

impl LocalPool {
    pub fn new(size: usize) -> Result<Self, SubstrateError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("ht-trial-{i}"))
            .build()
            .map_err(|e| SubstrateError::PoolStartup {
                message: e.to_string(),
            })?;
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `jobs` on the pool, handing each completion to `on_complete` on
    /// the calling thread as it arrives. Returns once every job has reported.
    pub fn run_batch<F>(
        &self,
        runner: &dyn TrialRunner,
        jobs: Vec<Job>,
        datasets: &DatasetHandles,
        mut on_complete: F,
    ) -> Result<(), SubstrateError>
    where
        F: FnMut(Completion),
    {
        let expected = jobs.len();
        let (tx, rx) = unbounded::<Completion>();

        let received = self.pool.in_place_scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let worker = rayon::current_thread_index()
                        .map(|i| format!("ht-trial-{i}"))
                        .unwrap_or_else(|| "ht-trial".to_string());
                    debug!(slot = job.slot, %worker, "trial started");
                    let outcome = run_guarded(runner, &job.config, datasets);
                    // Receiver only disappears if the control thread is gone.
                    let _ = tx.send(Completion {
                        slot: job.slot,
                        worker,
                        outcome,
                    });
                });
            }
            drop(tx);

            let mut received = 0;
            for completion in rx.iter() {
                received += 1;
                on_complete(completion);
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
