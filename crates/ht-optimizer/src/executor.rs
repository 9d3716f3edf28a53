//! The optimization control loop and the substrates it dispatches to.
//!
//! One control thread owns the strategy and every trial record. Workers only
//! run the trial workload and report back; all scoring, feedback and record
//! bookkeeping happens here.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use ht_types::{config_error, HtError, HtResult};

use crate::aggregate::extract_score;
use crate::distributed::{ClusterConfig, ClusterDispatcher, TrialTask, WorkerClient};
use crate::merge::{merge, validate_paths};
use crate::pool::{Completion, Job, LocalPool};
use crate::registry::{ExecutorKind, StrategyRegistry};
use crate::runner::{run_guarded, DatasetHandles, TrialRunner};
use crate::search::SearchStrategy;
use crate::sink::ResultSink;
use crate::space::{Sample, SearchSpace};
use crate::trial::{
    FeedbackPolicy, ObjectiveDirection, OptimizationConfig, OptimizationResult, RunId, RunState,
    RunStatus, SearchGoal, TrialRecord,
};

/// Shared, read-mostly view of a run's progress.
pub type StatusHandle = Arc<RwLock<RunStatus>>;

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A run that stopped on a fatal error, with whatever it produced so far.
#[derive(Debug, thiserror::Error)]
#[error("optimization aborted: {error}")]
pub struct ExecutionAborted {
    pub error: HtError,
    pub partial: OptimizationResult,
}

/// Per-run knobs that are not part of the strategy or the substrate.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub run_id: RunId,
    pub max_trials: Option<usize>,
    pub feedback: FeedbackPolicy,
    pub cancel: CancelHandle,
    pub status: StatusHandle,
}

impl RunControl {
    pub fn new(run_id: RunId, name: impl Into<String>) -> Self {
        Self {
            run_id,
            max_trials: None,
            feedback: FeedbackPolicy::default(),
            cancel: CancelHandle::new(),
            status: Arc::new(RwLock::new(RunStatus::new(
                run_id,
                name,
                ObjectiveDirection::default(),
            ))),
        }
    }

    pub fn with_max_trials(mut self, max_trials: Option<usize>) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackPolicy) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Bookkeeping for one `execute` call.
struct RunLedger<'a> {
    control: &'a RunControl,
    goal: &'a SearchGoal,
    sink: &'a mut dyn ResultSink,
    records: Vec<TrialRecord>,
}

impl RunLedger<'_> {
    fn publish(&mut self, slot: usize) {
        let record = &self.records[slot];
        self.sink.record(record);
        self.control.status.write().record(record);
    }

    /// Score a completion and finalize its record. Returns the feedback pair
    /// for successful trials.
    fn finalize(&mut self, completion: Completion) -> Option<(Sample, f64)> {
        let Completion {
            slot,
            worker,
            outcome,
        } = completion;
        let Some(record) = self.records.get_mut(slot) else {
            warn!(slot, "completion for unknown trial ignored");
            return None;
        };
        if record.status.is_terminal() {
            warn!(trial = slot, "duplicate completion ignored");
            return None;
        }
        record.worker_id = Some(worker);

        let feedback = match outcome {
            Ok(report) => match extract_score(&report, &self.goal.selector) {
                Ok(score) => {
                    record.mark_succeeded(score, report);
                    Some((record.sample.clone(), score))
                }
                Err(e) => {
                    warn!(trial = slot, error = %e, "trial produced no usable score");
                    record.attach_report(report);
                    record.mark_failed(HtError::from(e));
                    None
                }
            },
            Err(e) => {
                warn!(trial = slot, worker = ?record.worker_id, error = %e, "trial failed");
                record.mark_failed(HtError::from(e));
                None
            }
        };
        debug!(
            trial = slot,
            status = record.status.as_str(),
            score = ?record.score,
            "trial finished"
        );
        self.publish(slot);
        feedback
    }

    fn into_result(self, state: RunState) -> OptimizationResult {
        let result = OptimizationResult::new(
            self.control.run_id,
            self.records,
            self.goal.direction,
            state,
        );
        self.sink.finish(&result);
        result
    }

    /// Fail every unfinished record and package what exists.
    fn abort(mut self, error: HtError) -> ExecutionAborted {
        let message = error.to_string();
        let unfinished: Vec<usize> = self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.trial_number)
            .collect();
        for slot in unfinished {
            self.records[slot].mark_failed(&message);
            self.publish(slot);
        }

        error!(run_id = %self.control.run_id, error = %message, "optimization aborted");
        self.control.status.write().mark_aborted(message);
        let partial = self.into_result(RunState::Aborted);
        ExecutionAborted { error, partial }
    }
}

/// Where trials run.
pub enum Executor {
    /// One trial at a time on the calling thread.
    Serial,
    /// Batches of trials on a local thread pool.
    LocalParallel(LocalPool),
    /// Batches of trials on remote (or in-process) workers.
    Distributed {
        dispatcher: ClusterDispatcher,
        concurrency: usize,
    },
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => f.write_str("Serial"),
            Self::LocalParallel(pool) => f.debug_tuple("LocalParallel").field(pool).finish(),
            Self::Distributed {
                dispatcher,
                concurrency,
            } => f
                .debug_struct("Distributed")
                .field("dispatcher", dispatcher)
                .field("concurrency", concurrency)
                .finish(),
        }
    }
}

impl Executor {
    pub fn serial() -> Self {
        Self::Serial
    }

    pub fn local_parallel(concurrency: usize) -> HtResult<Self> {
        if concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        Ok(Self::LocalParallel(LocalPool::new(concurrency)?))
    }

    /// With no `workers`, `concurrency` in-process workers are started when
    /// the run begins.
    pub fn distributed(
        cluster: ClusterConfig,
        workers: Vec<Arc<dyn WorkerClient>>,
        concurrency: usize,
    ) -> HtResult<Self> {
        if concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        cluster.validate()?;
        Ok(Self::Distributed {
            dispatcher: ClusterDispatcher::new(cluster, workers)?,
            concurrency,
        })
    }

    pub fn from_config(config: &OptimizationConfig, workers: Vec<Arc<dyn WorkerClient>>) -> HtResult<Self> {
        match config.executor {
            ExecutorKind::Serial => Ok(Self::serial()),
            ExecutorKind::LocalParallel => Self::local_parallel(config.concurrency),
            ExecutorKind::Distributed => {
                Self::distributed(config.cluster.clone(), workers, config.concurrency)
            }
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            Self::Serial => ExecutorKind::Serial,
            Self::LocalParallel(_) => ExecutorKind::LocalParallel,
            Self::Distributed { .. } => ExecutorKind::Distributed,
        }
    }

    /// Trials pulled per batch.
    pub fn width(&self) -> usize {
        match self {
            Self::Serial => 1,
            Self::LocalParallel(pool) => pool.size(),
            Self::Distributed { concurrency, .. } => *concurrency,
        }
    }

    fn preflight(
        &self,
        control: &RunControl,
        base: &Value,
        strategy: &dyn SearchStrategy,
    ) -> HtResult<()> {
        if !strategy.bounded() && control.max_trials.is_none() {
            return Err(config_error!(
                "strategy '{}' never finishes on its own, set max_trials",
                strategy.name()
            ));
        }
        validate_paths(base, strategy.space())?;
        Ok(())
    }

    /// Run trials until the strategy is exhausted, the trial budget is spent
    /// or the run is cancelled.
    ///
    /// Trial-level failures (runner errors, panics, missing metrics, bad
    /// paths for one sample) become failed records. Anything else ends the
    /// run with [`ExecutionAborted`].
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &mut self,
        control: &RunControl,
        base: &Value,
        strategy: &mut dyn SearchStrategy,
        goal: &SearchGoal,
        runner: Arc<dyn TrialRunner>,
        datasets: &DatasetHandles,
        sink: &mut dyn ResultSink,
    ) -> Result<OptimizationResult, ExecutionAborted> {
        let run_id = control.run_id;
        control.status.write().restart(run_id, goal.direction);
        info!(
            run_id = %run_id,
            executor = %self.kind(),
            strategy = strategy.name(),
            max_trials = ?control.max_trials,
            "optimization started"
        );

        let mut ledger = RunLedger {
            control,
            goal,
            sink,
            records: Vec::new(),
        };

        if let Err(e) = self.preflight(control, base, strategy) {
            return Err(ledger.abort(e));
        }
        if let Self::Distributed {
            dispatcher,
            concurrency,
        } = self
        {
            if !dispatcher.has_workers() {
                info!(workers = *concurrency, "no remote workers, starting local workers");
                dispatcher.attach_local(runner.clone(), *concurrency);
            }
        }

        let width = self.width();
        let per_completion = control.feedback == FeedbackPolicy::PerCompletion;
        let mut final_state = RunState::Completed;

        loop {
            if control.cancel.is_cancelled() {
                info!(run_id = %run_id, "cancellation requested");
                final_state = RunState::Cancelled;
                break;
            }
            if strategy.finished() {
                break;
            }
            let budget = match control.max_trials {
                Some(max) => max.saturating_sub(ledger.records.len()),
                None => width,
            };
            if budget == 0 {
                break;
            }

            if let Self::Distributed { dispatcher, .. } = self {
                if let Err(e) = dispatcher.health_check() {
                    return Err(ledger.abort(e.into()));
                }
            }

            let batch = match strategy.sample_batch(width.min(budget)) {
                Ok(batch) => batch,
                Err(e) => return Err(ledger.abort(e)),
            };
            if batch.is_empty() {
                break;
            }

            let mut jobs = Vec::with_capacity(batch.len());
            let mut unresolved = Vec::new();
            for sample in batch {
                let slot = ledger.records.len();
                let mut record = TrialRecord::new(run_id, slot, sample);
                match merge(base, &record.sample) {
                    Ok(config) => {
                        record.mark_running(None);
                        jobs.push(Job {
                            slot,
                            id: record.id,
                            config,
                        });
                    }
                    Err(e) => {
                        warn!(trial = slot, error = %e, "cannot resolve trial configuration");
                        record.mark_failed(HtError::from(e));
                        unresolved.push(slot);
                    }
                }
                ledger.records.push(record);
            }
            control.status.write().trials_dispatched = ledger.records.len();
            for slot in unresolved {
                ledger.publish(slot);
            }

            let dispatched = jobs.len();
            debug!(trials = dispatched, "dispatching batch");

            let mut feedback = Vec::with_capacity(dispatched);
            let outcome = {
                let mut complete = |completion: Completion| {
                    if let Some((sample, score)) = ledger.finalize(completion) {
                        if per_completion {
                            strategy.update(&sample, score);
                        } else {
                            feedback.push((sample, score));
                        }
                    }
                };

                match self {
                    Self::Serial => {
                        for job in jobs {
                            let outcome = run_guarded(runner.as_ref(), &job.config, datasets);
                            complete(Completion {
                                slot: job.slot,
                                worker: "serial".to_string(),
                                outcome,
                            });
                        }
                        Ok(())
                    }
                    Self::LocalParallel(pool) => {
                        pool.run_batch(runner.as_ref(), jobs, datasets, &mut complete)
                    }
                    Self::Distributed { dispatcher, .. } => {
                        let resources = dispatcher.cluster().worker_resources.clone();
                        let tasks = jobs
                            .into_iter()
                            .map(|job| TrialTask {
                                task_id: job.id,
                                run_id,
                                trial_number: job.slot,
                                config: job.config,
                                datasets: datasets.clone(),
                                resources: resources.clone(),
                            })
                            .collect();
                        dispatcher.run_batch(tasks, &mut complete)
                    }
                }
            };

            if let Err(e) = outcome {
                return Err(ledger.abort(e.into()));
            }
            if !per_completion {
                strategy.update_batch(&feedback);
            }

            info!(
                run_id = %run_id,
                dispatched,
                total = ledger.records.len(),
                "batch finished"
            );
        }

        match final_state {
            RunState::Cancelled => control.status.write().mark_cancelled(),
            _ => control.status.write().mark_completed(),
        }
        let result = ledger.into_result(final_state);
        info!(
            run_id = %run_id,
            trials = result.records.len(),
            succeeded = result.ranking.len(),
            best = ?result.best().and_then(|r| r.score),
            "optimization finished"
        );
        Ok(result)
    }
}

/// Builds the strategy and executor from an [`OptimizationConfig`] and runs
/// them.
pub struct Optimizer {
    config: OptimizationConfig,
    registry: StrategyRegistry,
    workers: Vec<Arc<dyn WorkerClient>>,
    control: RunControl,
    runs: AtomicUsize,
}

impl Optimizer {
    pub fn new(config: OptimizationConfig) -> HtResult<Self> {
        config.validate()?;
        let control = RunControl::new(config.id, config.name.clone())
            .with_max_trials(config.max_trials)
            .with_feedback(config.feedback);
        Ok(Self {
            config,
            registry: StrategyRegistry::default(),
            workers: Vec::new(),
            control,
            runs: AtomicUsize::new(0),
        })
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Remote workers for the distributed executor.
    pub fn with_workers(mut self, workers: Vec<Arc<dyn WorkerClient>>) -> Self {
        self.workers = workers;
        self
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Cancels the run in progress. Every run starts uncancelled.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.control.cancel.clone()
    }

    pub fn status(&self) -> StatusHandle {
        self.control.status.clone()
    }

    pub fn run(
        &self,
        base: &Value,
        space: SearchSpace,
        runner: Arc<dyn TrialRunner>,
        datasets: &DatasetHandles,
        sink: &mut dyn ResultSink,
    ) -> Result<OptimizationResult, ExecutionAborted> {
        self.resume(base, space, runner, datasets, sink, &[])
    }

    /// Like [`run`](Self::run), after replaying `history` into the strategy.
    pub fn resume(
        &self,
        base: &Value,
        space: SearchSpace,
        runner: Arc<dyn TrialRunner>,
        datasets: &DatasetHandles,
        sink: &mut dyn ResultSink,
        history: &[(Sample, f64)],
    ) -> Result<OptimizationResult, ExecutionAborted> {
        // The first run carries the configured id, later ones get their own.
        let run_id = match self.runs.fetch_add(1, Ordering::SeqCst) {
            0 => self.config.id,
            _ => RunId::new_v4(),
        };
        self.control.cancel.reset();
        let control = RunControl {
            run_id,
            ..self.control.clone()
        };

        let prepared = self
            .registry
            .build(&self.config.strategy, space, &self.config)
            .and_then(|strategy| {
                Executor::from_config(&self.config, self.workers.clone()).map(|ex| (strategy, ex))
            });
        let (mut strategy, mut executor) = match prepared {
            Ok(pair) => pair,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "optimization could not start");
                {
                    let mut status = control.status.write();
                    status.restart(run_id, self.config.goal.direction);
                    status.mark_aborted(e.to_string());
                }
                let partial = OptimizationResult::new(
                    run_id,
                    Vec::new(),
                    self.config.goal.direction,
                    RunState::Aborted,
                );
                return Err(ExecutionAborted { error: e, partial });
            }
        };

        if !history.is_empty() {
            info!(trials = history.len(), "warm-starting strategy");
            strategy.warm_start(history);
        }

        executor.execute(
            &control,
            base,
            &mut strategy,
            &self.config.goal,
            runner,
            datasets,
            sink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::WorkerError;
    use crate::search::{GridConfig, GridSearch, RandomConfig, RandomSearch};
    use crate::sink::MemorySink;
    use crate::space::{ParameterValue, Scale};
    use crate::trial::TrialStatus;
    use async_trait::async_trait;
    use ht_types::{MetricsReport, RunnerError, Split, SubstrateError, COMBINED};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    fn base() -> Value {
        json!({"lr": 0.001, "trainer": {"epochs": 3}})
    }

    fn lr_space(steps: usize) -> SearchSpace {
        SearchSpace::new()
            .add_stepped_float("lr", 0.01, 0.1, steps, Scale::Linear)
            .unwrap()
    }

    fn grid(steps: usize) -> GridSearch {
        GridSearch::new(lr_space(steps), &GridConfig::default()).unwrap()
    }

    fn lr_of(record: &TrialRecord) -> f64 {
        record.sample.get("lr").and_then(ParameterValue::as_f64).unwrap()
    }

    /// Loss is `lr * 10`; larger learning rates finish first.
    fn loss_runner() -> Arc<dyn TrialRunner> {
        Arc::new(
            |config: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
                let lr = config["lr"].as_f64().unwrap_or_default();
                std::thread::sleep(Duration::from_millis(((0.1 - lr) * 400.0) as u64));
                Ok(MetricsReport::new().with_metric(COMBINED, Split::Validation, "loss", lr * 10.0))
            },
        )
    }

    fn control(max_trials: Option<usize>) -> RunControl {
        RunControl::new(Uuid::new_v4(), "test").with_max_trials(max_trials)
    }

    /// Counts feedback calls around a grid.
    struct CountingGrid {
        inner: GridSearch,
        updates: usize,
        batch_updates: Vec<usize>,
    }

    impl SearchStrategy for CountingGrid {
        fn sample(&mut self) -> HtResult<Sample> {
            self.inner.sample()
        }

        fn update(&mut self, _sample: &Sample, _score: f64) {
            self.updates += 1;
        }

        fn update_batch(&mut self, pairs: &[(Sample, f64)]) {
            self.batch_updates.push(pairs.len());
        }

        fn finished(&self) -> bool {
            self.inner.finished()
        }

        fn bounded(&self) -> bool {
            true
        }

        fn space(&self) -> &SearchSpace {
            self.inner.space()
        }

        fn drawn(&self) -> usize {
            self.inner.drawn()
        }

        fn name(&self) -> &str {
            "counting-grid"
        }
    }

    struct DeadWorker;

    #[async_trait]
    impl WorkerClient for DeadWorker {
        fn id(&self) -> &str {
            "remote-dead"
        }

        async fn ping(&self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn run_task(&self, _task: TrialTask) -> Result<MetricsReport, WorkerError> {
            Err(WorkerError::Unreachable {
                worker: "remote-dead".into(),
                message: "connection reset by peer".into(),
            })
        }
    }

    #[test]
    fn serial_grid_runs_every_cell() {
        let mut sink = MemorySink::new();
        let control = control(None);
        let result = Executor::serial()
            .execute(
                &control,
                &base(),
                &mut grid(4),
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut sink,
            )
            .unwrap();

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.records.len(), 4);
        assert_eq!(sink.records.len(), 4);
        assert_eq!(sink.final_state, Some(RunState::Completed));
        let numbers: Vec<usize> = result.records.iter().map(|r| r.trial_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert!(result.records.iter().all(|r| r.worker_id.as_deref() == Some("serial")));

        let status = control.status.read();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.trials_succeeded, 4);
        assert_eq!(lr_of(status.best_trial.as_ref().unwrap()), 0.01);
    }

    #[test]
    fn local_parallel_ranks_regardless_of_completion_order() {
        let mut executor = Executor::local_parallel(2).unwrap();
        let mut sink = MemorySink::new();
        let result = executor
            .execute(
                &control(None),
                &base(),
                &mut grid(4),
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut sink,
            )
            .unwrap();

        assert_eq!(result.records.len(), 4);
        let submitted: Vec<f64> = result.records.iter().map(lr_of).collect();
        assert_eq!(submitted[0], 0.01);
        assert_eq!(submitted[3], 0.1);

        let ranked: Vec<f64> = result.ranking.iter().map(lr_of).collect();
        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0], 0.01);
        assert_eq!(ranked[3], 0.1);
        assert!(ranked.windows(2).all(|w| w[0] < w[1]));
        let scores: Vec<f64> = result.ranking.iter().filter_map(|r| r.score).collect();
        assert!(scores.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn maximize_ranks_descending() {
        let goal = SearchGoal::maximize(Default::default());
        let result = Executor::local_parallel(3)
            .unwrap()
            .execute(
                &control(None),
                &base(),
                &mut grid(3),
                &goal,
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap();
        assert_eq!(lr_of(result.best().unwrap()), 0.1);
    }

    #[test]
    fn trial_failures_are_isolated() {
        let runner: Arc<dyn TrialRunner> = Arc::new(
            |config: &Value, datasets: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
                assert_eq!(datasets.validation.as_deref(), Some("valid.csv"));
                let lr = config["lr"].as_f64().unwrap_or_default();
                if lr > 0.09 {
                    panic!("loss exploded");
                }
                if lr > 0.06 {
                    return Err(RunnerError::failed("NaN in gradients"));
                }
                if lr > 0.03 {
                    // Reports the wrong metric.
                    return Ok(MetricsReport::new().with_metric(COMBINED, Split::Validation, "accuracy", 0.5));
                }
                Ok(MetricsReport::new().with_metric(COMBINED, Split::Validation, "loss", lr))
            },
        );
        let mut strategy = CountingGrid {
            inner: grid(4),
            updates: 0,
            batch_updates: Vec::new(),
        };
        let result = Executor::local_parallel(4)
            .unwrap()
            .execute(
                &control(None),
                &base(),
                &mut strategy,
                &SearchGoal::default(),
                runner,
                &DatasetHandles::new().with_validation("valid.csv"),
                &mut MemorySink::new(),
            )
            .unwrap();

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.ranking.len(), 1);
        assert_eq!(result.failed().count(), 3);

        let errors: Vec<&str> = result.records[1..]
            .iter()
            .filter_map(|r| r.error.as_deref())
            .collect();
        assert!(errors[0].contains("metric 'loss'"));
        assert!(errors[1].contains("NaN in gradients"));
        assert!(errors[2].contains("panicked"));
        assert!(result.records[1].report.is_some());

        // Only the successful trial is fed back, once, after the batch.
        assert_eq!(strategy.batch_updates, vec![1]);
        assert_eq!(strategy.updates, 0);
    }

    #[test]
    fn per_completion_feedback() {
        let mut strategy = CountingGrid {
            inner: grid(4),
            updates: 0,
            batch_updates: Vec::new(),
        };
        let control = control(None).with_feedback(FeedbackPolicy::PerCompletion);
        Executor::local_parallel(2)
            .unwrap()
            .execute(
                &control,
                &base(),
                &mut strategy,
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap();
        assert_eq!(strategy.updates, 4);
        assert!(strategy.batch_updates.is_empty());
    }

    #[test]
    fn unbounded_strategy_needs_max_trials() {
        let mut random = RandomSearch::new(lr_space(4), &RandomConfig::default()).unwrap();
        let err = Executor::serial()
            .execute(
                &control(None),
                &base(),
                &mut random,
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap_err();
        assert!(matches!(err.error, HtError::Config(_)));
        assert!(err.partial.records.is_empty());
        assert_eq!(err.partial.state, RunState::Aborted);
    }

    #[test]
    fn max_trials_caps_random_search() {
        let mut random = RandomSearch::new(
            lr_space(4),
            &RandomConfig {
                seed: Some(17),
                ..RandomConfig::default()
            },
        )
        .unwrap();
        let result = Executor::local_parallel(4)
            .unwrap()
            .execute(
                &control(Some(6)),
                &base(),
                &mut random,
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap();
        assert_eq!(result.records.len(), 6);
        assert_eq!(random.drawn(), 6);
    }

    #[test]
    fn bad_paths_abort_before_any_trial() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner: Arc<dyn TrialRunner> = {
            let calls = calls.clone();
            Arc::new(
                move |_: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(MetricsReport::new())
                },
            )
        };
        let space = SearchSpace::new().add_int("optimizer.warmup", 0, 3).unwrap();
        let mut strategy = GridSearch::new(space, &GridConfig::default()).unwrap();
        let err = Executor::serial()
            .execute(
                &control(None),
                &base(),
                &mut strategy,
                &SearchGoal::default(),
                runner,
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap_err();
        assert!(matches!(err.error, HtError::Path(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_stops_between_batches() {
        let cancel = CancelHandle::new();
        let runner: Arc<dyn TrialRunner> = {
            let cancel = cancel.clone();
            Arc::new(
                move |config: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
                    cancel.cancel();
                    let lr = config["lr"].as_f64().unwrap_or_default();
                    Ok(MetricsReport::new().with_metric(COMBINED, Split::Validation, "loss", lr))
                },
            )
        };
        let control = control(None).with_cancel(cancel.clone());
        let mut sink = MemorySink::new();
        let result = Executor::local_parallel(2)
            .unwrap()
            .execute(
                &control,
                &base(),
                &mut grid(6),
                &SearchGoal::default(),
                runner,
                &DatasetHandles::new(),
                &mut sink,
            )
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(result.state, RunState::Cancelled);
        assert_eq!(result.records.len(), 2);
        assert!(result.records.iter().all(|r| r.status == TrialStatus::Succeeded));
        assert_eq!(sink.final_state, Some(RunState::Cancelled));
        assert_eq!(control.status.read().state, RunState::Cancelled);
    }

    #[test]
    fn distributed_falls_back_to_local_workers() {
        let mut executor = Executor::distributed(ClusterConfig::default(), Vec::new(), 2).unwrap();
        assert_eq!(executor.kind(), ExecutorKind::Distributed);
        let result = executor
            .execute(
                &control(None),
                &base(),
                &mut grid(4),
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap();
        assert_eq!(result.records.len(), 4);
        assert_eq!(lr_of(result.best().unwrap()), 0.01);
        assert!(result
            .records
            .iter()
            .all(|r| r.worker_id.as_deref().is_some_and(|w| w.starts_with("local-"))));
    }

    #[test]
    fn losing_every_worker_aborts_with_partial_results() {
        let workers: Vec<Arc<dyn WorkerClient>> = vec![Arc::new(DeadWorker)];
        let mut executor = Executor::distributed(ClusterConfig::default(), workers, 2).unwrap();
        let control = control(None);
        let mut sink = MemorySink::new();
        let err = executor
            .execute(
                &control,
                &base(),
                &mut grid(4),
                &SearchGoal::default(),
                loss_runner(),
                &DatasetHandles::new(),
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(
            err.error,
            HtError::Substrate(SubstrateError::ClusterUnreachable { .. })
        ));
        assert_eq!(err.partial.records.len(), 2);
        assert!(err
            .partial
            .records
            .iter()
            .all(|r| r.status == TrialStatus::Failed));
        assert_eq!(sink.records.len(), 2);
        assert_eq!(sink.final_state, Some(RunState::Aborted));
        assert_eq!(control.status.read().state, RunState::Aborted);
    }

    #[test]
    fn optimizer_runs_from_config() {
        let config: OptimizationConfig = serde_json::from_value(json!({
            "name": "lr_sweep",
            "strategy": "grid",
            "executor": "local-parallel",
            "concurrency": 2,
            "goal": {"direction": "minimize", "target": "combined", "metric": "loss"}
        }))
        .unwrap();
        let optimizer = Optimizer::new(config).unwrap();
        let mut sink = MemorySink::new();
        let result = optimizer
            .run(&base(), lr_space(4), loss_runner(), &DatasetHandles::new(), &mut sink)
            .unwrap();
        assert_eq!(result.records.len(), 4);
        assert_eq!(optimizer.status().read().trials_succeeded, 4);
        assert_eq!(result.run_id, optimizer.config().id);
    }

    #[test]
    fn optimizer_resume_skips_finished_cells() {
        let optimizer = Optimizer::new(OptimizationConfig::new("resume", "grid")).unwrap();
        let first = optimizer
            .run(&base(), lr_space(4), loss_runner(), &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap();
        let done: Vec<(Sample, f64)> = first.history().into_iter().take(3).collect();

        let resumed = optimizer
            .resume(
                &base(),
                lr_space(4),
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
                &done,
            )
            .unwrap();
        assert_eq!(resumed.records.len(), 1);
        assert_eq!(lr_of(&resumed.records[0]), 0.1);
    }

    #[test]
    fn optimizer_reports_startup_errors() {
        let config = OptimizationConfig::new("bad", "random").with_max_trials(3);
        let optimizer = Optimizer::new(config).unwrap();
        let declared = SearchSpace::new().add_float("lr", 0.01, 0.1).unwrap();
        let mut random_config = optimizer.config().clone();
        random_config.random.replacement = false;

        let optimizer = Optimizer::new(random_config).unwrap();
        let err = optimizer
            .run(&base(), declared, loss_runner(), &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap_err();
        assert!(matches!(err.error, HtError::Config(_)));
        assert_eq!(optimizer.status().read().state, RunState::Aborted);
    }

    #[test]
    fn optimizer_runs_twice_with_fresh_status() {
        let optimizer = Optimizer::new(OptimizationConfig::new("again", "grid")).unwrap();
        let first = optimizer
            .run(&base(), lr_space(4), loss_runner(), &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap();
        let second = optimizer
            .run(&base(), lr_space(4), loss_runner(), &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap();

        assert_eq!(second.records.len(), 4);
        assert_ne!(first.run_id, second.run_id);
        let status = optimizer.status();
        let status = status.read();
        assert_eq!(status.id, second.run_id);
        assert_eq!(status.trials_dispatched, 4);
        assert_eq!(status.trials_succeeded, 4);
        assert_eq!(status.trials_failed, 0);
        assert_eq!(status.state, RunState::Completed);
    }

    #[test]
    fn cancelled_run_does_not_cancel_the_next() {
        let optimizer = Optimizer::new(OptimizationConfig::new("cancel", "grid")).unwrap();
        let cancel = optimizer.cancel_handle();
        let cancelling: Arc<dyn TrialRunner> = Arc::new(
            move |_: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
                cancel.cancel();
                Ok(MetricsReport::new().with_metric(COMBINED, Split::Validation, "loss", 1.0))
            },
        );
        let first = optimizer
            .run(&base(), lr_space(4), cancelling, &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap();
        assert_eq!(first.state, RunState::Cancelled);
        assert!(first.records.len() < 4);

        let second = optimizer
            .run(&base(), lr_space(4), loss_runner(), &DatasetHandles::new(), &mut MemorySink::new())
            .unwrap();
        assert_eq!(second.state, RunState::Completed);
        assert_eq!(second.records.len(), 4);
        assert!(!optimizer.cancel_handle().is_cancelled());
    }

    #[test]
    fn optimizer_samples_full_width_seed() {
        let optimizer =
            Optimizer::new(OptimizationConfig::new("seeds", "random").with_max_trials(2)).unwrap();
        let space = SearchSpace::new().add_int("seed", 0, i64::MAX).unwrap();
        let result = optimizer
            .run(
                &json!({"lr": 0.05, "seed": 0}),
                space,
                loss_runner(),
                &DatasetHandles::new(),
                &mut MemorySink::new(),
            )
            .unwrap();
        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.records.len(), 2);
        assert!(result
            .records
            .iter()
            .all(|r| r.status == TrialStatus::Succeeded));
    }
}
