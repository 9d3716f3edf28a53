//! # ht-optimizer
//!
//! Hyper-parameter search orchestration for HyperTune.
//!
//! Provides search space definitions, search strategies (grid, random,
//! adaptive), configuration merging, score extraction and ranking, and the
//! control loop that runs trials serially, on a local thread pool or across
//! cluster workers.

mod aggregate;
mod distributed;
mod executor;
mod merge;
mod pool;
mod registry;
mod runner;
mod search;
mod sink;
mod space;
mod trial;

pub use aggregate::{extract_score, rank, ScoreSelector};
pub use distributed::{
    Assignment, ClusterConfig, ClusterDispatcher, LocalWorker, TrialTask, WorkerAllocation,
    WorkerClient, WorkerError, WorkerResources,
};
pub use executor::{
    CancelHandle, ExecutionAborted, Executor, Optimizer, RunControl, StatusHandle,
};
pub use merge::{merge, validate_paths};
pub use pool::{Completion, Job, LocalPool};
pub use registry::{ExecutorKind, StrategyBuilder, StrategyRegistry};
pub use runner::{DatasetHandles, TrialRunner};
pub use search::{
    AdaptiveConfig, AdaptiveSearch, GridConfig, GridSearch, RandomConfig, RandomSearch,
    SearchStrategy, Strategy,
};
pub use sink::{JsonLinesSink, MemorySink, NullSink, ResultSink};
pub use space::{ParameterKind, ParameterSpec, ParameterValue, Sample, Scale, SearchSpace};
pub use trial::{
    FeedbackPolicy, ObjectiveDirection, OptimizationConfig, OptimizationResult, RunId, RunState,
    RunStatus, SearchGoal, TrialRecord, TrialStatus,
};

pub use ht_types::{HtError, HtResult, MetricsReport, Split, COMBINED};
