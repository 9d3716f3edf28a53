//! Trial tracking and optimization run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

use ht_types::{config_error, HtError, HtResult, MetricsReport};

use crate::aggregate::{rank, ScoreSelector};
use crate::distributed::ClusterConfig;
use crate::registry::{ExecutorKind, StrategyRegistry};
use crate::search::{AdaptiveConfig, GridConfig, RandomConfig};
use crate::space::Sample;

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Strictly better; ties keep the incumbent.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

impl FromStr for ObjectiveDirection {
    type Err = HtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maximize" | "max" => Ok(Self::Maximize),
            "minimize" | "min" => Ok(Self::Minimize),
            other => Err(config_error!("unknown goal '{other}', expected minimize or maximize")),
        }
    }
}

/// Direction plus the score the direction applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchGoal {
    pub direction: ObjectiveDirection,
    #[serde(flatten)]
    pub selector: ScoreSelector,
}

impl SearchGoal {
    pub fn minimize(selector: ScoreSelector) -> Self {
        Self {
            direction: ObjectiveDirection::Minimize,
            selector,
        }
    }

    pub fn maximize(selector: ScoreSelector) -> Self {
        Self {
            direction: ObjectiveDirection::Maximize,
            selector,
        }
    }
}

/// When completed trials are fed back into the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackPolicy {
    /// One `update_batch` after every member of a batch has finished.
    PerBatch,
    /// `update` as each trial completes.
    PerCompletion,
}

impl Default for FeedbackPolicy {
    fn default() -> Self {
        Self::PerBatch
    }
}

/// Top-level configuration for an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub id: RunId,
    pub name: String,

    /// Which search strategy to use: "grid", "random", or "bayesian".
    pub strategy: String,

    pub executor: ExecutorKind,

    pub goal: SearchGoal,

    /// Maximum number of trials to run. Required unless the strategy is finite.
    pub max_trials: Option<usize>,

    /// How many trials to run in parallel.
    pub concurrency: usize,

    pub feedback: FeedbackPolicy,

    pub grid: GridConfig,
    pub random: RandomConfig,
    pub bayesian: AdaptiveConfig,

    pub cluster: ClusterConfig,

    pub created_at: DateTime<Utc>,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "hyperopt".to_string(),
            strategy: "random".to_string(),
            executor: ExecutorKind::Serial,
            goal: SearchGoal::default(),
            max_trials: None,
            concurrency: 4,
            feedback: FeedbackPolicy::PerBatch,
            grid: GridConfig::default(),
            random: RandomConfig::default(),
            bayesian: AdaptiveConfig::default(),
            cluster: ClusterConfig::default(),
            created_at: Utc::now(),
        }
    }
}

impl OptimizationConfig {
    pub fn new(name: impl Into<String>, strategy: &str) -> Self {
        Self {
            name: name.into(),
            strategy: strategy.to_string(),
            ..Self::default()
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = Some(n);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_goal(mut self, goal: SearchGoal) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackPolicy) -> Self {
        self.feedback = feedback;
        self
    }

    /// Seed both random-family strategies.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random.seed = Some(seed);
        self.bayesian.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> HtResult<()> {
        StrategyRegistry::default().validate(&self.strategy)?;
        if self.concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        if self.max_trials == Some(0) {
            return Err(config_error!("max_trials must be at least 1 when set"));
        }
        self.grid.validate()?;
        self.bayesian.validate()?;
        self.cluster.validate()?;
        Ok(())
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Aborted,
}

/// Aggregate status of an optimization run, readable while it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub name: String,
    pub direction: ObjectiveDirection,
    pub state: RunState,
    pub trials_dispatched: usize,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    pub best_trial: Option<TrialRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(id: RunId, name: impl Into<String>, direction: ObjectiveDirection) -> Self {
        Self {
            id,
            name: name.into(),
            direction,
            state: RunState::Pending,
            trials_dispatched: 0,
            trials_succeeded: 0,
            trials_failed: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Start over as a fresh run, keeping only the name.
    pub fn restart(&mut self, id: RunId, direction: ObjectiveDirection) {
        let name = std::mem::take(&mut self.name);
        *self = Self::new(id, name, direction);
        self.mark_running();
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.state = RunState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_aborted(&mut self, error: String) {
        self.state = RunState::Aborted;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn trials_running(&self) -> usize {
        self.trials_dispatched
            .saturating_sub(self.trials_succeeded + self.trials_failed)
    }

    /// Count a finalized record and keep the best one.
    pub fn record(&mut self, record: &TrialRecord) {
        match record.status {
            TrialStatus::Succeeded => self.trials_succeeded += 1,
            TrialStatus::Failed => self.trials_failed += 1,
            TrialStatus::Pending | TrialStatus::Running => return,
        }
        let Some(score) = record.score else {
            return;
        };
        let improves = match self.best_trial.as_ref().and_then(|b| b.score) {
            None => true,
            Some(best) => self.direction.improves(score, best),
        };
        if improves {
            self.best_trial = Some(record.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// A single trial: one sample evaluated by the trial runner.
///
/// Transition methods return `false` and leave the record untouched once it
/// has succeeded or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    pub run_id: RunId,
    pub trial_number: usize,
    pub sample: Sample,
    pub score: Option<f64>,
    pub report: Option<MetricsReport>,
    pub status: TrialStatus,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    pub fn new(run_id: RunId, trial_number: usize, sample: Sample) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            trial_number,
            sample,
            score: None,
            report: None,
            status: TrialStatus::Pending,
            error: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = worker_id;
        true
    }

    pub fn mark_succeeded(&mut self, score: f64, report: MetricsReport) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TrialStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.score = Some(score);
        self.report = Some(report);
        true
    }

    /// Fail the trial. A report that was produced but could not be scored is
    /// kept for inspection.
    pub fn mark_failed(&mut self, error: impl ToString) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.to_string());
        true
    }

    pub fn attach_report(&mut self, report: MetricsReport) {
        if !self.status.is_terminal() {
            self.report = Some(report);
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// One flat key/value row: `trial_number`, `status`, `score`, `error`,
    /// `sample.<name>` and `metric.<target>.<split>.<metric>`.
    pub fn to_flat(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("trial_number".into(), Value::from(self.trial_number));
        row.insert("status".into(), Value::from(self.status.as_str()));
        row.insert(
            "score".into(),
            self.score
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
        );
        row.insert(
            "error".into(),
            self.error.clone().map_or(Value::Null, Value::String),
        );
        for (name, value) in self.sample.iter() {
            row.insert(format!("sample.{name}"), value.to_json());
        }
        if let Some(report) = &self.report {
            for (target, split, metric, value) in report.iter() {
                row.insert(
                    format!("metric.{target}.{split}.{metric}"),
                    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number),
                );
            }
        }
        row
    }
}

/// Everything an optimization run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub run_id: RunId,
    pub state: RunState,
    pub direction: ObjectiveDirection,
    /// Every record, in submission order.
    pub records: Vec<TrialRecord>,
    /// Succeeded records, best first.
    pub ranking: Vec<TrialRecord>,
}

impl OptimizationResult {
    pub fn new(
        run_id: RunId,
        records: Vec<TrialRecord>,
        direction: ObjectiveDirection,
        state: RunState,
    ) -> Self {
        let ranking = rank(&records, direction);
        Self {
            run_id,
            state,
            direction,
            records,
            ranking,
        }
    }

    pub fn best(&self) -> Option<&TrialRecord> {
        self.ranking.first()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records
            .iter()
            .filter(|r| r.status == TrialStatus::Failed)
    }

    /// Scored samples, in submission order, for warm-starting a later run.
    pub fn history(&self) -> Vec<(Sample, f64)> {
        self.records
            .iter()
            .filter(|r| r.status == TrialStatus::Succeeded)
            .filter_map(|r| r.score.map(|s| (r.sample.clone(), s)))
            .collect()
    }
}
