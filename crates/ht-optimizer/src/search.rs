//! Parameter sweep strategies.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use ht_types::{config_error, ExhaustionError, HtResult};

use crate::space::{ParameterKind, ParameterSpec, ParameterValue, Sample, Scale, SearchSpace};
use crate::trial::ObjectiveDirection;

/// Largest grid a without-replacement random search will shuffle.
const MAX_PERMUTATION: usize = 1 << 24;

/// Common trait for all search strategies.
///
/// Strategies are owned by the executor's control thread; nothing here needs
/// to be `Sync`.
pub trait SearchStrategy: Send {
    /// Next assignment, or `ExhaustionError` once [`finished`](Self::finished).
    fn sample(&mut self) -> HtResult<Sample>;

    /// Up to `count` assignments. Shorter only when the strategy runs out.
    fn sample_batch(&mut self, count: usize) -> HtResult<Vec<Sample>> {
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count && !self.finished() {
            batch.push(self.sample()?);
        }
        Ok(batch)
    }

    /// Report a completed trial so adaptive strategies can learn.
    fn update(&mut self, _sample: &Sample, _score: f64) {}

    fn update_batch(&mut self, pairs: &[(Sample, f64)]) {
        for (sample, score) in pairs {
            self.update(sample, *score);
        }
    }

    /// Replay results from an earlier run before sampling resumes.
    fn warm_start(&mut self, history: &[(Sample, f64)]) {
        self.update_batch(history);
    }

    /// True once no further samples can be produced. Never reverts.
    fn finished(&self) -> bool;

    /// Whether the strategy is guaranteed to finish on its own.
    fn bounded(&self) -> bool;

    /// Space the samples are drawn from.
    fn space(&self) -> &SearchSpace;

    /// Samples handed out so far.
    fn drawn(&self) -> usize;

    /// Registry key of this strategy.
    fn name(&self) -> &str;
}

/// Mixed-radix view over the Cartesian product of per-parameter grid points.
///
/// Cell `i` is decoded row-major: the last declared parameter varies fastest.
/// Points are computed per cell, so wide integer ranges cost nothing up front.
#[derive(Debug, Clone)]
struct Lattice {
    axes: Vec<(ParameterSpec, usize)>,
    default_steps: usize,
    total: usize,
}

impl Lattice {
    fn new(space: &SearchSpace, default_steps: usize) -> HtResult<Self> {
        let total = space.grid_size(default_steps).ok_or_else(|| {
            config_error!("grid over {} parameters overflows usize", space.len())
        })?;
        let axes = space
            .parameters()
            .iter()
            .map(|p| (p.clone(), p.grid_len(default_steps).unwrap_or(0)))
            .collect();
        Ok(Self {
            axes,
            default_steps,
            total,
        })
    }

    fn cell(&self, index: usize) -> Sample {
        let mut sample = Sample::new();
        let mut rest = index;
        for (spec, len) in self.axes.iter().rev() {
            if let Some(value) = spec.grid_point(rest % len, self.default_steps) {
                sample.insert(spec.name(), value);
            }
            rest /= len;
        }
        sample
    }

    /// Inverse of [`cell`](Self::cell); `None` for samples off the grid.
    fn index_of(&self, sample: &Sample) -> Option<usize> {
        if sample.len() != self.axes.len() {
            return None;
        }
        let mut index: usize = 0;
        for (spec, len) in &self.axes {
            let value = sample.get(spec.name())?;
            let position = spec.grid_index(value, self.default_steps)?;
            index = index.checked_mul(*len)?.checked_add(position)?;
        }
        (index < self.total).then_some(index)
    }
}

fn seeded_rng(seed: Option<u64>) -> (ChaCha8Rng, u64) {
    let seed = seed.unwrap_or_else(rand::random);
    (ChaCha8Rng::seed_from_u64(seed), seed)
}

fn exhausted(strategy: &str, drawn: usize) -> ExhaustionError {
    ExhaustionError {
        strategy: strategy.to_string(),
        drawn,
    }
}

/// Uniform draw from `[low, high]` that stays finite for any finite bounds.
fn blend(rng: &mut ChaCha8Rng, low: f64, high: f64) -> f64 {
    let t: f64 = rng.random_range(0.0..=1.0);
    (low * (1.0 - t) + high * t).clamp(low, high)
}

/// Draw one value uniformly (or by declared weights) from a parameter's domain.
pub(crate) fn draw_value(spec: &ParameterSpec, rng: &mut ChaCha8Rng) -> ParameterValue {
    match spec.kind() {
        ParameterKind::Categorical { values, weights } => {
            let idx = match weights.as_ref().map(WeightedIndex::new) {
                Some(Ok(dist)) => dist.sample(rng),
                _ => rng.random_range(0..values.len()),
            };
            ParameterValue::Json(values[idx].clone())
        }
        ParameterKind::Continuous {
            low, steps: Some(steps), ..
        } => spec
            .grid_point(rng.random_range(0..*steps), 1)
            .unwrap_or(ParameterValue::Float(*low)),
        ParameterKind::Integer {
            low, steps: Some(steps), ..
        } => spec
            .grid_point(rng.random_range(0..*steps), 1)
            .unwrap_or(ParameterValue::Int(*low)),
        ParameterKind::Continuous {
            low, high, scale, ..
        } => ParameterValue::Float(match scale {
            Scale::Linear => blend(rng, *low, *high),
            Scale::Log => blend(rng, low.ln(), high.ln()).exp().clamp(*low, *high),
        }),
        ParameterKind::Integer {
            low, high, scale, ..
        } => ParameterValue::Int(match scale {
            Scale::Linear => rng.random_range(*low..=*high),
            Scale::Log => {
                let drawn = blend(rng, (*low as f64).ln(), (*high as f64).ln()).exp();
                (drawn.round() as i64).clamp(*low, *high)
            }
        }),
    }
}

// ---- Grid search ----

/// Grid strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Points per continuous dimension declared without `steps`.
    pub default_steps: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { default_steps: 5 }
    }
}

impl GridConfig {
    pub fn validate(&self) -> HtResult<()> {
        if self.default_steps == 0 {
            return Err(config_error!("grid default_steps must be at least 1"));
        }
        Ok(())
    }
}

/// Exhaustive grid search over discretized parameter combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SearchSpace,
    lattice: Lattice,
    cursor: usize,
    drawn: usize,
    completed: HashSet<usize>,
}

impl GridSearch {
    pub fn new(space: SearchSpace, config: &GridConfig) -> HtResult<Self> {
        config.validate()?;
        let lattice = Lattice::new(&space, config.default_steps)?;
        debug!(cells = lattice.total, "grid search initialised");
        Ok(Self {
            space,
            lattice,
            cursor: 0,
            drawn: 0,
            completed: HashSet::new(),
        })
    }

    /// Total number of grid cells.
    pub fn len(&self) -> usize {
        self.lattice.total
    }

    pub fn is_empty(&self) -> bool {
        self.lattice.total == 0
    }

    /// Cells not yet handed out (excluding ones completed in a previous run).
    pub fn remaining(&self) -> usize {
        let skipped = self.completed.iter().filter(|i| **i >= self.cursor).count();
        self.lattice.total - self.cursor - skipped
    }

    fn skip_completed(&mut self) {
        while self.cursor < self.lattice.total && self.completed.contains(&self.cursor) {
            self.cursor += 1;
        }
    }
}

impl SearchStrategy for GridSearch {
    fn sample(&mut self) -> HtResult<Sample> {
        if self.finished() {
            return Err(exhausted(self.name(), self.drawn).into());
        }
        let sample = self.lattice.cell(self.cursor);
        self.space.validate(&sample)?;
        self.cursor += 1;
        self.drawn += 1;
        self.skip_completed();
        Ok(sample)
    }

    fn warm_start(&mut self, history: &[(Sample, f64)]) {
        let lattice = &self.lattice;
        self.completed
            .extend(history.iter().filter_map(|(sample, _)| lattice.index_of(sample)));
        self.skip_completed();
    }

    fn finished(&self) -> bool {
        self.cursor >= self.lattice.total
    }

    fn bounded(&self) -> bool {
        true
    }

    fn space(&self) -> &SearchSpace {
        &self.space
    }

    fn drawn(&self) -> usize {
        self.drawn
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Random strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    /// RNG seed; a random seed is chosen (and logged) when absent.
    pub seed: Option<u64>,
    /// Stop after this many samples. Unbounded when absent.
    pub max_samples: Option<usize>,
    /// Draw with replacement. `false` walks a shuffled grid and needs every
    /// dimension to be discrete.
    pub replacement: bool,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_samples: None,
            replacement: true,
        }
    }
}

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
    seed: u64,
    max_samples: Option<usize>,
    permutation: Option<(Lattice, Vec<usize>)>,
    drawn: usize,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, config: &RandomConfig) -> HtResult<Self> {
        let (mut rng, seed) = seeded_rng(config.seed);

        let permutation = if config.replacement {
            None
        } else {
            if !space.is_discrete() {
                return Err(config_error!(
                    "sampling without replacement needs steps on every float parameter"
                ));
            }
            match space.grid_size(1) {
                Some(cells) if cells <= MAX_PERMUTATION => {}
                Some(cells) => {
                    return Err(config_error!(
                        "{cells} grid cells is too many to sample without replacement"
                    ))
                }
                None => {
                    return Err(config_error!(
                        "grid over {} parameters overflows usize",
                        space.len()
                    ))
                }
            }
            let lattice = Lattice::new(&space, 1)?;
            let mut order: Vec<usize> = (0..lattice.total).collect();
            order.shuffle(&mut rng);
            Some((lattice, order))
        };

        debug!(seed, replacement = config.replacement, "random search initialised");
        Ok(Self {
            space,
            rng,
            seed,
            max_samples: config.max_samples,
            permutation,
            drawn: 0,
        })
    }

    /// Effective RNG seed, for reproducing a run.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn sample_one(&mut self) -> Sample {
        let mut sample = Sample::new();
        for param in self.space.parameters() {
            sample.insert(param.name(), draw_value(param, &mut self.rng));
        }
        sample
    }
}

impl SearchStrategy for RandomSearch {
    fn sample(&mut self) -> HtResult<Sample> {
        if self.finished() {
            return Err(exhausted(self.name(), self.drawn).into());
        }
        let sample = match &self.permutation {
            Some((lattice, order)) => lattice.cell(order[self.drawn]),
            None => self.sample_one(),
        };
        self.space.validate(&sample)?;
        self.drawn += 1;
        Ok(sample)
    }

    fn finished(&self) -> bool {
        let over_budget = self.max_samples.is_some_and(|max| self.drawn >= max);
        let spent = self
            .permutation
            .as_ref()
            .is_some_and(|(_, order)| self.drawn >= order.len());
        over_budget || spent
    }

    fn bounded(&self) -> bool {
        self.max_samples.is_some() || self.permutation.is_some()
    }

    fn space(&self) -> &SearchSpace {
        &self.space
    }

    fn drawn(&self) -> usize {
        self.drawn
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Adaptive (Bayesian-style) search ----

/// Adaptive strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub seed: Option<u64>,
    pub max_samples: Option<usize>,
    /// Probability of a pure exploration draw once feedback exists.
    pub exploration_weight: f64,
    /// Perturbation size as a fraction of each parameter's range.
    pub perturbation_scale: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_samples: None,
            exploration_weight: 0.3,
            perturbation_scale: 0.1,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> HtResult<()> {
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(config_error!(
                "exploration_weight {} must lie in [0, 1]",
                self.exploration_weight
            ));
        }
        if !(self.perturbation_scale > 0.0 && self.perturbation_scale <= 1.0) {
            return Err(config_error!(
                "perturbation_scale {} must lie in (0, 1]",
                self.perturbation_scale
            ));
        }
        Ok(())
    }
}

/// Adaptive optimization that biases sampling toward the best observation.
///
/// Tracks observed (sample, score) pairs. With probability
/// `exploration_weight` (and always before any feedback) it draws a fresh
/// random sample; otherwise it perturbs the best-scoring sample so far.
#[derive(Debug, Clone)]
pub struct AdaptiveSearch {
    space: SearchSpace,
    config: AdaptiveConfig,
    direction: ObjectiveDirection,
    rng: ChaCha8Rng,
    observations: Vec<(Sample, f64)>,
    drawn: usize,
}

impl AdaptiveSearch {
    pub fn new(
        space: SearchSpace,
        config: &AdaptiveConfig,
        direction: ObjectiveDirection,
    ) -> HtResult<Self> {
        config.validate()?;
        let (rng, seed) = seeded_rng(config.seed);
        debug!(seed, ?direction, "adaptive search initialised");
        Ok(Self {
            space,
            config: config.clone(),
            direction,
            rng,
            observations: Vec::new(),
            drawn: 0,
        })
    }

    pub fn observations(&self) -> &[(Sample, f64)] {
        &self.observations
    }

    /// Best observation so far according to the goal direction.
    pub fn best(&self) -> Option<&(Sample, f64)> {
        let by_score = |a: &&(Sample, f64), b: &&(Sample, f64)| a.1.total_cmp(&b.1);
        match self.direction {
            ObjectiveDirection::Maximize => self.observations.iter().max_by(by_score),
            ObjectiveDirection::Minimize => self.observations.iter().min_by(by_score),
        }
    }

    /// Pure exploration sample.
    fn explore(&mut self) -> Sample {
        let mut sample = Sample::new();
        for param in self.space.parameters() {
            sample.insert(param.name(), draw_value(param, &mut self.rng));
        }
        sample
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self) -> Sample {
        let base = match self.best() {
            Some((sample, _)) => sample.clone(),
            None => return self.explore(),
        };

        let scale = self.config.perturbation_scale;
        let mut perturbed = Sample::new();
        for param in self.space.parameters() {
            let value = match base.get(param.name()) {
                Some(current) => perturb(param, current, scale, &mut self.rng),
                None => draw_value(param, &mut self.rng),
            };
            perturbed.insert(param.name(), value);
        }
        perturbed
    }
}

/// Move `current` a small random distance within `spec`'s domain.
fn perturb(
    spec: &ParameterSpec,
    current: &ParameterValue,
    scale: f64,
    rng: &mut ChaCha8Rng,
) -> ParameterValue {
    if let ParameterKind::Categorical { .. } = spec.kind() {
        return if rng.random::<f64>() < scale {
            draw_value(spec, rng)
        } else {
            current.clone()
        };
    }

    // Stepped dimensions walk along their grid points.
    if spec.is_stepped() {
        let (Some(target), Some(len)) = (current.as_f64(), spec.grid_len(1)) else {
            return draw_value(spec, rng);
        };
        let nearest = spec.nearest_index(target, 1).unwrap_or(0);
        let reach = ((scale * len as f64).round() as usize).max(1);
        let offset = rng.random_range(0..=reach.saturating_mul(2));
        let shifted = nearest
            .saturating_add(offset)
            .saturating_sub(reach)
            .min(len.saturating_sub(1));
        return spec
            .grid_point(shifted, 1)
            .unwrap_or_else(|| current.clone());
    }

    match (spec.kind(), current) {
        (
            ParameterKind::Continuous {
                low, high, scale: Scale::Linear, ..
            },
            ParameterValue::Float(v),
        ) => {
            // Half the span stays finite even when the full span does not.
            let half_noise = rng.random_range(-scale..=scale) * (high / 2.0 - low / 2.0);
            ParameterValue::Float((v + half_noise + half_noise).clamp(*low, *high))
        }
        (
            ParameterKind::Continuous {
                low, high, scale: Scale::Log, ..
            },
            ParameterValue::Float(v),
        ) => {
            let log_range = high.ln() - low.ln();
            let noise = rng.random_range(-scale..=scale) * log_range;
            ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
        }
        (ParameterKind::Integer { low, high, .. }, ParameterValue::Int(v)) => {
            let span = (i128::from(*high) - i128::from(*low)) as f64;
            let reach = ((scale * span).round() as i64).max(1);
            let delta: i64 = rng.random_range(-reach..=reach);
            ParameterValue::Int(v.saturating_add(delta).clamp(*low, *high))
        }
        _ => draw_value(spec, rng),
    }
}

impl SearchStrategy for AdaptiveSearch {
    fn sample(&mut self) -> HtResult<Sample> {
        if self.finished() {
            return Err(exhausted(self.name(), self.drawn).into());
        }
        let explore =
            self.observations.is_empty() || self.rng.random::<f64>() < self.config.exploration_weight;
        let sample = if explore { self.explore() } else { self.exploit() };
        self.space.validate(&sample)?;
        self.drawn += 1;
        Ok(sample)
    }

    fn update(&mut self, sample: &Sample, score: f64) {
        if score.is_finite() {
            self.observations.push((sample.clone(), score));
        }
    }

    fn finished(&self) -> bool {
        self.config
            .max_samples
            .is_some_and(|max| self.drawn >= max)
    }

    fn bounded(&self) -> bool {
        self.config.max_samples.is_some()
    }

    fn space(&self) -> &SearchSpace {
        &self.space
    }

    fn drawn(&self) -> usize {
        self.drawn
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

// ---- Closed dispatch ----

/// Every strategy the registry can build.
#[derive(Debug, Clone)]
pub enum Strategy {
    Grid(GridSearch),
    Random(RandomSearch),
    Adaptive(AdaptiveSearch),
}

macro_rules! delegate {
    ($self:ident, $s:ident => $body:expr) => {
        match $self {
            Strategy::Grid($s) => $body,
            Strategy::Random($s) => $body,
            Strategy::Adaptive($s) => $body,
        }
    };
}

impl SearchStrategy for Strategy {
    fn sample(&mut self) -> HtResult<Sample> {
        delegate!(self, s => s.sample())
    }

    fn sample_batch(&mut self, count: usize) -> HtResult<Vec<Sample>> {
        delegate!(self, s => s.sample_batch(count))
    }

    fn update(&mut self, sample: &Sample, score: f64) {
        delegate!(self, s => s.update(sample, score))
    }

    fn update_batch(&mut self, pairs: &[(Sample, f64)]) {
        delegate!(self, s => s.update_batch(pairs))
    }

    fn warm_start(&mut self, history: &[(Sample, f64)]) {
        delegate!(self, s => s.warm_start(history))
    }

    fn finished(&self) -> bool {
        delegate!(self, s => s.finished())
    }

    fn bounded(&self) -> bool {
        delegate!(self, s => s.bounded())
    }

    fn space(&self) -> &SearchSpace {
        delegate!(self, s => s.space())
    }

    fn drawn(&self) -> usize {
        delegate!(self, s => s.drawn())
    }

    fn name(&self) -> &str {
        delegate!(self, s => s.name())
    }
}
