//! Search space definitions and domain validation.

use ht_types::{DomainError, HtError, HtResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative tolerance used when checking grid alignment of float values.
const ALIGN_TOLERANCE: f64 = 1e-9;

/// Spacing of discretized numeric points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Linear,
    Log,
}

impl Default for Scale {
    fn default() -> Self {
        Self::Linear
    }
}

/// Describes the domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous range [low, high], optionally restricted to `steps` points.
    Continuous {
        low: f64,
        high: f64,
        steps: Option<usize>,
        scale: Scale,
    },
    /// Integer range [low, high] inclusive, optionally restricted to `steps` points.
    Integer {
        low: i64,
        high: i64,
        steps: Option<usize>,
        scale: Scale,
    },
    /// Categorical choices with optional sampling weights.
    Categorical {
        values: Vec<serde_json::Value>,
        weights: Option<Vec<f64>>,
    },
}

impl ParameterKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Continuous { .. } => "float",
            Self::Integer { .. } => "int",
            Self::Categorical { .. } => "category",
        }
    }
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    /// JSON form written into resolved configurations.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }

    fn kind_label(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Json(_) => "json",
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One hyper-parameter assignment: parameter path → value.
///
/// Keys are kept sorted so that serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample(BTreeMap<String, ParameterValue>);

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string identity, used to detect repeated samples.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl FromIterator<(String, ParameterValue)> for Sample {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single parameter dimension in the search space.
///
/// Fields are private so a constructed spec always satisfies its invariants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    name: String,
    kind: ParameterKind,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Result<Self, DomainError> {
        let spec = Self {
            name: name.into(),
            kind,
        };
        spec.check()?;
        Ok(spec)
    }

    /// Dotted path into the base configuration (e.g. "trainer.learning_rate").
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    fn invalid(&self, message: impl Into<String>) -> DomainError {
        DomainError::InvalidSpec {
            parameter: self.name.clone(),
            message: message.into(),
        }
    }

    fn check(&self) -> Result<(), DomainError> {
        if self.name.is_empty() || self.name.split('.').any(str::is_empty) {
            return Err(self.invalid("name must be a dotted path of non-empty segments"));
        }
        match &self.kind {
            ParameterKind::Continuous {
                low,
                high,
                steps,
                scale,
            } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(self.invalid("bounds must be finite"));
                }
                check_bounds(self, *low, *high, *steps, *scale)
            }
            ParameterKind::Integer {
                low,
                high,
                steps,
                scale,
            } => {
                check_bounds(self, *low as f64, *high as f64, *steps, *scale)?;
                if let Some(steps) = steps {
                    // Gaps only widen along the axis, so once two raw points
                    // are a full unit apart no later pair can round together.
                    let raw = |i| step_point(*low as f64, *high as f64, *steps, *scale, i);
                    for i in 1..*steps {
                        let (a, b) = (raw(i - 1), raw(i));
                        if a.round() == b.round() {
                            return Err(self.invalid(format!(
                                "{steps} steps collapse onto duplicate integers"
                            )));
                        }
                        if b - a >= 1.0 {
                            break;
                        }
                    }
                }
                Ok(())
            }
            ParameterKind::Categorical { values, weights } => {
                if values.is_empty() {
                    return Err(self.invalid("categorical values cannot be empty"));
                }
                if let Some(weights) = weights {
                    if weights.len() != values.len() {
                        return Err(self.invalid(format!(
                            "{} weights for {} values",
                            weights.len(),
                            values.len()
                        )));
                    }
                    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                        return Err(self.invalid("weights must be finite and non-negative"));
                    }
                    if weights.iter().sum::<f64>() <= 0.0 {
                        return Err(self.invalid("weights must have a positive sum"));
                    }
                }
                Ok(())
            }
        }
    }

    /// Whether this dimension has a declared discretization.
    ///
    /// Categorical parameters and stepped numeric parameters are discrete;
    /// unstepped numeric parameters are not.
    pub fn is_stepped(&self) -> bool {
        match &self.kind {
            ParameterKind::Continuous { steps, .. } | ParameterKind::Integer { steps, .. } => {
                steps.is_some()
            }
            ParameterKind::Categorical { .. } => true,
        }
    }

    /// Number of grid cells along this dimension. `None` when the count does
    /// not fit in `usize`.
    pub fn grid_len(&self, default_steps: usize) -> Option<usize> {
        match &self.kind {
            ParameterKind::Continuous { steps, .. } => Some(steps.unwrap_or(default_steps.max(1))),
            ParameterKind::Integer {
                low,
                high,
                steps: None,
                ..
            } => usize::try_from(i128::from(*high) - i128::from(*low) + 1).ok(),
            ParameterKind::Integer { steps: Some(s), .. } => Some(*s),
            ParameterKind::Categorical { values, .. } => Some(values.len()),
        }
    }

    /// The `index`-th grid point, computed on demand.
    ///
    /// Declared points come first; unstepped integer ranges enumerate every
    /// integer and unstepped float ranges use `default_steps` points. Both
    /// numeric endpoints are included exactly.
    pub fn grid_point(&self, index: usize, default_steps: usize) -> Option<ParameterValue> {
        if index >= self.grid_len(default_steps)? {
            return None;
        }
        match &self.kind {
            ParameterKind::Continuous {
                low,
                high,
                steps,
                scale,
            } => {
                let count = steps.unwrap_or(default_steps.max(1));
                Some(ParameterValue::Float(step_point(*low, *high, count, *scale, index)))
            }
            ParameterKind::Integer {
                low,
                steps: None,
                ..
            } => {
                let offset = i128::try_from(index).ok()?;
                i64::try_from(i128::from(*low) + offset)
                    .ok()
                    .map(ParameterValue::Int)
            }
            ParameterKind::Integer {
                low,
                high,
                steps: Some(steps),
                scale,
            } => {
                let raw = step_point(*low as f64, *high as f64, *steps, *scale, index);
                Some(ParameterValue::Int((raw.round() as i64).clamp(*low, *high)))
            }
            ParameterKind::Categorical { values, .. } => {
                values.get(index).cloned().map(ParameterValue::Json)
            }
        }
    }

    /// Index of the grid point nearest to `value` along a numeric dimension.
    /// Points are non-decreasing, so this is a binary search.
    pub(crate) fn nearest_index(&self, value: f64, default_steps: usize) -> Option<usize> {
        if let ParameterKind::Categorical { .. } = self.kind {
            return None;
        }
        let len = self.grid_len(default_steps)?;
        let at = |i: usize| {
            self.grid_point(i, default_steps)
                .and_then(|p| p.as_f64())
                .unwrap_or(f64::INFINITY)
        };
        let (mut lo, mut hi) = (0, len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if at(mid) < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == len {
            return len.checked_sub(1);
        }
        if lo > 0 && (value - at(lo - 1)).abs() <= (at(lo) - value).abs() {
            return Some(lo - 1);
        }
        Some(lo)
    }

    /// Position of `value` on this dimension's grid, if it is a grid point.
    pub fn grid_index(&self, value: &ParameterValue, default_steps: usize) -> Option<usize> {
        match (&self.kind, value) {
            (ParameterKind::Categorical { values, .. }, _) => {
                let candidate = value.to_json();
                values.iter().position(|v| json_eq(v, &candidate))
            }
            (ParameterKind::Integer { .. }, ParameterValue::Int(v)) => {
                let index = self.nearest_index(*v as f64, default_steps)?;
                (self.grid_point(index, default_steps)? == ParameterValue::Int(*v)).then_some(index)
            }
            (ParameterKind::Continuous { .. }, ParameterValue::Float(_) | ParameterValue::Int(_)) => {
                let v = value.as_f64()?;
                let index = self.nearest_index(v, default_steps)?;
                let p = self.grid_point(index, default_steps)?.as_f64()?;
                ((v - p).abs() <= ALIGN_TOLERANCE * p.abs().max(1.0)).then_some(index)
            }
            _ => None,
        }
    }

    /// Check that `value` lies within this parameter's domain.
    pub fn validate(&self, value: &ParameterValue) -> Result<(), DomainError> {
        match (&self.kind, value) {
            (
                ParameterKind::Continuous { low, high, steps, .. },
                ParameterValue::Float(_) | ParameterValue::Int(_),
            ) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                self.check_numeric(v, *low, *high)?;
                match steps {
                    Some(steps) if self.grid_index(value, 1).is_none() => {
                        Err(DomainError::Misaligned {
                            parameter: self.name.clone(),
                            value: v,
                            steps: *steps,
                        })
                    }
                    _ => Ok(()),
                }
            }
            (ParameterKind::Integer { low, high, steps, .. }, ParameterValue::Int(v)) => {
                self.check_numeric(*v as f64, *low as f64, *high as f64)?;
                match steps {
                    Some(steps) if self.grid_index(value, 1).is_none() => {
                        Err(DomainError::Misaligned {
                            parameter: self.name.clone(),
                            value: *v as f64,
                            steps: *steps,
                        })
                    }
                    _ => Ok(()),
                }
            }
            (ParameterKind::Categorical { .. }, _) => match self.grid_index(value, 1) {
                Some(_) => Ok(()),
                None => Err(DomainError::NotAChoice {
                    parameter: self.name.clone(),
                    value: value.to_json().to_string(),
                }),
            },
            (kind, value) => Err(DomainError::KindMismatch {
                parameter: self.name.clone(),
                expected: kind.label().to_string(),
                actual: value.kind_label().to_string(),
            }),
        }
    }

    fn check_numeric(&self, v: f64, low: f64, high: f64) -> Result<(), DomainError> {
        if v.is_nan() || v < low || v > high {
            return Err(DomainError::OutOfRange {
                parameter: self.name.clone(),
                value: v,
                low,
                high,
            });
        }
        Ok(())
    }
}

/// Point `i` of `count` evenly spaced points between `low` and `high`.
///
/// Endpoints are pinned so they never drift by a rounding error. The linear
/// blend never forms `high - low`, which may overflow for finite bounds.
fn step_point(low: f64, high: f64, count: usize, scale: Scale, i: usize) -> f64 {
    let last = count.saturating_sub(1);
    if i == 0 || last == 0 {
        return low;
    }
    if i >= last {
        return high;
    }
    let t = i as f64 / last as f64;
    let point = match scale {
        Scale::Linear => low * (1.0 - t) + high * t,
        Scale::Log => (low.ln() * (1.0 - t) + high.ln() * t).exp(),
    };
    point.clamp(low, high)
}

fn check_bounds(
    spec: &ParameterSpec,
    low: f64,
    high: f64,
    steps: Option<usize>,
    scale: Scale,
) -> Result<(), DomainError> {
    if low > high {
        return Err(spec.invalid(format!("low {low} is greater than high {high}")));
    }
    if steps == Some(0) {
        return Err(spec.invalid("steps must be at least 1"));
    }
    if scale == Scale::Log && low <= 0.0 {
        return Err(spec.invalid("log scale requires a positive lower bound"));
    }
    Ok(())
}

/// Numeric JSON values compare by value so `1` matches `1.0`.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// The full search space: parameter specs in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchSpace {
    parameters: Vec<ParameterSpec>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Append a spec, rejecting duplicate names.
    pub fn push(&mut self, spec: ParameterSpec) -> Result<(), DomainError> {
        if self.get(&spec.name).is_some() {
            return Err(spec.invalid("declared more than once"));
        }
        self.parameters.push(spec);
        Ok(())
    }

    pub fn add(mut self, name: impl Into<String>, kind: ParameterKind) -> Result<Self, DomainError> {
        self.push(ParameterSpec::new(name, kind)?)?;
        Ok(self)
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Result<Self, DomainError> {
        self.add(
            name,
            ParameterKind::Continuous {
                low,
                high,
                steps: None,
                scale: Scale::Linear,
            },
        )
    }

    pub fn add_stepped_float(
        self,
        name: impl Into<String>,
        low: f64,
        high: f64,
        steps: usize,
        scale: Scale,
    ) -> Result<Self, DomainError> {
        self.add(
            name,
            ParameterKind::Continuous {
                low,
                high,
                steps: Some(steps),
                scale,
            },
        )
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Result<Self, DomainError> {
        self.add(
            name,
            ParameterKind::Continuous {
                low,
                high,
                steps: None,
                scale: Scale::Log,
            },
        )
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Result<Self, DomainError> {
        self.add(
            name,
            ParameterKind::Integer {
                low,
                high,
                steps: None,
                scale: Scale::Linear,
            },
        )
    }

    pub fn add_choice(
        self,
        name: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Result<Self, DomainError> {
        self.add(
            name,
            ParameterKind::Categorical {
                values,
                weights: None,
            },
        )
    }

    /// Total number of grid cells, or `None` on overflow.
    pub fn grid_size(&self, default_steps: usize) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            total = total.checked_mul(param.grid_len(default_steps)?)?;
        }
        Some(total)
    }

    /// Whether every dimension has a declared discretization.
    pub fn is_discrete(&self) -> bool {
        self.parameters.iter().all(|p| match p.kind {
            ParameterKind::Continuous { steps, .. } => steps.is_some(),
            _ => true,
        })
    }

    /// Check every value in `sample` against its spec; unknown keys are errors.
    pub fn validate(&self, sample: &Sample) -> Result<(), DomainError> {
        for (name, value) in sample.iter() {
            let spec = self.get(name).ok_or_else(|| DomainError::InvalidSpec {
                parameter: name.to_string(),
                message: "not declared in the search space".to_string(),
            })?;
            spec.validate(value)?;
        }
        Ok(())
    }

    /// Parse a search-space declaration: a JSON object mapping dotted paths to
    /// `{type, low, high, steps, scale, values, weights}` descriptors.
    pub fn from_declaration(declaration: &serde_json::Value) -> HtResult<Self> {
        let entries = declaration.as_object().ok_or_else(|| {
            HtError::Config("search space declaration must be a JSON object".to_string())
        })?;

        let mut space = Self::new();
        for (name, raw) in entries {
            let descriptor: ParameterDescriptor = serde_json::from_value(raw.clone())?;
            let kind = descriptor.into_kind(name)?;
            space.push(ParameterSpec::new(name.clone(), kind)?)?;
        }
        Ok(space)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DescriptorType {
    Float,
    Int,
    Category,
}

/// Wire form of one entry of a search-space declaration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParameterDescriptor {
    #[serde(rename = "type")]
    kind: DescriptorType,
    low: Option<serde_json::Number>,
    high: Option<serde_json::Number>,
    steps: Option<usize>,
    scale: Option<Scale>,
    values: Option<Vec<serde_json::Value>>,
    weights: Option<Vec<f64>>,
}

impl ParameterDescriptor {
    fn into_kind(self, name: &str) -> HtResult<ParameterKind> {
        let missing = |field: &str| {
            HtError::Config(format!("parameter {name}: '{field}' is required"))
        };
        let scale = self.scale.unwrap_or_default();

        match self.kind {
            DescriptorType::Float => Ok(ParameterKind::Continuous {
                low: self.low.and_then(|n| n.as_f64()).ok_or_else(|| missing("low"))?,
                high: self.high.and_then(|n| n.as_f64()).ok_or_else(|| missing("high"))?,
                steps: self.steps,
                scale,
            }),
            DescriptorType::Int => {
                let as_int = |n: Option<serde_json::Number>, field: &str| -> HtResult<i64> {
                    let n = n.ok_or_else(|| missing(field))?;
                    n.as_i64().ok_or_else(|| {
                        HtError::Config(format!("parameter {name}: '{field}' must be an integer, got {n}"))
                    })
                };
                Ok(ParameterKind::Integer {
                    low: as_int(self.low, "low")?,
                    high: as_int(self.high, "high")?,
                    steps: self.steps,
                    scale,
                })
            }
            DescriptorType::Category => Ok(ParameterKind::Categorical {
                values: self.values.ok_or_else(|| missing("values"))?,
                weights: self.weights,
            }),
        }
    }
}
