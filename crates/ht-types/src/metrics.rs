//! Metrics reports returned by trial runners.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::HtError;

/// Reserved output-target key holding metrics aggregated over all outputs.
pub const COMBINED: &str = "combined";

/// Dataset split a metric was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl Default for Split {
    fn default() -> Self {
        Self::Validation
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = HtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" | "training" => Ok(Self::Train),
            "validation" | "vali" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            other => Err(HtError::Config(format!("unknown split '{other}'"))),
        }
    }
}

/// Metric name → value for one target on one split.
pub type SplitMetrics = BTreeMap<String, f64>;

/// Metrics produced by one trial: target → split → metric → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsReport {
    targets: BTreeMap<String, BTreeMap<Split, SplitMetrics>>,
}

impl MetricsReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a single metric value.
    pub fn with_metric(
        mut self,
        target: impl Into<String>,
        split: Split,
        metric: impl Into<String>,
        value: f64,
    ) -> Self {
        self.insert(target, split, metric, value);
        self
    }

    pub fn insert(
        &mut self,
        target: impl Into<String>,
        split: Split,
        metric: impl Into<String>,
        value: f64,
    ) {
        self.targets
            .entry(target.into())
            .or_default()
            .entry(split)
            .or_default()
            .insert(metric.into(), value);
    }

    pub fn target(&self, target: &str) -> Option<&BTreeMap<Split, SplitMetrics>> {
        self.targets.get(target)
    }

    pub fn get(&self, target: &str, split: Split, metric: &str) -> Option<f64> {
        self.targets.get(target)?.get(&split)?.get(metric).copied()
    }

    /// Iterate all values as `(target, split, metric, value)` in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Split, &str, f64)> {
        self.targets.iter().flat_map(|(target, splits)| {
            splits.iter().flat_map(move |(split, metrics)| {
                metrics
                    .iter()
                    .map(move |(metric, value)| (target.as_str(), *split, metric.as_str(), *value))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lookup() {
        let report = MetricsReport::new()
            .with_metric("label", Split::Validation, "loss", 0.42)
            .with_metric(COMBINED, Split::Validation, "loss", 0.40);

        assert_eq!(report.get("label", Split::Validation, "loss"), Some(0.42));
        assert_eq!(report.get(COMBINED, Split::Validation, "loss"), Some(0.40));
        assert_eq!(report.get("label", Split::Test, "loss"), None);
        assert_eq!(report.iter().count(), 2);
    }

    #[test]
    fn report_json_shape() {
        let report = MetricsReport::new().with_metric("label", Split::Train, "accuracy", 0.9);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({"label": {"train": {"accuracy": 0.9}}}));
    }

    #[test]
    fn split_parsing() {
        assert_eq!("validation".parse::<Split>().unwrap(), Split::Validation);
        assert_eq!("training".parse::<Split>().unwrap(), Split::Train);
        assert!("holdout".parse::<Split>().is_err());
    }
}
