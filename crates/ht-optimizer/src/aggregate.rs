//! Score extraction and trial ranking.

use serde::{Deserialize, Serialize};

use ht_types::{MetricsReport, SelectorError, Split, COMBINED};

use crate::trial::{ObjectiveDirection, TrialRecord, TrialStatus};

/// Which value of a metrics report is the trial's score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreSelector {
    pub target: String,
    pub split: Split,
    pub metric: String,
}

impl Default for ScoreSelector {
    fn default() -> Self {
        Self {
            target: COMBINED.to_string(),
            split: Split::Validation,
            metric: "loss".to_string(),
        }
    }
}

impl ScoreSelector {
    pub fn new(target: impl Into<String>, split: Split, metric: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            split,
            metric: metric.into(),
        }
    }
}

impl std::fmt::Display for ScoreSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.target, self.split, self.metric)
    }
}

/// Look up `report[target][split][metric]`.
///
/// Missing keys and non-finite values are errors: such a trial cannot be
/// ranked.
pub fn extract_score(report: &MetricsReport, selector: &ScoreSelector) -> Result<f64, SelectorError> {
    let splits = report
        .target(&selector.target)
        .ok_or_else(|| SelectorError::MissingTarget {
            target: selector.target.clone(),
        })?;
    let metrics = splits
        .get(&selector.split)
        .ok_or_else(|| SelectorError::MissingSplit {
            target: selector.target.clone(),
            split: selector.split.to_string(),
        })?;
    let value = *metrics
        .get(&selector.metric)
        .ok_or_else(|| SelectorError::MissingMetric {
            target: selector.target.clone(),
            split: selector.split.to_string(),
            metric: selector.metric.clone(),
        })?;

    if !value.is_finite() {
        return Err(SelectorError::NonFinite {
            target: selector.target.clone(),
            split: selector.split.to_string(),
            metric: selector.metric.clone(),
            value,
        });
    }
    Ok(value)
}

/// Succeeded records ordered best-first.
///
/// Ascending for minimize, descending for maximize. The sort is stable, so
/// ties keep submission order.
pub fn rank(records: &[TrialRecord], direction: ObjectiveDirection) -> Vec<TrialRecord> {
    let mut ranked: Vec<TrialRecord> = records
        .iter()
        .filter(|r| r.status == TrialStatus::Succeeded && r.score.is_some())
        .cloned()
        .collect();

    ranked.sort_by(|a, b| {
        let (a, b) = (a.score.unwrap_or(f64::NAN), b.score.unwrap_or(f64::NAN));
        match direction {
            ObjectiveDirection::Minimize => a.total_cmp(&b),
            ObjectiveDirection::Maximize => b.total_cmp(&a),
        }
    });
    ranked
}
