//! The trial workload contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use ht_types::{MetricsReport, RunnerError};

/// Opaque dataset locations handed to every trial unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandles {
    pub training: Option<String>,
    pub validation: Option<String>,
    pub test: Option<String>,
}

impl DatasetHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_training(mut self, handle: impl Into<String>) -> Self {
        self.training = Some(handle.into());
        self
    }

    pub fn with_validation(mut self, handle: impl Into<String>) -> Self {
        self.validation = Some(handle.into());
        self
    }

    pub fn with_test(mut self, handle: impl Into<String>) -> Self {
        self.test = Some(handle.into());
        self
    }
}

/// Trains and evaluates one resolved configuration.
///
/// Implementations are called from worker threads and must be reentrant.
pub trait TrialRunner: Send + Sync {
    fn run(&self, config: &Value, datasets: &DatasetHandles) -> Result<MetricsReport, RunnerError>;
}

impl<F> TrialRunner for F
where
    F: Fn(&Value, &DatasetHandles) -> Result<MetricsReport, RunnerError> + Send + Sync,
{
    fn run(&self, config: &Value, datasets: &DatasetHandles) -> Result<MetricsReport, RunnerError> {
        self(config, datasets)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a trial, turning a panic into `RunnerError::Panicked`.
pub(crate) fn run_guarded(
    runner: &dyn TrialRunner,
    config: &Value,
    datasets: &DatasetHandles,
) -> Result<MetricsReport, RunnerError> {
    catch_unwind(AssertUnwindSafe(|| runner.run(config, datasets))).unwrap_or_else(|payload| {
        Err(RunnerError::Panicked {
            message: panic_message(payload),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ht_types::Split;
    use serde_json::json;

    #[test]
    fn closures_are_runners() {
        let runner = |config: &Value, datasets: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
            let lr = config["trainer"]["learning_rate"].as_f64().unwrap_or(0.0);
            assert_eq!(datasets.training.as_deref(), Some("train.csv"));
            Ok(MetricsReport::new().with_metric("combined", Split::Validation, "loss", lr * 10.0))
        };
        let datasets = DatasetHandles::new().with_training("train.csv");
        let report = run_guarded(&runner, &json!({"trainer": {"learning_rate": 0.5}}), &datasets).unwrap();
        assert_eq!(report.get("combined", Split::Validation, "loss"), Some(5.0));
    }

    #[test]
    fn panics_become_runner_errors() {
        let runner = |_: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
            panic!("CUDA out of memory")
        };
        let err = run_guarded(&runner, &Value::Null, &DatasetHandles::new()).unwrap_err();
        assert_eq!(
            err,
            RunnerError::Panicked {
                message: "CUDA out of memory".into()
            }
        );
    }

    #[test]
    fn failures_pass_through() {
        let runner = |_: &Value, _: &DatasetHandles| -> Result<MetricsReport, RunnerError> {
            Err(RunnerError::failed("diverged"))
        };
        let err = run_guarded(&runner, &Value::Null, &DatasetHandles::new()).unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }
}
