use thiserror::Error;

/// Main error type for the HyperTune system
#[derive(Error, Debug)]
pub enum HtError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Exhaustion error: {0}")]
    Exhausted(#[from] ExhaustionError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Selector error: {0}")]
    Selector(#[from] SelectorError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A value or parameter declaration that does not fit its domain
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{parameter}: value {value} outside [{low}, {high}]")]
    OutOfRange {
        parameter: String,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("{parameter}: value {value} is not one of the {steps} grid points")]
    Misaligned {
        parameter: String,
        value: f64,
        steps: usize,
    },

    #[error("{parameter}: {value} is not a declared choice")]
    NotAChoice { parameter: String, value: String },

    #[error("{parameter}: expected a {expected} value, got {actual}")]
    KindMismatch {
        parameter: String,
        expected: String,
        actual: String,
    },

    #[error("invalid parameter spec {parameter}: {message}")]
    InvalidSpec { parameter: String, message: String },
}

/// Sampling past the end of a finite strategy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("search strategy '{strategy}' is exhausted after {drawn} samples")]
pub struct ExhaustionError {
    pub strategy: String,
    pub drawn: usize,
}

/// A dotted parameter path that cannot be resolved in the base configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty parameter path")]
    Empty,

    #[error("path {path}: segment '{segment}' does not exist")]
    MissingSegment { path: String, segment: String },

    #[error("path {path}: index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("path {path}: segment '{segment}' is not a container")]
    NotAContainer { path: String, segment: String },
}

/// A score lookup that did not find a usable number in a metrics report
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("output target '{target}' not in report")]
    MissingTarget { target: String },

    #[error("split '{split}' not reported for target '{target}'")]
    MissingSplit { target: String, split: String },

    #[error("metric '{metric}' not reported for {target}/{split}")]
    MissingMetric {
        target: String,
        split: String,
        metric: String,
    },

    #[error("metric {target}/{split}/{metric} is not finite ({value})")]
    NonFinite {
        target: String,
        split: String,
        metric: String,
        value: f64,
    },
}

/// Failure reported by (or on behalf of) a trial runner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("trial runner failed: {message}")]
    Failed { message: String },

    #[error("trial runner panicked: {message}")]
    Panicked { message: String },

    #[error("worker {worker} lost: {message}")]
    WorkerLost { worker: String, message: String },
}

impl RunnerError {
    pub fn failed(message: impl Into<String>) -> Self {
        RunnerError::Failed {
            message: message.into(),
        }
    }
}

/// The execution substrate itself (thread pool, cluster) is unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("failed to start worker pool: {message}")]
    PoolStartup { message: String },

    #[error("worker pool disconnected with {outstanding} trials outstanding")]
    Disconnected { outstanding: usize },

    #[error("no reachable workers in cluster '{namespace}'")]
    ClusterUnreachable { namespace: String },
}

/// Result type alias for HyperTune operations
pub type HtResult<T> = Result<T, HtError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HtError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DomainError::OutOfRange {
            parameter: "trainer.learning_rate".to_string(),
            value: 2.0,
            low: 0.0,
            high: 1.0,
        };

        let text = error.to_string();
        assert!(text.contains("trainer.learning_rate"));
        assert!(text.contains("[0, 1]"));
    }

    #[test]
    fn test_error_conversion() {
        let err: HtError = SelectorError::MissingTarget {
            target: "label".to_string(),
        }
        .into();

        match err {
            HtError::Selector(_) => (),
            _ => panic!("Expected Selector error"),
        }
    }
}
