//! Destinations for finalized trial records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

use ht_types::HtResult;

use crate::trial::{OptimizationResult, RunState, TrialRecord};

/// Receives each trial record once it has succeeded or failed, then the
/// final result. Always called from the control thread.
pub trait ResultSink {
    fn record(&mut self, record: &TrialRecord);

    fn finish(&mut self, _result: &OptimizationResult) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn record(&mut self, _record: &TrialRecord) {}
}

/// Keeps records in memory, in the order they were finalized.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<TrialRecord>,
    pub final_state: Option<RunState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for MemorySink {
    fn record(&mut self, record: &TrialRecord) {
        self.records.push(record.clone());
    }

    fn finish(&mut self, result: &OptimizationResult) {
        self.final_state = Some(result.state);
    }
}

/// Writes one flat JSON object per trial, one per line.
///
/// Write failures are logged and counted; they never fail the run.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    failed_writes: usize,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> HtResult<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed_writes: 0,
        }
    }

    pub fn failed_writes(&self) -> usize {
        self.failed_writes
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, record: &TrialRecord) -> HtResult<()> {
        let row = serde_json::Value::Object(record.to_flat());
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> ResultSink for JsonLinesSink<W> {
    fn record(&mut self, record: &TrialRecord) {
        if let Err(e) = self.write_line(record) {
            self.failed_writes += 1;
            warn!(trial = record.trial_number, error = %e, "failed to write trial record");
        }
    }

    fn finish(&mut self, _result: &OptimizationResult) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "failed to flush trial records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ParameterValue, Sample};
    use crate::trial::ObjectiveDirection;
    use ht_types::MetricsReport;
    use uuid::Uuid;

    fn finished(n: usize, score: Option<f64>) -> TrialRecord {
        let sample = Sample::new().with("trainer.learning_rate", ParameterValue::Float(0.01));
        let mut record = TrialRecord::new(Uuid::nil(), n, sample);
        record.mark_running(None);
        match score {
            Some(s) => record.mark_succeeded(s, MetricsReport::new()),
            None => record.mark_failed("out of memory"),
        };
        record
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines_one_row_per_record() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.record(&finished(0, Some(0.3)));
        sink.record(&finished(1, None));
        let result = OptimizationResult::new(
            Uuid::nil(),
            Vec::new(),
            ObjectiveDirection::Minimize,
            RunState::Completed,
        );
        sink.finish(&result);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let rows: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["status"], "succeeded");
        assert_eq!(rows[0]["sample.trainer.learning_rate"], 0.01);
        assert_eq!(rows[1]["status"], "failed");
        assert_eq!(rows[1]["error"], "out of memory");
    }

    #[test]
    fn write_failures_are_counted_not_raised() {
        let mut sink = JsonLinesSink::new(BrokenPipe);
        sink.record(&finished(0, Some(1.0)));
        sink.record(&finished(1, Some(2.0)));
        assert_eq!(sink.failed_writes(), 2);
    }

    #[test]
    fn memory_sink_keeps_order_and_state() {
        let mut sink = MemorySink::new();
        sink.record(&finished(1, Some(0.2)));
        sink.record(&finished(0, Some(0.1)));
        let result = OptimizationResult::new(
            Uuid::nil(),
            Vec::new(),
            ObjectiveDirection::Minimize,
            RunState::Cancelled,
        );
        sink.finish(&result);
        let order: Vec<usize> = sink.records.iter().map(|r| r.trial_number).collect();
        assert_eq!(order, vec![1, 0]);
        assert_eq!(sink.final_state, Some(RunState::Cancelled));
    }
}
