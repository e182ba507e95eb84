//! Monitoring sinks for scalars and sample images

use serde_json::{json, Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::TrackerKind;
use crate::error::{Error, Result};

pub trait Tracker: Send {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()>;

    fn log_images(&mut self, step: usize, tag: &str, paths: &[PathBuf]) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Appends one JSON object per report to `<output>/logs/metrics.jsonl`.
pub struct JsonlTracker {
    project: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTracker {
    pub fn create(logs_dir: &Path, project: &str) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .map_err(|e| Error::Logging(format!("failed to create {}: {e}", logs_dir.display())))?;
        let path = logs_dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Logging(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self {
            project: project.to_string(),
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, mut record: Map<String, Value>) -> Result<()> {
        record.insert("project".into(), json!(self.project));
        record.insert("time".into(), json!(chrono::Local::now().to_rfc3339()));
        let line = serde_json::to_string(&Value::Object(record))?;
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::Logging(format!("failed to write {}: {e}", self.path.display())))
    }
}

impl Tracker for JsonlTracker {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()> {
        let values: Map<String, Value> = scalars
            .iter()
            .map(|(name, value)| (name.to_string(), json!(value)))
            .collect();
        let mut record = Map::new();
        record.insert("step".into(), json!(step));
        record.insert("scalars".into(), Value::Object(values));
        self.write_record(record)
    }

    fn log_images(&mut self, step: usize, tag: &str, paths: &[PathBuf]) -> Result<()> {
        let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        let mut record = Map::new();
        record.insert("step".into(), json!(step));
        record.insert("tag".into(), json!(tag));
        record.insert("images".into(), json!(paths));
        self.write_record(record)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::Logging(format!("failed to flush {}: {e}", self.path.display())))
    }
}

pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn log_scalars(&mut self, _step: usize, _scalars: &[(&str, f64)]) -> Result<()> {
        Ok(())
    }

    fn log_images(&mut self, _step: usize, _tag: &str, _paths: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the configured tracker.
pub fn create_tracker(kind: TrackerKind, logs_dir: &Path, project: &str) -> Result<Box<dyn Tracker>> {
    match kind {
        TrackerKind::Jsonl => Ok(Box::new(JsonlTracker::create(logs_dir, project)?)),
        TrackerKind::None => Ok(Box::new(NoopTracker)),
    }
}

/// Front of the monitoring sink. Only the coordinator reports; sink
/// failures are logged as warnings and never reach the training loop.
pub struct Monitor {
    tracker: Option<Box<dyn Tracker>>,
    failures: usize,
}

impl Monitor {
    pub fn new(tracker: Option<Box<dyn Tracker>>) -> Self {
        Self { tracker, failures: 0 }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Sink failures swallowed so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) {
        if let Some(tracker) = self.tracker.as_mut() {
            let result = tracker.log_scalars(step, scalars);
            self.record(result);
        }
    }

    pub fn log_images(&mut self, step: usize, tag: &str, paths: &[PathBuf]) {
        if let Some(tracker) = self.tracker.as_mut() {
            let result = tracker.log_images(step, tag, paths);
            self.record(result);
        }
    }

    pub fn finish(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            let result = tracker.finish();
            self.record(result);
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.failures += 1;
            log::warn!("Monitoring report dropped: {err}");
        }
    }
}
