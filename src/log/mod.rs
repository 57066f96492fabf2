//! Structured execution log: JSON lines per experiment.
//!
//! An experiment may write a `.jsonl` file capturing its milestones: task
//! selection, each run's start and finish, every verification phase, and
//! the gate verdict. Each line is a self-contained JSON object with an
//! RFC 3339 timestamp, so logs can be grepped or streamed.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::task::WorkerType;

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    ExperimentStarted {
        run_id: String,
        task_count: usize,
        worker_types: Vec<WorkerType>,
    },
    /// The selector picked which tasks to run.
    TasksSelected { mode: String, task_ids: Vec<String> },
    RunStarted { task_id: String, worker: WorkerType },
    /// One verification phase of a run completed (or was skipped).
    PhaseFinished {
        task_id: String,
        worker: WorkerType,
        phase: String,
        passed: bool,
        commands: usize,
    },
    RunFinished {
        task_id: String,
        worker: WorkerType,
        success: bool,
        failure_reason: Option<String>,
        duration_ms: u64,
    },
    GateEvaluated { passed: bool, reasons: Vec<String> },
    ExperimentFinished {
        run_id: String,
        runs: usize,
        report_path: Option<String>,
    },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
